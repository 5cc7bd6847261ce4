//! `requests` CLI commands

use super::{colored_status, format_duration, format_number, open_store};
use crate::cli::RequestsCommands;
use anyhow::{Context, Result};
use civic_telescope::config::Config;
use civic_telescope::telescope::models::{RequestDetail, RequestFilter};
use civic_telescope::telescope::CaptureStore;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

/// Execute a requests subcommand
pub async fn execute(cfg: Config, action: RequestsCommands) -> Result<()> {
    let store = open_store(&cfg).await?;

    match action {
        RequestsCommands::List {
            method,
            status,
            user,
            search,
            limit,
            offset,
            json,
        } => {
            let filter = RequestFilter {
                method,
                status_code: status,
                user_id: user,
                search,
                limit: Some(limit),
                offset: Some(offset),
            };
            list(&store, &filter, json).await
        }
        RequestsCommands::Show { uuid, json } => show(&store, &uuid, json).await,
    }
}

async fn list(store: &CaptureStore, filter: &RequestFilter, json: bool) -> Result<()> {
    let (requests, total) = store.list_requests(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }

    if requests.is_empty() {
        println!("{}", "No captured requests match the filters".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("UUID").fg(Color::Cyan),
        Cell::new("TIME").fg(Color::Cyan),
        Cell::new("METHOD").fg(Color::Cyan),
        Cell::new("PATH").fg(Color::Cyan),
        Cell::new("STATUS").fg(Color::Cyan),
        Cell::new("DURATION").fg(Color::Cyan),
        Cell::new("USER").fg(Color::Cyan),
        Cell::new("EXCEPTION").fg(Color::Cyan),
    ]);

    for req in &requests {
        let status_color = match req.status_code {
            500.. => Color::Red,
            400..=499 => Color::Yellow,
            _ => Color::Green,
        };

        table.add_row(vec![
            Cell::new(&req.uuid),
            Cell::new(req.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&req.method),
            Cell::new(&req.path),
            Cell::new(req.status_code).fg(status_color),
            Cell::new(format_duration(req.duration_ms)),
            Cell::new(req.user_id.as_deref().unwrap_or("-")),
            Cell::new(if req.exception_id.is_some() { "yes" } else { "" }),
        ]);
    }

    println!("{table}");
    println!(
        "Showing {} of {} captured requests",
        requests.len(),
        format_number(total)
    );

    Ok(())
}

async fn show(store: &CaptureStore, uuid: &str, json: bool) -> Result<()> {
    let request = store
        .get_request_by_uuid(uuid)
        .await?
        .with_context(|| format!("No captured request with uuid {}", uuid))?;
    let queries = store.queries_for_request(request.id).await?;

    if json {
        let detail = RequestDetail { request, queries };
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    println!(
        "{} {} {}",
        request.method.bold(),
        request.path,
        colored_status(request.status_code)
    );
    println!();
    println!("{:<16} {}", "UUID:".bold(), request.uuid);
    println!("{:<16} {}", "URL:".bold(), request.full_url);
    println!("{:<16} {}", "Time:".bold(), request.created_at.to_rfc3339());
    println!("{:<16} {}", "Duration:".bold(), format_duration(request.duration_ms));
    println!("{:<16} {}", "IP:".bold(), request.ip_address.as_deref().unwrap_or("-"));
    println!("{:<16} {}", "User agent:".bold(), request.user_agent.as_deref().unwrap_or("-"));
    println!("{:<16} {}", "User:".bold(), request.user_id.as_deref().unwrap_or("-"));

    if let Some(exception_id) = request.exception_id {
        match store.get_exception_by_id(exception_id).await? {
            Some(exc) => println!(
                "{:<16} {} {} ({})",
                "Exception:".bold(),
                exc.kind.red(),
                exc.message,
                exc.uuid.dimmed()
            ),
            None => println!("{:<16} #{}", "Exception:".bold(), exception_id),
        }
    }

    for (label, value) in [
        ("Headers", &request.headers),
        ("Query", &request.query_params),
        ("Body", &request.body_params),
        ("Response", &request.response_body),
    ] {
        if !value.is_null() {
            println!();
            println!("{}", label.bold().underline());
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }

    println!();
    println!("{}", format!("Queries ({})", queries.len()).bold().underline());
    for (i, query) in queries.iter().enumerate() {
        println!(
            "{:>3}. {} {}",
            i + 1,
            format_duration(query.duration_ms).dimmed(),
            query.sql
        );
    }

    Ok(())
}
