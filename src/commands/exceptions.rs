//! `exceptions` CLI commands

use super::{format_number, open_store};
use crate::cli::ExceptionsCommands;
use anyhow::{Context, Result};
use civic_telescope::config::Config;
use civic_telescope::telescope::models::ExceptionFilter;
use civic_telescope::telescope::CaptureStore;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

const MESSAGE_PREVIEW_CHARS: usize = 80;

/// Execute an exceptions subcommand
pub async fn execute(cfg: Config, action: ExceptionsCommands) -> Result<()> {
    let store = open_store(&cfg).await?;

    match action {
        ExceptionsCommands::List {
            kind,
            search,
            limit,
            offset,
            json,
        } => {
            let filter = ExceptionFilter {
                kind,
                search,
                limit: Some(limit),
                offset: Some(offset),
            };
            list(&store, &filter, json).await
        }
        ExceptionsCommands::Show { uuid, json } => show(&store, &uuid, json).await,
    }
}

async fn list(store: &CaptureStore, filter: &ExceptionFilter, json: bool) -> Result<()> {
    let (exceptions, total) = store.list_exceptions(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exceptions)?);
        return Ok(());
    }

    if exceptions.is_empty() {
        println!("{}", "No captured exceptions match the filters".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("UUID").fg(Color::Cyan),
        Cell::new("TIME").fg(Color::Cyan),
        Cell::new("TYPE").fg(Color::Cyan),
        Cell::new("CODE").fg(Color::Cyan),
        Cell::new("MESSAGE").fg(Color::Cyan),
        Cell::new("LOCATION").fg(Color::Cyan),
    ]);

    for exc in &exceptions {
        let message: String = exc.message.chars().take(MESSAGE_PREVIEW_CHARS).collect();
        let location = match (&exc.file, exc.line) {
            (Some(file), Some(line)) => format!("{}:{}", file, line),
            (Some(file), None) => file.clone(),
            _ => "-".to_string(),
        };

        table.add_row(vec![
            Cell::new(&exc.uuid),
            Cell::new(exc.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&exc.kind).fg(Color::Red),
            Cell::new(exc.code.as_deref().unwrap_or("-")),
            Cell::new(message),
            Cell::new(location),
        ]);
    }

    println!("{table}");
    println!(
        "Showing {} of {} captured exceptions",
        exceptions.len(),
        format_number(total)
    );

    Ok(())
}

async fn show(store: &CaptureStore, uuid: &str, json: bool) -> Result<()> {
    let exc = store
        .get_exception_by_uuid(uuid)
        .await?
        .with_context(|| format!("No captured exception with uuid {}", uuid))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exc)?);
        return Ok(());
    }

    println!("{}: {}", exc.kind.red().bold(), exc.message);
    println!();
    println!("{:<12} {}", "UUID:".bold(), exc.uuid);
    println!("{:<12} {}", "Time:".bold(), exc.created_at.to_rfc3339());
    println!("{:<12} {}", "Code:".bold(), exc.code.as_deref().unwrap_or("-"));
    if let Some(file) = &exc.file {
        println!(
            "{:<12} {}:{}",
            "Location:".bold(),
            file,
            exc.line.map(|l| l.to_string()).unwrap_or_default()
        );
    }

    if !exc.context.is_null() {
        println!();
        println!("{}", "Context".bold().underline());
        println!("{}", serde_json::to_string_pretty(&exc.context)?);
    }

    if let Some(stack) = &exc.stack_trace {
        println!();
        println!("{}", "Stack trace".bold().underline());
        println!("{}", stack.dimmed());
    }

    Ok(())
}
