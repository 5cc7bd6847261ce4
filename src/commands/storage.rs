//! Capture store CLI commands
//!
//! Row counts, clearing and on-demand retention.

use super::{format_number, open_store};
use crate::cli::StorageCommands;
use anyhow::Result;
use civic_telescope::config::Config;
use civic_telescope::telescope::retention::run_retention_now;
use civic_telescope::telescope::CaptureStore;
use colored::Colorize;
use std::io::{self, BufRead, Write};

/// Execute a storage subcommand
pub async fn execute(cfg: Config, action: StorageCommands) -> Result<()> {
    let store = open_store(&cfg).await?;

    match action {
        StorageCommands::Stats => show_stats(&store, &cfg).await,
        StorageCommands::Clear {
            requests,
            exceptions,
            yes,
        } => clear(&store, requests, exceptions, yes).await,
        StorageCommands::Prune => prune(&store).await,
    }
}

async fn show_stats(store: &CaptureStore, cfg: &Config) -> Result<()> {
    let stats = store.stats().await?;
    let telescope = &cfg.telescope;

    println!("{}", "Telescope Storage Statistics".bold().underline());
    println!();
    println!("{:<30} {}", "Database:", telescope.database_url);
    println!();
    println!(
        "{:<30} {:>12} / {}",
        "Requests:",
        format_number(stats.requests),
        format_number(telescope.max_requests as i64)
    );
    println!(
        "{:<30} {:>12} / {}",
        "Exceptions:",
        format_number(stats.exceptions),
        format_number(telescope.max_exceptions as i64)
    );
    println!(
        "{:<30} {:>12} / {}",
        "Queries:",
        format_number(stats.queries),
        format_number(telescope.max_queries as i64)
    );
    println!(
        "{:<30} {:>12}",
        "  Unlinked:",
        format_number(stats.unlinked_queries)
    );
    println!();

    Ok(())
}

async fn clear(store: &CaptureStore, requests: bool, exceptions: bool, yes: bool) -> Result<()> {
    // neither flag means both
    let (requests, exceptions) = if !requests && !exceptions {
        (true, true)
    } else {
        (requests, exceptions)
    };

    let what = match (requests, exceptions) {
        (true, true) => "all captured requests, queries and exceptions",
        (true, false) => "all captured requests and their queries",
        _ => "all captured exceptions",
    };

    if !yes && !confirm(&format!("Delete {}?", what))? {
        println!("{}", "Aborted".yellow());
        return Ok(());
    }

    if requests {
        let count = store.clear_all_requests().await?;
        println!("{:<30} {:>12}", "  Requests Deleted:", format_number(count as i64));
    }

    if exceptions {
        let count = store.clear_all_exceptions().await?;
        println!("{:<30} {:>12}", "  Exceptions Deleted:", format_number(count as i64));
    }

    println!("{}", "Storage cleared".green().bold());

    Ok(())
}

async fn prune(store: &CaptureStore) -> Result<()> {
    println!("{}", "Enforcing retention caps...".bold());
    println!();

    let stats = run_retention_now(store).await?;

    println!("{}", "Retention Results:".green().bold());
    println!("{:<30} {:>12}", "  Requests Deleted:", format_number(stats.requests_deleted as i64));
    println!("{:<30} {:>12}", "  Exceptions Deleted:", format_number(stats.exceptions_deleted as i64));
    println!("{:<30} {:>12}", "  Queries Deleted:", format_number(stats.queries_deleted as i64));
    println!();

    if stats.requests_deleted + stats.exceptions_deleted + stats.queries_deleted == 0 {
        println!("{}", "Nothing to prune (all tables within their caps)".dimmed());
    }

    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
