use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use civic_telescope::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let command = args.get_command();

    let cfg = config::load_config(&args.config)?;

    // Inspection commands stay quiet unless RUST_LOG says otherwise
    let level = match command {
        cli::Commands::Start => cfg.server.log_level.as_str(),
        _ => "warn",
    };
    init_tracing(level, &cfg.server.log_format);

    match command {
        cli::Commands::Start => {
            commands::start::execute(cfg).await?;
        }
        cli::Commands::Requests { action } => {
            commands::requests::execute(cfg, action).await?;
        }
        cli::Commands::Exceptions { action } => {
            commands::exceptions::execute(cfg, action).await?;
        }
        cli::Commands::Storage { action } => {
            commands::storage::execute(cfg, action).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&cfg)?,
            cli::ConfigCommands::Validate => commands::config::validate(&cfg)?,
        },
        cli::Commands::Version => {
            println!("civic-telescope v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
