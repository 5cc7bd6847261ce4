use anyhow::Result;
use civic_telescope::{config::Config, server};
use colored::Colorize;
use tracing::info;

/// Execute the start command
///
/// Blocks until the server shuts down.
pub async fn execute(cfg: Config) -> Result<()> {
    println!("{}", "Starting civic-telescope in foreground mode...".green());

    if !cfg.telescope.enabled {
        println!("{}", "Telescope capture is disabled".yellow());
    }

    info!(
        host = %cfg.server.host,
        port = cfg.server.port,
        "Starting server"
    );

    server::start_server(cfg).await?;

    Ok(())
}
