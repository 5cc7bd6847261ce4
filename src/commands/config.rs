use anyhow::Result;
use civic_telescope::config::Config;
use colored::Colorize;
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration (file plus environment overrides)
pub fn show(cfg: &Config) -> Result<()> {
    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(cfg)?;
    println!("{}", toml_string);

    info!("Configuration displayed successfully");
    Ok(())
}

/// Execute the config validate command
///
/// Loading already validated the file; this prints a summary
pub fn validate(cfg: &Config) -> Result<()> {
    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Listen: {}:{}", cfg.server.host, cfg.server.port);
    println!(
        "  Telescope: {}",
        if cfg.telescope.enabled { "enabled".green() } else { "disabled".yellow() }
    );
    println!("  Dashboard: {}", cfg.telescope.dashboard_path);
    println!("  Excluded paths: {}", cfg.telescope.excluded_paths.join(", "));
    println!(
        "  Retention caps: {} requests, {} exceptions, {} queries",
        cfg.telescope.max_requests, cfg.telescope.max_exceptions, cfg.telescope.max_queries
    );

    Ok(())
}
