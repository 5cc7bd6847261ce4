//! Command implementations for the CLI
//!
//! - start: Start the server
//! - requests: List and show captured requests
//! - exceptions: List and show captured exceptions
//! - storage: Capture store stats, clearing and pruning
//! - config: Configuration display and validation

pub mod config;
pub mod exceptions;
pub mod requests;
pub mod start;
pub mod storage;

use anyhow::Result;
use civic_telescope::config::Config;
use civic_telescope::telescope::CaptureStore;
use colored::{ColoredString, Colorize};
use std::sync::Arc;

/// Open the capture store named in the configuration
pub(crate) async fn open_store(cfg: &Config) -> Result<CaptureStore> {
    CaptureStore::connect(Arc::new(cfg.telescope.clone())).await
}

/// Format large numbers with commas
pub(crate) fn format_number(n: i64) -> String {
    let s = n.unsigned_abs().to_string();
    let mut result = String::new();

    for (count, ch) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }

    if n < 0 {
        result.push('-');
    }

    result.chars().rev().collect()
}

/// Format duration
pub(crate) fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.2}s", ms as f64 / 1000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

/// Status code colored by class
pub(crate) fn colored_status(status: i64) -> ColoredString {
    let text = status.to_string();
    match status {
        500.. => text.red().bold(),
        400..=499 => text.yellow(),
        300..=399 => text.cyan(),
        _ => text.green(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(-4200), "-4,200");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45ms");
        assert_eq!(format_duration(1500), "1.50s");
        assert_eq!(format_duration(125_000), "2m 5s");
    }
}
