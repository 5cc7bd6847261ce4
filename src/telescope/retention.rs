//! Periodic retention sweep
//!
//! Caps are enforced after every insert already; the sweep catches tables
//! that grew while a cap was lowered and keeps the CLI `prune` path honest.

use super::models::RetentionStats;
use super::store::CaptureStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Spawn the background sweep, running every `interval`
///
/// # Example
///
/// ```ignore
/// spawn_retention_task(store.clone(), Duration::from_secs(3600));
/// ```
pub fn spawn_retention_task(
    store: Arc<CaptureStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        retention_loop(store, interval).await;
    })
}

async fn retention_loop(store: Arc<CaptureStore>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match store.enforce_all_retention().await {
            Ok(stats) => {
                if stats.requests_deleted + stats.exceptions_deleted + stats.queries_deleted > 0 {
                    tracing::info!(
                        requests_deleted = stats.requests_deleted,
                        exceptions_deleted = stats.exceptions_deleted,
                        queries_deleted = stats.queries_deleted,
                        "Retention sweep completed"
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Retention sweep failed");
            }
        }
    }
}

/// Run a sweep immediately (manual `prune`)
pub async fn run_retention_now(store: &CaptureStore) -> Result<RetentionStats> {
    tracing::info!("Running manual retention sweep");

    let stats = store.enforce_all_retention().await?;

    tracing::info!(
        requests_deleted = stats.requests_deleted,
        exceptions_deleted = stats.exceptions_deleted,
        queries_deleted = stats.queries_deleted,
        "Manual retention sweep completed"
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelescopeConfig;
    use crate::telescope::models::NewCapturedQuery;

    #[tokio::test]
    async fn test_run_retention_now() {
        let mut config = TelescopeConfig::in_memory();
        config.max_queries = 2;
        let store = CaptureStore::connect(Arc::new(config)).await.unwrap();

        let batch: Vec<_> = (0..5)
            .map(|i| NewCapturedQuery {
                sql: format!("SELECT {}", i),
                duration_ms: 0,
                request_id: None,
                correlation_id: None,
                bindings: None,
                created_at: 1_700_000_000_000 + i,
            })
            .collect();
        store.insert_queries_batch(&batch).await.unwrap();

        let stats = run_retention_now(&store).await.unwrap();
        assert_eq!(stats.queries_deleted, 3);
        assert_eq!(stats.requests_deleted, 0);

        let stats = run_retention_now(&store).await.unwrap();
        assert_eq!(stats.queries_deleted, 0);
    }
}
