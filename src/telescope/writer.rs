//! Async batch writer for captured queries
//!
//! Query completion happens on the hot path of a handler, so records are
//! handed to a background task over an unbounded channel and inserted:
//! - in batches (`batch_size` records or `flush_interval`, whichever first)
//! - in one transaction per batch, followed by query retention
//!
//! [`QueryWriter::flush`] drains everything sent so far, which shutdown
//! and tests rely on.

use super::models::NewCapturedQuery;
use super::store::{CaptureStore, CaptureTable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
enum WriterMessage {
    Query(NewCapturedQuery),
    Flush(oneshot::Sender<()>),
}

/// Query writer handle
#[derive(Clone)]
pub struct QueryWriter {
    sender: mpsc::UnboundedSender<WriterMessage>,
}

impl QueryWriter {
    /// Spawn the background writer task
    ///
    /// # Example
    ///
    /// ```ignore
    /// let writer = QueryWriter::spawn(store, 100, Duration::from_millis(100));
    /// writer.write(record); // never blocks
    /// writer.flush().await;
    /// ```
    pub fn spawn(store: Arc<CaptureStore>, batch_size: usize, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            writer_task(store, rx, batch_size.max(1), flush_interval).await;
        });

        Self { sender: tx }
    }

    /// Queue a query record (non-blocking)
    pub fn write(&self, query: NewCapturedQuery) {
        if self.sender.send(WriterMessage::Query(query)).is_err() {
            tracing::warn!("Query writer is closed, dropping query record");
        }
    }

    /// Wait until every record queued before this call is persisted
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WriterMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn writer_task(
    store: Arc<CaptureStore>,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<NewCapturedQuery> = Vec::with_capacity(batch_size);

    let mut flush_timer = tokio::time::interval(flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WriterMessage::Query(query)) => {
                    batch.push(query);
                    if batch.len() >= batch_size {
                        flush_queries(&store, &mut batch).await;
                    }
                }
                Some(WriterMessage::Flush(done)) => {
                    flush_queries(&store, &mut batch).await;
                    let _ = done.send(());
                }
                // every handle dropped
                None => {
                    flush_queries(&store, &mut batch).await;
                    break;
                }
            },

            _ = flush_timer.tick() => {
                flush_queries(&store, &mut batch).await;
            }
        }
    }

    tracing::info!("Query writer task shutting down");
}

async fn flush_queries(store: &CaptureStore, batch: &mut Vec<NewCapturedQuery>) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    let start = std::time::Instant::now();

    match store.insert_queries_batch(batch).await {
        Ok(()) => {
            tracing::debug!(
                count = count,
                duration_ms = start.elapsed().as_millis(),
                "Flushed query batch"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, count = count, "Failed to flush query batch");
        }
    }

    batch.clear();

    if let Err(e) = store.enforce_retention(CaptureTable::Queries).await {
        tracing::error!(error = %e, "Query retention failed");
    }
}
