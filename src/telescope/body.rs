//! Body tee
//!
//! [`TeeBody`] forwards every frame of an inner body untouched while copying
//! data frames into a bounded buffer. When the stream ends (or the body is
//! dropped early, e.g. on client disconnect) the finish observer receives
//! the captured bytes. Used for both directions: the request side reads the
//! copy through [`BodySnapshot`], the response side persists in the observer.

use axum::body::{Body, Bytes};
use http_body::{Frame, SizeHint};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Bytes seen by a tee, capped at its limit
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Total bytes that passed through, including those beyond the limit
    pub total: usize,
    pub truncated: bool,
    /// Whether the stream reached its end
    pub complete: bool,
}

type FinishObserver = Box<dyn FnOnce(Captured) + Send + 'static>;

/// Shared view of what a request-side tee has captured so far
#[derive(Debug, Clone, Default)]
pub struct BodySnapshot {
    inner: Arc<Mutex<Captured>>,
}

impl BodySnapshot {
    /// Current capture, or `None` if nothing was read
    pub fn take(&self) -> Option<Captured> {
        let guard = self.inner.lock().ok()?;
        if guard.total == 0 && !guard.complete {
            None
        } else {
            Some(guard.clone())
        }
    }
}

/// Frame-forwarding body that keeps a bounded copy of its data
pub struct TeeBody {
    inner: Body,
    limit: usize,
    captured: Captured,
    snapshot: Option<BodySnapshot>,
    on_finish: Option<FinishObserver>,
    finished: bool,
}

impl TeeBody {
    pub fn new(inner: Body, limit: usize) -> Self {
        Self {
            inner,
            limit,
            captured: Captured::default(),
            snapshot: None,
            on_finish: None,
            finished: false,
        }
    }

    /// Mirror the capture into a snapshot readable from outside the body
    pub fn with_snapshot(mut self, snapshot: BodySnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Call `observer` once, at end of stream or on drop
    pub fn on_finish<F>(mut self, observer: F) -> Self
    where
        F: FnOnce(Captured) + Send + 'static,
    {
        self.on_finish = Some(Box::new(observer));
        self
    }

    pub fn into_body(self) -> Body {
        Body::new(self)
    }

    fn record(&mut self, data: &Bytes) {
        self.captured.total += data.len();

        let room = self.limit.saturating_sub(self.captured.bytes.len());
        if data.len() > room {
            self.captured.truncated = true;
        }
        self.captured.bytes.extend_from_slice(&data[..data.len().min(room)]);

        self.sync_snapshot();
    }

    fn sync_snapshot(&self) {
        if let Some(snapshot) = &self.snapshot {
            if let Ok(mut shared) = snapshot.inner.lock() {
                *shared = self.captured.clone();
            }
        }
    }

    fn finish(&mut self, complete: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        if complete {
            self.captured.complete = true;
            self.sync_snapshot();
        }

        if let Some(observer) = self.on_finish.take() {
            observer(std::mem::take(&mut self.captured));
        }
    }
}

impl http_body::Body for TeeBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        // every field is Unpin, so the body can be projected by hand
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.record(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        let complete = http_body::Body::is_end_stream(&self.inner);
        self.finish(complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[tokio::test]
    async fn test_passthrough_and_capture() {
        let (tx, rx) = mpsc::channel();
        let body = TeeBody::new(Body::from("hello world"), 1024)
            .on_finish(move |captured| {
                let _ = tx.send(captured);
            })
            .into_body();

        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");

        let captured = rx.recv().unwrap();
        assert_eq!(captured.bytes, b"hello world");
        assert_eq!(captured.total, 11);
        assert!(!captured.truncated);
        assert!(captured.complete);
    }

    #[tokio::test]
    async fn test_copy_is_bounded_but_client_gets_everything() {
        let (tx, rx) = mpsc::channel();
        let payload = "x".repeat(500);
        let body = TeeBody::new(Body::from(payload.clone()), 100)
            .on_finish(move |captured| {
                let _ = tx.send(captured);
            })
            .into_body();

        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 500);

        let captured = rx.recv().unwrap();
        assert_eq!(captured.bytes.len(), 100);
        assert_eq!(captured.total, 500);
        assert!(captured.truncated);
    }

    #[test]
    fn test_observer_fires_on_drop() {
        let (tx, rx) = mpsc::channel();
        let body = TeeBody::new(Body::from("unread"), 1024).on_finish(move |captured| {
            let _ = tx.send(captured);
        });
        drop(body);

        let captured = rx.recv().unwrap();
        assert!(captured.bytes.is_empty());
    }

    #[test]
    fn test_drop_of_empty_body_counts_as_complete() {
        let (tx, rx) = mpsc::channel();
        let body = TeeBody::new(Body::empty(), 1024).on_finish(move |captured| {
            let _ = tx.send(captured);
        });
        drop(body);

        let captured = rx.recv().unwrap();
        assert!(captured.complete);
        assert_eq!(captured.total, 0);
    }

    #[test]
    fn test_size_hint_preserved() {
        let body = TeeBody::new(Body::from("12345"), 2);
        assert_eq!(http_body::Body::size_hint(&body).exact(), Some(5));
    }

    #[tokio::test]
    async fn test_snapshot_visible_after_read() {
        let snapshot = BodySnapshot::default();
        assert!(snapshot.take().is_none());

        let body = TeeBody::new(Body::from(r#"{"title":"Ward meeting"}"#), 1024)
            .with_snapshot(snapshot.clone())
            .into_body();
        axum::body::to_bytes(body, usize::MAX).await.unwrap();

        let captured = snapshot.take().unwrap();
        assert!(captured.complete);
        assert_eq!(captured.bytes, br#"{"title":"Ward meeting"}"#);
    }
}
