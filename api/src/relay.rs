//! Streaming relay: forwards generated chunks to the HTTP client.
//!
//! One producer task per session pulls from the backend and hands chunks to
//! the response body through a bounded channel.
//!
//! - Capacity is reserved *before* each pull, so a slow client pauses the
//!   backend instead of growing a buffer.
//! - Dropping the body (client gone) cancels the session token.  Every pull
//!   races that token, and the producer never pulls once it has seen it.
//! - A backend error is forwarded as one `Err` item, which aborts the
//!   chunked response mid-body.  Already delivered bytes stay delivered.
//! - Exhaustion drops the sender; buffered chunks drain and the body ends.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use hookscribe_common::config::Config;

use crate::generation::{ChunkStream, GenerationError};
use crate::session::{GenerationSession, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("generation cancelled")]
    Cancelled,
}

type Item = Result<Bytes, RelayError>;

/// Relay settings, shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    buffer: usize,
    pull_timeout: Option<Duration>,
}

impl Relay {
    pub fn new(buffer: usize, pull_timeout: Option<Duration>) -> Self {
        Relay {
            buffer: buffer.max(1),
            pull_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Relay::new(config.relay_buffer_chunks, config.relay_pull_timeout)
    }

    /// Spawn the producer for `session` and return the consumer side.
    ///
    /// The join handle resolves to the session's terminal state.
    pub fn start(
        &self,
        session: Arc<GenerationSession>,
        chunks: ChunkStream,
    ) -> (RelayBody, JoinHandle<SessionState>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let cancel = session.cancellation().clone();

        let body = RelayBody {
            rx: ReceiverStream::new(rx),
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
            done: false,
        };

        let task = tokio::spawn(pump(chunks, tx, session, self.pull_timeout));
        (body, task)
    }
}

/// Consumer side of a relay; used as the HTTP response body.
pub struct RelayBody {
    rx: ReceiverStream<Item>,
    cancel: CancellationToken,
    _guard: DropGuard,
    done: bool,
}

impl Stream for RelayBody {
    type Item = Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        // Nothing is delivered once cancellation has been acknowledged.
        if this.cancel.is_cancelled() {
            this.done = true;
            return Poll::Ready(Some(Err(RelayError::Cancelled)));
        }
        match this.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

enum Outcome {
    Exhausted,
    Failed,
    Cancelled,
}

async fn pump(
    mut chunks: ChunkStream,
    tx: mpsc::Sender<Item>,
    session: Arc<GenerationSession>,
    pull_timeout: Option<Duration>,
) -> SessionState {
    let cancel = session.cancellation().clone();
    let mut bytes_sent = 0usize;

    let outcome = loop {
        // Wait for room before pulling, so a stalled client stalls the backend.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Outcome::Cancelled,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break Outcome::Cancelled,
            },
        };
        if cancel.is_cancelled() {
            break Outcome::Cancelled;
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Outcome::Cancelled,
            _ = tx.closed() => break Outcome::Cancelled,
            next = pull(&mut chunks, pull_timeout) => next,
        };

        match next {
            Some(Ok(text)) => {
                if cancel.is_cancelled() {
                    break Outcome::Cancelled;
                }
                if let Err(e) = session.record_chunk(&text) {
                    warn!("Session {}: {e}", session.id());
                    break Outcome::Cancelled;
                }
                if text.is_empty() {
                    continue;
                }
                bytes_sent += text.len();
                permit.send(Ok(Bytes::from(text)));
            }
            Some(Err(e)) => {
                warn!("Session {}: backend failed mid-stream: {e}", session.id());
                permit.send(Err(RelayError::Generation(e)));
                break Outcome::Failed;
            }
            None => {
                if tx.is_closed() || cancel.is_cancelled() {
                    break Outcome::Cancelled;
                }
                break Outcome::Exhausted;
            }
        }
    };

    // Abandon the backend call before anything else.
    drop(chunks);

    let state = match outcome {
        Outcome::Exhausted => SessionState::Completed,
        Outcome::Failed => SessionState::Failed,
        Outcome::Cancelled => SessionState::Cancelled,
    };
    if let Err(e) = session.finish(state) {
        debug!("Session {}: {e}", session.id());
    }

    info!(
        "Generation session {} ended {:?} ({} chunks, {} bytes)",
        session.id(),
        session.state(),
        session.chunk_count(),
        bytes_sent
    );
    session.state()
}

/// Pull one chunk, bounded by the optional timeout.
async fn pull(
    chunks: &mut ChunkStream,
    timeout: Option<Duration>,
) -> Option<Result<String, GenerationError>> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, chunks.next()).await {
            Ok(next) => next,
            Err(_) => Some(Err(GenerationError::Timeout(limit))),
        },
        None => chunks.next().await,
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;

    fn scripted(items: Vec<Result<&'static str, GenerationError>>) -> ChunkStream {
        stream::iter(items.into_iter().map(|r| r.map(str::to_string))).boxed()
    }

    /// Endless producer that counts every chunk pulled from it.
    fn counting() -> (ChunkStream, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let chunks = stream::repeat_with(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("chunk{n};"))
        })
        .boxed();
        (chunks, pulls)
    }

    fn text(item: Item) -> String {
        String::from_utf8(item.unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_completes_and_delivers_in_order() {
        let session = Arc::new(GenerationSession::new());
        let (body, task) =
            Relay::new(4, None).start(session.clone(), scripted(vec![Ok("a"), Ok("b"), Ok("c")]));

        let received: Vec<String> = body.map(text).collect().await;
        assert_eq!(received, vec!["a", "b", "c"]);
        assert_eq!(task.await.unwrap(), SessionState::Completed);
        assert_eq!(session.output(), "abc");
    }

    #[tokio::test]
    async fn test_empty_producer_completes_from_pending() {
        let session = Arc::new(GenerationSession::new());
        let (body, task) = Relay::new(4, None).start(session.clone(), scripted(vec![]));

        let received: Vec<Item> = body.collect().await;
        assert!(received.is_empty());
        assert_eq!(task.await.unwrap(), SessionState::Completed);
        assert_eq!(session.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_mid_stream_terminates_with_error() {
        let session = Arc::new(GenerationSession::new());
        let (body, task) = Relay::new(4, None).start(
            session.clone(),
            scripted(vec![
                Ok("a"),
                Ok("b"),
                Err(GenerationError::Backend("connection reset".into())),
                Ok("never"),
            ]),
        );

        let received: Vec<Item> = body.collect().await;
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].as_ref().unwrap().as_ref(), b"a");
        assert_eq!(received[1].as_ref().unwrap().as_ref(), b"b");
        assert!(matches!(
            received[2],
            Err(RelayError::Generation(GenerationError::Backend(_)))
        ));
        assert_eq!(task.await.unwrap(), SessionState::Failed);
        assert_eq!(session.output(), "ab");
    }

    #[tokio::test]
    async fn test_disconnect_stops_pulling() {
        let (chunks, pulls) = counting();
        let session = Arc::new(GenerationSession::new());
        let (mut body, task) = Relay::new(1, None).start(session.clone(), chunks);

        let first = body.next().await.unwrap();
        assert_eq!(text(first), "chunk0;");

        drop(body);
        let pulls_at_disconnect = pulls.load(Ordering::SeqCst);

        assert_eq!(task.await.unwrap(), SessionState::Cancelled);
        assert_eq!(pulls.load(Ordering::SeqCst), pulls_at_disconnect);
        assert!(session.cancellation().is_cancelled());
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_stalled_consumer_pauses_producer() {
        let (chunks, pulls) = counting();
        let session = Arc::new(GenerationSession::new());
        let (body, task) = Relay::new(3, None).start(session.clone(), chunks);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pulls.load(Ordering::SeqCst), 3);

        drop(body);
        assert_eq!(task.await.unwrap(), SessionState::Cancelled);
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disconnect_during_slow_pull() {
        let chunks = stream::once(async { Ok("first".to_string()) })
            .chain(stream::pending())
            .boxed();
        let session = Arc::new(GenerationSession::new());
        let (mut body, task) = Relay::new(2, None).start(session.clone(), chunks);

        assert_eq!(text(body.next().await.unwrap()), "first");
        drop(body);

        let state = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("producer did not observe cancellation")
            .unwrap();
        assert_eq!(state, SessionState::Cancelled);
        assert_eq!(session.output(), "first");
    }

    #[tokio::test]
    async fn test_external_cancel_ends_body_with_error() {
        let chunks = stream::pending().boxed();
        let session = Arc::new(GenerationSession::new());
        let (mut body, task) = Relay::new(2, None).start(session.clone(), chunks);

        session.cancel();
        assert!(matches!(body.next().await, Some(Err(RelayError::Cancelled))));
        assert!(body.next().await.is_none());
        assert_eq!(task.await.unwrap(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_pull_timeout_fails_session() {
        let chunks = stream::pending().boxed();
        let session = Arc::new(GenerationSession::new());
        let (body, task) =
            Relay::new(2, Some(Duration::from_millis(20))).start(session.clone(), chunks);

        let received: Vec<Item> = body.collect().await;
        assert!(matches!(
            received.as_slice(),
            [Err(RelayError::Generation(GenerationError::Timeout(_)))]
        ));
        assert_eq!(task.await.unwrap(), SessionState::Failed);
    }
}
