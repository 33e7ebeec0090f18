use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::stream::{self, Stream};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Instant};

const KEEP_ALIVE_DELAY: Duration = Duration::from_secs(25);
// The hosting environment gives no disconnect notification, so every
// stream session self-terminates after this long.
const MAX_DURATION: Duration = Duration::from_secs(300);

/// Fan-out point for upload notifications. Subscribers park a one-shot
/// handle here; publishing drains the queue and resolves every handle
/// with the same message.
#[derive(Clone, Default)]
pub struct Broadcaster {
    waiting: Arc<Mutex<Vec<oneshot::Sender<String>>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle that resolves with the next broadcast message.
    pub async fn subscribe(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.push(tx);
        rx
    }

    /// Notify everyone currently waiting. Returns how many subscribers
    /// were still live; receivers that went away are skipped.
    pub async fn broadcast(&self, message: &str) -> usize {
        let waiting: Vec<_> = std::mem::take(&mut *self.waiting.lock().await);
        let mut delivered = 0;
        for handle in waiting {
            if handle.send(message.to_string()).is_ok() {
                delivered += 1;
            }
        }
        tracing::info!("broadcasting to {delivered} subscribers");
        delivered
    }
}

#[derive(Clone, Copy)]
pub struct StreamOptions {
    pub keep_alive: Duration,
    pub max_duration: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            keep_alive: KEEP_ALIVE_DELAY,
            max_duration: MAX_DURATION,
        }
    }
}

struct StreamState {
    broadcaster: Broadcaster,
    client: String,
    pending: Option<oneshot::Receiver<String>>,
    deadline: Instant,
    opts: StreamOptions,
}

/// Per-client message source: yields a broadcast payload when one lands,
/// an empty string at least every `keep_alive`, and ends after
/// `max_duration`. A handle that merely timed out stays registered; only
/// a resolved handle triggers re-registration.
fn message_stream(
    broadcaster: Broadcaster,
    client: String,
    opts: StreamOptions,
) -> impl Stream<Item = String> {
    let state = StreamState {
        broadcaster,
        client,
        pending: None,
        deadline: Instant::now() + opts.max_duration,
        opts,
    };

    stream::unfold(state, |mut state| async move {
        if Instant::now() >= state.deadline {
            tracing::info!("{} stream session expired", state.client);
            return None;
        }

        let mut rx = match state.pending.take() {
            Some(rx) => rx,
            None => state.broadcaster.subscribe().await,
        };

        match timeout(state.opts.keep_alive, &mut rx).await {
            Ok(Ok(message)) => Some((message, state)),
            // Sender vanished without resolving; treat as a keep-alive
            // and register a fresh handle next turn.
            Ok(Err(_)) => Some((String::new(), state)),
            Err(_) => {
                state.pending = Some(rx);
                Some((String::new(), state))
            }
        }
    })
}

/// SSE adapter over [`message_stream`] for `GET /stream`.
pub fn event_stream(
    broadcaster: Broadcaster,
    client: String,
    opts: StreamOptions,
) -> impl Stream<Item = Result<Event, Infallible>> {
    use futures_util::StreamExt;

    message_stream(broadcaster, client, opts).map(|message| Ok(Event::default().data(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn fast_opts() -> StreamOptions {
        StreamOptions {
            keep_alive: Duration::from_millis(40),
            max_duration: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn broadcast_resolves_every_waiting_subscriber() {
        let broadcaster = Broadcaster::new();
        let rx1 = broadcaster.subscribe().await;
        let rx2 = broadcaster.subscribe().await;

        let delivered = broadcaster.broadcast("hello").await;
        assert_eq!(delivered, 2);
        assert_eq!(rx1.await.unwrap(), "hello");
        assert_eq!(rx2.await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_delivers_nothing() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.broadcast("hello").await, 0);
    }

    #[tokio::test]
    async fn broadcast_drains_the_queue() {
        let broadcaster = Broadcaster::new();
        let _rx = broadcaster.subscribe().await;

        assert_eq!(broadcaster.broadcast("first").await, 1);
        // The handle was consumed; a second publish reaches nobody.
        assert_eq!(broadcaster.broadcast("second").await, 0);
    }

    #[tokio::test]
    async fn dropped_receivers_are_counted_out() {
        let broadcaster = Broadcaster::new();
        let rx1 = broadcaster.subscribe().await;
        let rx2 = broadcaster.subscribe().await;
        drop(rx2);

        assert_eq!(broadcaster.broadcast("hello").await, 1);
        assert_eq!(rx1.await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn stream_yields_broadcast_messages() {
        let broadcaster = Broadcaster::new();
        let mut stream =
            Box::pin(message_stream(broadcaster.clone(), "test".into(), fast_opts()));

        let publisher = tokio::spawn(async move {
            // Give the stream a moment to register its handle.
            tokio::time::sleep(Duration::from_millis(10)).await;
            broadcaster.broadcast("payload").await
        });

        let first = stream.next().await.expect("stream ended early");
        assert_eq!(first, "payload");
        assert_eq!(publisher.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stream_emits_keep_alives_and_expires() {
        let broadcaster = Broadcaster::new();
        let opts = fast_opts();
        let stream = Box::pin(message_stream(broadcaster, "test".into(), opts));

        let started = Instant::now();
        let items: Vec<String> = stream.collect().await;
        let elapsed = started.elapsed();

        // Nothing was published, so every item is a keep-alive.
        assert!(!items.is_empty());
        assert!(items.iter().all(String::is_empty));
        assert!(elapsed >= opts.max_duration);
        assert!(elapsed < opts.max_duration + opts.keep_alive * 2);
    }
}
