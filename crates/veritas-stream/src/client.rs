use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use veritas_core::{SessionId, StreamError, StreamEvent};

use crate::decode::decode_frame;
use crate::transport::EventSource;

/// One live subscription. Taken out of [`Shared::live`] exactly once, by
/// whichever of disconnect or stream end gets there first.
struct Subscription {
    session_id: SessionId,
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    live: Mutex<Option<Subscription>>,
    connected: AtomicBool,
    generation: AtomicU64,
    closed: AtomicUsize,
}

impl Shared {
    fn mark_connected(&self, generation: u64) -> bool {
        let live = self.live.lock();
        let current = live.as_ref().is_some_and(|s| s.generation == generation);
        if current {
            self.connected.store(true, Ordering::SeqCst);
        }
        current
    }

    /// Release the subscription if it is still the one `generation` names.
    fn finish(&self, generation: u64, reason: &'static str) -> Option<Subscription> {
        let taken = {
            let mut live = self.live.lock();
            match live.as_ref() {
                Some(sub) if sub.generation == generation => live.take(),
                _ => None,
            }
        };
        if let Some(sub) = &taken {
            self.teardown(sub, reason);
        }
        taken
    }

    fn teardown(&self, sub: &Subscription, reason: &'static str) {
        self.connected.store(false, Ordering::SeqCst);
        sub.cancel.cancel();
        self.closed.fetch_add(1, Ordering::SeqCst);
        info!(session_id = %sub.session_id, reason, "event stream closed");
    }
}

/// Owns at most one live subscription to an [`EventSource`] and feeds its
/// decoded events to a handler in arrival order.
///
/// Dropping the client disconnects it.
pub struct EventStreamClient<S: EventSource> {
    source: Arc<S>,
    shared: Arc<Shared>,
}

impl<S: EventSource> EventStreamClient<S> {
    pub fn new(source: S) -> Self {
        Self::from_shared(Arc::new(source))
    }

    pub fn from_shared(source: Arc<S>) -> Self {
        Self {
            source,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Open a subscription for `session_id` and deliver its events to
    /// `handler`. Heartbeats never reach the handler.
    ///
    /// A no-op returning `false` while a subscription is live. Must be called
    /// from within a tokio runtime.
    pub fn connect<F>(&self, session_id: SessionId, handler: F) -> bool
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        let mut live = self.shared.live.lock();
        if let Some(existing) = live.as_ref() {
            if existing.session_id == session_id {
                debug!(session_id = %session_id, "already connected, ignoring connect");
            } else {
                warn!(
                    live = %existing.session_id,
                    requested = %session_id,
                    "subscription already live, ignoring connect for another session"
                );
            }
            return false;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.source),
            Arc::clone(&self.shared),
            session_id.clone(),
            generation,
            cancel.clone(),
            handler,
        ));
        debug!(session_id = %session_id, generation, "event stream connecting");
        *live = Some(Subscription {
            session_id,
            generation,
            cancel,
            task,
        });
        true
    }

    /// Tear down the live subscription, if any. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let taken = self.shared.live.lock().take();
        match taken {
            Some(sub) => {
                self.shared.teardown(&sub, "disconnect");
                sub.task.abort();
            }
            None => trace!("disconnect without a live subscription"),
        }
    }

    /// True between the transport opening and the subscription ending.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Session of the live subscription, connected or still opening.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.live.lock().as_ref().map(|s| s.session_id.clone())
    }

    /// Subscriptions torn down over this client's lifetime.
    pub fn closed_count(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl<S: EventSource> Drop for EventStreamClient<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_subscription<S, F>(
    source: Arc<S>,
    shared: Arc<Shared>,
    session_id: SessionId,
    generation: u64,
    cancel: CancellationToken,
    mut handler: F,
) where
    S: EventSource,
    F: FnMut(StreamEvent) + Send + 'static,
{
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = source.open(&session_id) => opened,
    };
    let mut frames = match opened {
        Ok(frames) => frames,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, kind = err.error_kind(), "failed to open event stream");
            handler(StreamEvent::transport_error(&err));
            shared.finish(generation, "open failed");
            return;
        }
    };
    if !shared.mark_connected(generation) {
        return;
    }
    info!(session_id = %session_id, "event stream connected");

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = frames.next() => next,
        };
        let err = match next {
            Some(Ok(raw)) => match decode_frame(&raw) {
                Ok(event) if event.is_heartbeat() => {
                    trace!(session_id = %session_id, "heartbeat");
                    continue;
                }
                Ok(event) => {
                    let terminal = event.is_terminal();
                    trace!(session_id = %session_id, kind = event.kind(), "event");
                    handler(event);
                    if terminal {
                        break "terminal event";
                    }
                    continue;
                }
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, kind = err.error_kind(), "dropping undecodable frame");
                    continue;
                }
            },
            Some(Err(err)) => err,
            None => StreamError::ClosedEarly,
        };
        warn!(session_id = %session_id, error = %err, kind = err.error_kind(), "event stream failed");
        handler(StreamEvent::transport_error(&err));
        break "transport error";
    };

    shared.finish(generation, reason);
    drop(frames);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;
    use veritas_core::events::ErrorOrigin;

    use super::*;
    use crate::transport::FrameStream;

    type Feed = mpsc::Sender<Result<String, StreamError>>;

    struct DropGuard(Arc<AtomicUsize>);

    impl Drop for DropGuard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands out pre-registered channels, one per `open`.
    #[derive(Default)]
    struct ScriptedSource {
        opens: AtomicUsize,
        drops: Arc<AtomicUsize>,
        feeds: Mutex<VecDeque<Result<mpsc::Receiver<Result<String, StreamError>>, StreamError>>>,
    }

    impl ScriptedSource {
        fn with_feed() -> (Self, Feed) {
            let source = Self::default();
            let (tx, rx) = mpsc::channel(64);
            source.feeds.lock().push_back(Ok(rx));
            (source, tx)
        }

        fn failing(err: StreamError) -> Self {
            let source = Self::default();
            source.feeds.lock().push_back(Err(err));
            source
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn open(&self, _session_id: &SessionId) -> Result<FrameStream, StreamError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let rx = self
                .feeds
                .lock()
                .pop_front()
                .unwrap_or(Err(StreamError::Network("no scripted feed".into())))?;
            let guard = DropGuard(Arc::clone(&self.drops));
            Ok(Box::pin(ReceiverStream::new(rx).map(move |item| {
                let _ = &guard;
                item
            })))
        }
    }

    fn collector() -> (impl FnMut(StreamEvent) + Send + 'static, Arc<Mutex<Vec<StreamEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (move |event| sink.lock().push(event), seen)
    }

    async fn settle(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    fn frame(raw: &str) -> Result<String, StreamError> {
        Ok(raw.to_string())
    }

    #[tokio::test]
    async fn ping_is_filtered_and_done_closes() {
        let (source, feed) = ScriptedSource::with_feed();
        let client = EventStreamClient::new(source);
        let (handler, seen) = collector();
        assert!(client.connect(SessionId::from_raw("s1"), handler));

        feed.send(frame(r#"{"type":"ping"}"#)).await.unwrap();
        feed.send(frame(r#"{"type":"stage_start","message":"C1","data":{"stage":"C1"}}"#)).await.unwrap();
        feed.send(frame(r#"{"type":"stage_content","data":{"stage":"C1","content":"..."}}"#)).await.unwrap();
        feed.send(frame(r#"{"type":"done","message":"Complete"}"#)).await.unwrap();

        let drops = Arc::clone(&client.source.drops);
        settle(|| drops.load(Ordering::SeqCst) == 1).await;

        let kinds: Vec<_> = seen.lock().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, ["stage_start", "stage_content", "done"]);
        assert!(!client.is_connected());
        assert_eq!(client.session_id(), None);
        assert_eq!(client.closed_count(), 1);
        assert!(feed.is_closed());
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_bad_frames_are_dropped() {
        let (source, feed) = ScriptedSource::with_feed();
        let client = EventStreamClient::new(source);
        let (handler, seen) = collector();
        client.connect(SessionId::from_raw("s1"), handler);

        for i in 0..20 {
            feed.send(frame(&format!(r#"{{"type":"status","message":"m{i}"}}"#))).await.unwrap();
            if i % 5 == 0 {
                feed.send(frame(r#"{"type":"ping"}"#)).await.unwrap();
                feed.send(frame("{garbage")).await.unwrap();
                feed.send(frame(r#"{"type":"unheard_of"}"#)).await.unwrap();
            }
        }
        let seen_ref = Arc::clone(&seen);
        settle(|| seen_ref.lock().len() == 20).await;
        assert!(client.is_connected());

        let messages: Vec<String> = seen
            .lock()
            .iter()
            .map(|e| match e {
                StreamEvent::Status { message } => message.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(messages, expected);
    }

    #[tokio::test]
    async fn second_connect_is_a_noop() {
        let (source, feed) = ScriptedSource::with_feed();
        let client = EventStreamClient::new(source);
        let (first, seen) = collector();
        let (second, other) = collector();
        assert!(client.connect(SessionId::from_raw("s1"), first));
        assert!(!client.connect(SessionId::from_raw("s1"), second));
        assert!(!client.connect(SessionId::from_raw("s2"), |_| {}));

        feed.send(frame(r#"{"type":"connected"}"#)).await.unwrap();
        let seen_ref = Arc::clone(&seen);
        settle(|| seen_ref.lock().len() == 1).await;

        assert_eq!(client.source.opens.load(Ordering::SeqCst), 1);
        assert!(other.lock().is_empty());
        assert_eq!(client.session_id(), Some(SessionId::from_raw("s1")));
    }

    #[tokio::test]
    async fn error_frame_tears_down_once() {
        let (source, feed) = ScriptedSource::with_feed();
        let client = EventStreamClient::new(source);
        let (handler, seen) = collector();
        client.connect(SessionId::from_raw("s1"), handler);

        feed.send(frame(r#"{"type":"error","message":"Pipeline failed","data":{"error":"boom"}}"#)).await.unwrap();
        feed.send(frame(r#"{"type":"status","message":"late"}"#)).await.ok();

        let drops = Arc::clone(&client.source.drops);
        settle(|| drops.load(Ordering::SeqCst) == 1).await;
        client.disconnect();
        client.disconnect();

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(client.closed_count(), 1);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn transport_error_forwards_synthetic_error_then_closes() {
        let (source, feed) = ScriptedSource::with_feed();
        let client = EventStreamClient::new(source);
        let (handler, seen) = collector();
        client.connect(SessionId::from_raw("s1"), handler);

        feed.send(frame(r#"{"type":"starting"}"#)).await.unwrap();
        feed.send(Err(StreamError::Interrupted("reset".into()))).await.unwrap();

        let drops = Arc::clone(&client.source.drops);
        settle(|| drops.load(Ordering::SeqCst) == 1).await;
        client.disconnect();

        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StreamEvent::Error { origin: ErrorOrigin::Transport, detail: Some(d), .. } if d.contains("reset")
        ));
        assert_eq!(client.closed_count(), 1);
    }

    #[tokio::test]
    async fn stream_ending_without_terminal_is_an_error() {
        let (source, feed) = ScriptedSource::with_feed();
        let client = EventStreamClient::new(source);
        let (handler, seen) = collector();
        client.connect(SessionId::from_raw("s1"), handler);

        feed.send(frame(r#"{"type":"starting"}"#)).await.unwrap();
        drop(feed);

        let closed = Arc::clone(&client.shared);
        settle(|| closed.closed.load(Ordering::SeqCst) == 1).await;
        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StreamEvent::Error { detail: Some(d), .. } if d.contains("without a terminal")
        ));
    }

    #[tokio::test]
    async fn open_failure_is_reported_and_clears_subscription() {
        let client = EventStreamClient::new(ScriptedSource::failing(StreamError::Status {
            status: 503,
            body: "busy".into(),
        }));
        let (handler, seen) = collector();
        client.connect(SessionId::from_raw("s1"), handler);

        let shared = Arc::clone(&client.shared);
        settle(|| shared.closed.load(Ordering::SeqCst) == 1).await;
        assert!(!client.is_connected());
        assert_eq!(client.session_id(), None);
        assert!(matches!(&seen.lock()[0], StreamEvent::Error { origin: ErrorOrigin::Transport, .. }));
    }

    #[tokio::test]
    async fn explicit_disconnect_releases_transport_and_allows_reconnect() {
        let (source, feed) = ScriptedSource::with_feed();
        let (tx2, rx2) = mpsc::channel(8);
        source.feeds.lock().push_back(Ok(rx2));
        let client = EventStreamClient::new(source);

        let (handler, seen) = collector();
        client.connect(SessionId::from_raw("s1"), handler);
        feed.send(frame(r#"{"type":"connected"}"#)).await.unwrap();
        let shared = Arc::clone(&client.shared);
        settle(|| shared.connected.load(Ordering::SeqCst)).await;

        client.disconnect();
        client.disconnect();
        let drops = Arc::clone(&client.source.drops);
        settle(|| drops.load(Ordering::SeqCst) == 1).await;
        assert!(!client.is_connected());
        assert_eq!(client.closed_count(), 1);
        assert!(seen.lock().iter().all(|e| !e.is_terminal()));

        let (handler, _) = collector();
        assert!(client.connect(SessionId::from_raw("s2"), handler));
        tx2.send(frame(r#"{"type":"connected"}"#)).await.unwrap();
        settle(|| shared.connected.load(Ordering::SeqCst)).await;
        assert_eq!(client.source.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_client_releases_transport() {
        let (source, feed) = ScriptedSource::with_feed();
        let drops = Arc::clone(&source.drops);
        let client = EventStreamClient::new(source);
        let (handler, _) = collector();
        client.connect(SessionId::from_raw("s1"), handler);
        feed.send(frame(r#"{"type":"connected"}"#)).await.unwrap();
        let shared = Arc::clone(&client.shared);
        settle(|| shared.connected.load(Ordering::SeqCst)).await;

        drop(client);
        settle(|| drops.load(Ordering::SeqCst) == 1).await;
        assert!(feed.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_surfaces_as_transport_error() {
        use crate::frame::Framing;
        use crate::transport::FrameReader;

        struct SilentSource;

        #[async_trait]
        impl EventSource for SilentSource {
            async fn open(&self, _session_id: &SessionId) -> Result<FrameStream, StreamError> {
                let bytes = futures::stream::pending::<Result<bytes::Bytes, StreamError>>();
                Ok(Box::pin(FrameReader::new(bytes, Framing::Sse, Duration::from_secs(90))))
            }
        }

        let client = EventStreamClient::new(SilentSource);
        let (handler, seen) = collector();
        client.connect(SessionId::from_raw("s1"), handler);
        let shared = Arc::clone(&client.shared);
        settle(|| shared.connected.load(Ordering::SeqCst)).await;

        tokio::time::sleep(Duration::from_secs(91)).await;
        settle(|| shared.closed.load(Ordering::SeqCst) == 1).await;
        assert!(matches!(
            &seen.lock()[0],
            StreamEvent::Error { detail: Some(d), .. } if d.contains("no data")
        ));
        assert!(!client.is_connected());
    }
}
