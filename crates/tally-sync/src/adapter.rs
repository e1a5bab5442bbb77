//! Keeps a client's copy of one session in step with the server.
//!
//! The loop subscribes first, then fetches an authoritative baseline, then
//! applies pushed snapshots wholesale. Pushes are at-most-once with no
//! replay, so every reconnect repeats subscribe-then-fetch to cover the gap.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_core::{SessionId, SessionView};

use crate::error::SyncError;
use crate::transport::{SyncEvent, SyncTransport};

pub const CLOSED_NOTICE: &str = "This order has been closed by the host.";

/// What the client renders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncState {
    pub snapshot: Option<SessionView>,
    /// Set once the session is closed; input must be disabled.
    pub read_only: bool,
    pub closed_notice: Option<String>,
    pub connected: bool,
}

/// Reconnect delay policy: exponential from `base_delay`, capped, jittered.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// How one connected pass ended.
#[derive(Debug, PartialEq, Eq)]
enum PassEnd {
    Closed,
    StreamEnded,
    Cancelled,
}

pub struct SessionSync<T: SyncTransport> {
    transport: Arc<T>,
    session_id: SessionId,
    state: watch::Sender<SyncState>,
    backoff: BackoffConfig,
    cancel: CancellationToken,
}

impl<T: SyncTransport> SessionSync<T> {
    pub fn new(transport: Arc<T>, session_id: SessionId) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            transport,
            session_id,
            state,
            backoff: BackoffConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Token that stops [`run`](Self::run) when cancelled (component unmount).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply a pushed or fetched event. Returns whether the state changed.
    ///
    /// Snapshots older than the current revision are ignored, which makes
    /// the baseline fetch and a racing push safe in either order.
    pub fn apply(&self, event: SyncEvent) -> bool {
        if event.session_id() != &self.session_id {
            return false;
        }
        match event {
            SyncEvent::Updated(view) => self.apply_snapshot(*view),
            SyncEvent::Closed { .. } => self.state.send_if_modified(|s| {
                if s.read_only {
                    return false;
                }
                s.read_only = true;
                s.closed_notice = Some(CLOSED_NOTICE.to_string());
                true
            }),
        }
    }

    fn apply_snapshot(&self, view: SessionView) -> bool {
        self.state.send_if_modified(|s| {
            if let Some(current) = &s.snapshot {
                if view.revision < current.revision {
                    debug!(
                        session_id = %view.id,
                        stale = view.revision,
                        current = current.revision,
                        "ignoring stale snapshot"
                    );
                    return false;
                }
            }
            if view.is_closed() && !s.read_only {
                s.read_only = true;
                s.closed_notice = Some(CLOSED_NOTICE.to_string());
            }
            s.snapshot = Some(view);
            true
        })
    }

    fn set_connected(&self, connected: bool) {
        let _ = self.state.send_if_modified(|s| {
            let changed = s.connected != connected;
            s.connected = connected;
            changed
        });
    }

    /// Sync until the session closes, the token is cancelled, or a
    /// non-retryable error occurs.
    pub async fn run(&self) -> Result<(), SyncError> {
        let mut attempt: u32 = 0;
        loop {
            match self.sync_pass(&mut attempt).await {
                Ok(PassEnd::Closed) => {
                    info!(session_id = %self.session_id, "session closed, sync finished");
                    return Ok(());
                }
                Ok(PassEnd::Cancelled) => return Ok(()),
                Ok(PassEnd::StreamEnded) => {
                    debug!(session_id = %self.session_id, "event stream ended");
                }
                Err(e) if e.is_retryable() => {
                    warn!(session_id = %self.session_id, error = %e, attempt, "sync interrupted");
                }
                Err(e) => {
                    self.set_connected(false);
                    return Err(e);
                }
            }
            self.set_connected(false);

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn sync_pass(&self, attempt: &mut u32) -> Result<PassEnd, SyncError> {
        let mut events = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(PassEnd::Cancelled),
            stream = self.transport.subscribe(&self.session_id) => stream?,
        };
        let baseline = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(PassEnd::Cancelled),
            view = self.transport.fetch(&self.session_id) => view?,
        };
        let _ = self.apply_snapshot(baseline);
        self.set_connected(true);
        *attempt = 0;
        if self.state.borrow().read_only {
            return Ok(PassEnd::Closed);
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(PassEnd::Cancelled),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    let _ = self.apply(event);
                    if self.state.borrow().read_only {
                        return Ok(PassEnd::Closed);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(PassEnd::StreamEnded),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventStream;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tally_core::{LineItem, NewSession, Session, SessionStatus, SettledSession};
    use tokio::sync::mpsc;

    /// One scripted connection: what subscribe returns, then what fetch returns.
    struct Pass {
        subscribe: Result<mpsc::UnboundedReceiver<Result<SyncEvent, SyncError>>, SyncError>,
        fetch: Result<SessionView, SyncError>,
    }

    struct Scripted {
        passes: Mutex<VecDeque<Pass>>,
        pending_fetch: Mutex<Option<Result<SessionView, SyncError>>>,
        subscribes: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl Scripted {
        fn new(passes: Vec<Pass>) -> Self {
            Self {
                passes: Mutex::new(passes.into()),
                pending_fetch: Mutex::new(None),
                subscribes: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SyncTransport for Scripted {
        async fn subscribe(&self, _session: &SessionId) -> Result<EventStream, SyncError> {
            let _ = self.subscribes.fetch_add(1, Ordering::SeqCst);
            let pass = self
                .passes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| SyncError::Protocol("script exhausted".into()))?;
            *self.pending_fetch.lock().unwrap() = Some(pass.fetch);
            let rx = pass.subscribe?;
            Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
        }

        async fn fetch(&self, _session: &SessionId) -> Result<SessionView, SyncError> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            self.pending_fetch
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(SyncError::Protocol("fetch before subscribe".into())))
        }
    }

    fn session() -> Session {
        Session::new(
            NewSession {
                host_id: "host".into(),
                payment_info: String::new(),
                delivery_fee: dec!(30),
                deadline: None,
                restaurant: None,
            },
            Utc::now(),
        )
    }

    fn view_at(session: &Session, revision: u64) -> SessionView {
        let mut s = session.clone();
        s.revision = revision;
        SettledSession::new(s).view()
    }

    fn fast() -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = BackoffConfig {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(cfg.delay(0), Duration::from_millis(250));
        assert_eq!(cfg.delay(1), Duration::from_millis(500));
        assert_eq!(cfg.delay(3), Duration::from_millis(2000));
        assert_eq!(cfg.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let cfg = BackoffConfig::default();
        for _ in 0..100 {
            let d = cfg.delay(2).as_millis();
            assert!((800..=1200).contains(&d), "{d}");
        }
    }

    #[test]
    fn stale_snapshots_are_ignored() {
        let s = session();
        let sync = SessionSync::new(Arc::new(Scripted::new(vec![])), s.id.clone());

        assert!(sync.apply(SyncEvent::Updated(Box::new(view_at(&s, 3)))));
        assert!(!sync.apply(SyncEvent::Updated(Box::new(view_at(&s, 2)))));
        assert_eq!(sync.state().snapshot.unwrap().revision, 3);
        assert!(sync.apply(SyncEvent::Updated(Box::new(view_at(&s, 4)))));
    }

    #[test]
    fn events_for_other_sessions_are_ignored() {
        let s = session();
        let sync = SessionSync::new(Arc::new(Scripted::new(vec![])), SessionId::new());
        assert!(!sync.apply(SyncEvent::Updated(Box::new(view_at(&s, 1)))));
        assert!(sync.state().snapshot.is_none());
    }

    #[test]
    fn closed_event_makes_state_read_only() {
        let s = session();
        let sync = SessionSync::new(Arc::new(Scripted::new(vec![])), s.id.clone());
        let _ = sync.apply(SyncEvent::Updated(Box::new(view_at(&s, 1))));
        assert!(sync.apply(SyncEvent::Closed {
            session_id: s.id.clone()
        }));
        let state = sync.state();
        assert!(state.read_only);
        assert_eq!(state.closed_notice.as_deref(), Some(CLOSED_NOTICE));
        assert!(state.snapshot.is_some());
        assert!(!sync.apply(SyncEvent::Closed { session_id: s.id }));
    }

    #[tokio::test]
    async fn baseline_then_pushes_until_closed() {
        let mut s = session();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Scripted::new(vec![Pass {
            subscribe: Ok(rx),
            fetch: Ok(view_at(&s, 0)),
        }]));
        let sync = SessionSync::new(Arc::clone(&transport), s.id.clone()).with_backoff(fast());
        let mut watch = sync.watch();

        s.upsert_order("ana".into(), vec![LineItem::new("Tea", dec!(20), 1)], Utc::now())
            .unwrap();
        tx.send(Ok(SyncEvent::Updated(Box::new(view_at(&s, 1))))).unwrap();
        tx.send(Ok(SyncEvent::Closed {
            session_id: s.id.clone(),
        }))
        .unwrap();

        sync.run().await.unwrap();
        let state = watch.borrow_and_update().clone();
        assert!(state.read_only);
        let snapshot = state.snapshot.unwrap();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.summary.grand_total, dec!(50));
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnects_and_refetches_after_drop() {
        let s = session();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let mut closed = s.clone();
        closed.status = SessionStatus::Closed;
        closed.revision = 5;

        let transport = Arc::new(Scripted::new(vec![
            Pass {
                subscribe: Ok(rx1),
                fetch: Ok(view_at(&s, 1)),
            },
            Pass {
                subscribe: Err(SyncError::Transport("refused".into())),
                fetch: Err(SyncError::Disconnected),
            },
            Pass {
                subscribe: Ok(rx2),
                fetch: Ok(SettledSession::new(closed).view()),
            },
        ]));
        // First connection drops with an error; the gap is covered by refetch.
        tx1.send(Err(SyncError::Disconnected)).unwrap();
        drop(tx2);

        let sync = SessionSync::new(Arc::clone(&transport), s.id.clone()).with_backoff(fast());
        sync.run().await.unwrap();

        let state = sync.state();
        assert!(state.read_only);
        assert_eq!(state.snapshot.unwrap().revision, 5);
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 3);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);
        drop(tx1);
    }

    #[tokio::test]
    async fn terminal_errors_stop_the_loop() {
        let s = session();
        let (_tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Scripted::new(vec![Pass {
            subscribe: Ok(rx),
            fetch: Err(SyncError::Rpc {
                code: "NOT_FOUND".into(),
                message: "no such session".into(),
                retryable: false,
            }),
        }]));
        let sync = SessionSync::new(transport, s.id.clone()).with_backoff(fast());
        let err = sync.run().await.unwrap_err();
        assert_matches!(err, SyncError::Rpc { ref code, .. } if code == "NOT_FOUND");
        assert!(!sync.state().connected);
    }

    #[tokio::test]
    async fn cancellation_stops_a_live_loop() {
        let s = session();
        let (_tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Scripted::new(vec![Pass {
            subscribe: Ok(rx),
            fetch: Ok(view_at(&s, 0)),
        }]));
        let sync = Arc::new(SessionSync::new(transport, s.id.clone()));
        let token = sync.cancel_token();

        let runner = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.run().await })
        };
        let mut watch = sync.watch();
        let _ = watch.wait_for(|st| st.connected).await.unwrap();

        token.cancel();
        runner.await.unwrap().unwrap();
        assert!(!sync.state().read_only);
    }
}
