//! Protocol session lifecycle and command surface.
//!
//! A [`CdpSession`] owns exactly one connection to one browser page target.
//! It allocates command ids from a monotonic counter (never reused within
//! the session's lifetime), correlates responses through the transport
//! actor, and fans unsolicited events out on a broadcast bus so that no
//! subscriber can ever stall the dispatch path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webpilot_core_types::{SessionId, SessionState, TargetId};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::launcher;
use crate::metrics;
use crate::transport::{CdpEvent, Heartbeat, OutboundCommand, Transport};

/// Minimal capability surface the rest of the engine needs from a session.
/// This is also the test seam: the perceiver port and the action executor
/// take `Arc<dyn CdpCommands>` and never touch the socket directly.
#[async_trait]
pub trait CdpCommands: Send + Sync {
    /// Issue a page-scoped command and await its correlated response.
    async fn command(&self, method: &str, params: Value) -> Result<Value, SessionError>;

    /// Same, with an explicit per-command deadline.
    async fn command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError>;

    fn state(&self) -> SessionState;

    /// The executor brackets navigations so extraction can refuse to race
    /// an in-flight load.
    fn mark_navigating(&self);
    fn mark_ready(&self);
}

#[derive(Clone, Debug)]
struct AttachedTarget {
    target_id: TargetId,
    cdp_session_id: String,
}

/// Handle to a running event-subscription task. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops delivery; keep it alive for as long
/// as the handler should fire.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One physical connection to one browser tab.
pub struct CdpSession {
    id: SessionId,
    cfg: SessionConfig,
    transport: Transport,
    next_id: Arc<AtomicU64>,
    state: Mutex<SessionState>,
    target: Mutex<Option<AttachedTarget>>,
    bus: broadcast::Sender<CdpEvent>,
    cancel: CancellationToken,
    dispatch_task: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl CdpSession {
    /// Launch (or attach to) a browser, open the debugging channel, create
    /// and attach a page target, and enable the Page/DOM/Runtime domains.
    ///
    /// `Disconnected → Connecting → Ready`; any failure along the way tears
    /// the partial session down and surfaces as `SessionError::Connection`
    /// or the underlying command failure.
    pub async fn connect(cfg: SessionConfig) -> Result<Self, SessionError> {
        let (child, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => {
                let launched = launcher::launch(&cfg).await?;
                (Some(launched.child), launched.ws_url)
            }
        };

        let (event_tx, event_rx) = mpsc::channel(512);
        let next_id = Arc::new(AtomicU64::new(1));
        let heartbeat = Heartbeat {
            next_id: Arc::clone(&next_id),
            interval: cfg.heartbeat_interval(),
            deadline: cfg.command_timeout(),
        };
        let transport = match Transport::connect(&ws_url, event_tx, heartbeat).await {
            Ok(transport) => transport,
            Err(err) => {
                if let Some(mut child) = child {
                    let _ = child.start_kill();
                }
                return Err(err);
            }
        };

        let session = Self::from_transport(cfg, transport, next_id, event_rx, child);

        if let Err(err) = session.attach_new_target().await {
            session.close().await;
            return Err(err);
        }

        session.set_state(SessionState::Ready);
        info!(target: "cdp-session", session = %session.id, "session ready");
        Ok(session)
    }

    fn from_transport(
        cfg: SessionConfig,
        transport: Transport,
        next_id: Arc<AtomicU64>,
        mut event_rx: mpsc::Receiver<CdpEvent>,
        child: Option<Child>,
    ) -> Self {
        let (bus, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let dispatch_bus = bus.clone();
        let dispatch_cancel = cancel.child_token();
        let dispatch_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => {
                            // send() only fails when nobody is subscribed,
                            // which is fine: events are droppable.
                            let _ = dispatch_bus.send(event);
                        }
                        None => break,
                    }
                }
            }
        });

        Self {
            id: SessionId::new(),
            cfg,
            transport,
            next_id,
            state: Mutex::new(SessionState::Connecting),
            target: Mutex::new(None),
            bus,
            cancel,
            dispatch_task,
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    /// Browser-assigned id of the attached page target, once attached.
    pub fn target_id(&self) -> Option<TargetId> {
        self.target
            .lock()
            .as_ref()
            .map(|target| target.target_id.clone())
    }

    async fn attach_new_target(&self) -> Result<(), SessionError> {
        let created = self
            .browser_command("Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol("createTarget returned no targetId".into()))?
            .to_string();

        let attached = self
            .browser_command(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let cdp_session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol("attachToTarget returned no sessionId".into()))?
            .to_string();

        debug!(target: "cdp-session", %target_id, "attached to page target");
        *self.target.lock() = Some(AttachedTarget {
            target_id: TargetId(target_id),
            cdp_session_id,
        });

        for domain in ["Page", "DOM", "Runtime"] {
            self.command(&format!("{domain}.enable"), json!({})).await?;
        }

        Ok(())
    }

    /// Issue a browser-level command (no target session attached).
    pub async fn browser_command(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, SessionError> {
        self.dispatch(method, params, None, self.cfg.command_timeout())
            .await
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Value,
        session_id: Option<String>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        if self.state().is_terminal() {
            return Err(SessionError::SessionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut frame = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            frame["sessionId"] = Value::String(session_id);
        }

        metrics::record_command(method);
        let started = Instant::now();

        let (responder, response) = oneshot::channel();
        if let Err(err) = self
            .transport
            .submit(OutboundCommand {
                id,
                payload: frame.to_string(),
                responder,
            })
            .await
        {
            metrics::record_command_failure(method);
            self.note_fatal();
            return Err(err);
        }

        let outcome = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::SessionClosed),
            Err(_) => Err(SessionError::CommandTimeout {
                method: method.to_string(),
                timeout,
            }),
        };

        match &outcome {
            Ok(_) => metrics::record_command_success(method, started.elapsed()),
            Err(err) => {
                metrics::record_command_failure(method);
                if err.is_fatal() {
                    self.note_fatal();
                }
            }
        }

        outcome
    }

    /// Observe every event the browser pushes, unfiltered.
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.bus.subscribe()
    }

    /// Invoke `handler` for every event matching `method`. The handler runs
    /// on its own task, never on the dispatch path; hand long-running work
    /// off from inside it all the same.
    pub fn on_event<F>(&self, method: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(CdpEvent) + Send + Sync + 'static,
    {
        let method = method.into();
        let mut rx = self.bus.subscribe();
        let cancel = self.cancel.child_token();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) if event.method == method => handler(event),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "cdp-session", skipped, "event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Subscription { task }
    }

    /// Block until an event with the given method arrives, or the deadline
    /// passes.
    pub async fn wait_for_event(&self, method: &str, timeout: Duration) -> Option<CdpEvent> {
        let mut rx = self.bus.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) if event.method == method => return Some(event),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }

    /// Close the session. Idempotent, reachable from any state: fails all
    /// pending commands, releases the connection, and kills a launched
    /// browser child.
    pub async fn close(&self) {
        self.set_state(SessionState::Closed);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.transport.shutdown().await;
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
        info!(target: "cdp-session", session = %self.id, "session closed");
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// A fatal transport failure leaves nothing to salvage: the session is
    /// closed rather than left indeterminate.
    fn note_fatal(&self) {
        self.set_state(SessionState::Closed);
    }

    #[cfg(test)]
    pub(crate) fn test_session(
        command_timeout_ms: u64,
    ) -> (Self, crate::transport::testing::FakeSocketDriver) {
        let (socket, driver) = crate::transport::testing::fake_socket();
        let (event_tx, event_rx) = mpsc::channel(512);
        let transport = Transport::spawn(socket, event_tx);
        let cfg = SessionConfig {
            command_timeout_ms,
            ..SessionConfig::default()
        };
        let next_id = Arc::new(AtomicU64::new(1));
        let session = Self::from_transport(cfg, transport, next_id, event_rx, None);
        session.set_state(SessionState::Ready);
        (session, driver)
    }
}

#[async_trait]
impl CdpCommands for CdpSession {
    async fn command(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        self.command_with_timeout(method, params, self.cfg.command_timeout())
            .await
    }

    async fn command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let session_id = self
            .target
            .lock()
            .as_ref()
            .map(|target| target.cdp_session_id.clone());
        self.dispatch(method, params, session_id, timeout).await
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn mark_navigating(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Ready {
            *state = SessionState::Navigating;
        }
    }

    fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Navigating {
            *state = SessionState::Ready;
        }
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.dispatch_task.abort();
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn allocates_monotonic_ids_never_reused() {
        let (session, mut driver) = CdpSession::test_session(1_000);

        let session = Arc::new(session);
        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.command("Browser.getVersion", json!({})).await })
        };
        let frame_a = driver.next_command().await;
        driver.push(json!({"id": frame_a["id"], "result": {}}));
        first.await.unwrap().unwrap();

        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.command("Browser.getVersion", json!({})).await })
        };
        let frame_b = driver.next_command().await;
        driver.push(json!({"id": frame_b["id"], "result": {}}));
        second.await.unwrap().unwrap();

        assert!(frame_b["id"].as_u64().unwrap() > frame_a["id"].as_u64().unwrap());
    }

    #[tokio::test]
    async fn command_after_close_fails_with_session_closed() {
        let (session, _driver) = CdpSession::test_session(1_000);

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        let err = session
            .command("Browser.getVersion", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _driver) = CdpSession::test_session(1_000);
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn timeout_leaves_pending_table_usable() {
        let (session, mut driver) = CdpSession::test_session(100);
        let session = Arc::new(session);

        // First command: never answered, times out.
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.command("Runtime.evaluate", json!({})).await })
        };
        let frame_a = driver.next_command().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::CommandTimeout { .. }));
        assert_eq!(session.state(), SessionState::Ready);

        // Late answer for the abandoned command is dropped on the floor.
        driver.push(json!({"id": frame_a["id"], "result": {}}));

        // A fresh, unrelated command with a new id still succeeds.
        let fresh = {
            let session = session.clone();
            tokio::spawn(async move { session.command("Browser.getVersion", json!({})).await })
        };
        let frame_b = driver.next_command().await;
        assert_ne!(frame_a["id"], frame_b["id"]);
        driver.push(json!({"id": frame_b["id"], "result": {"ok": true}}));
        assert_eq!(fresh.await.unwrap().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn transport_drop_closes_session_for_good() {
        let (session, mut driver) = CdpSession::test_session(1_000);
        let session = Arc::new(session);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.command("Runtime.evaluate", json!({})).await })
        };
        driver.next_command().await;
        driver.disconnect();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed));
        assert_eq!(session.state(), SessionState::Closed);

        // Everything after the drop short-circuits.
        let err = session
            .command("Browser.getVersion", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed));
    }

    #[tokio::test]
    async fn events_reach_subscribers_off_the_dispatch_path() {
        let (session, driver) = CdpSession::test_session(1_000);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _subscription = session.on_event("Page.loadEventFired", move |event| {
            assert_eq!(event.method, "Page.loadEventFired");
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        // Give the subscriber task a beat to attach to the bus.
        tokio::time::sleep(Duration::from_millis(10)).await;

        driver.push(json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.0}}));
        driver.push(json!({"method": "Page.frameNavigated", "params": {}}));
        driver.push(json!({"method": "Page.loadEventFired", "params": {"timestamp": 2.0}}));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_for_event_honors_deadline() {
        let (session, driver) = CdpSession::test_session(1_000);

        assert!(session
            .wait_for_event("Page.loadEventFired", Duration::from_millis(50))
            .await
            .is_none());

        let (got, _) = tokio::join!(
            session.wait_for_event("Page.loadEventFired", Duration::from_secs(1)),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                driver.push(json!({"method": "Page.loadEventFired", "params": {}}));
            }
        );
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn navigation_marks_toggle_between_ready_states() {
        let (session, _driver) = CdpSession::test_session(1_000);

        assert_eq!(session.state(), SessionState::Ready);
        session.mark_navigating();
        assert_eq!(session.state(), SessionState::Navigating);
        session.mark_ready();
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await;
        session.mark_navigating();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
