//! WebSocket transport actor for the protocol session.
//!
//! Commands and events share one socket but have different delivery
//! semantics: requests are correlated to responses by id, events are pushed
//! whenever the browser feels like it, and the two interleave in
//! unspecified order. The actor owns the socket exclusively; callers submit
//! commands over a bounded channel with a oneshot responder and the read
//! loop routes every inbound frame either to the pending-command table or
//! to the event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::metrics;

/// An unsolicited event received from the browser.
#[derive(Clone, Debug)]
pub struct CdpEvent {
    /// Event method name, e.g. `Page.loadEventFired`.
    pub method: String,
    /// Event parameters.
    pub params: Value,
    /// Target session the event belongs to, for flattened sessions.
    pub session_id: Option<String>,
}

/// One command in flight from a caller to the actor.
pub(crate) struct OutboundCommand {
    pub id: u64,
    pub payload: String,
    pub responder: oneshot::Sender<Result<Value, SessionError>>,
}

pub(crate) enum ControlMessage {
    Command(OutboundCommand),
    Shutdown,
}

/// Keep-alive probing parameters. The probe shares the session's id
/// counter so heartbeat ids never collide with caller command ids.
pub(crate) struct Heartbeat {
    pub next_id: Arc<AtomicU64>,
    pub interval: Duration,
    pub deadline: Duration,
}

/// Handle to the transport actor. Dropping it (or sending `Shutdown`)
/// terminates the loop and fails every pending command.
pub struct Transport {
    command_tx: mpsc::Sender<ControlMessage>,
    io_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

impl Transport {
    /// Open a WebSocket to the given debugger endpoint and start the actor.
    pub(crate) async fn connect(
        ws_url: &str,
        event_tx: mpsc::Sender<CdpEvent>,
        heartbeat: Heartbeat,
    ) -> Result<Self, SessionError> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|err| SessionError::Connection(format!("{ws_url}: {err}")))?;

        info!(target: "cdp-session", url = %ws_url, "debugger connection established");
        let mut transport = Self::spawn(stream, event_tx);
        transport.heartbeat_task = spawn_heartbeat(
            transport.command_tx.clone(),
            transport.alive.clone(),
            heartbeat,
        );
        Ok(transport)
    }

    /// Start the actor over any message stream/sink. The generic seam is
    /// what lets tests drive the loop with channel-backed sockets.
    pub(crate) fn spawn<S>(stream: S, event_tx: mpsc::Sender<CdpEvent>) -> Self
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(128);
        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();

        let io_task = tokio::spawn(async move {
            let result = run_loop(stream, command_rx, event_tx).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                warn!(target: "cdp-session", ?err, "transport loop terminated with error");
            }
        });

        Self {
            command_tx,
            io_task,
            heartbeat_task: None,
            alive,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Hand a command to the actor. Fails with `SessionClosed` once the
    /// loop has exited.
    pub(crate) async fn submit(&self, command: OutboundCommand) -> Result<(), SessionError> {
        self.command_tx
            .send(ControlMessage::Command(command))
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Ask the actor to drain pending commands and close the socket.
    /// Safe to call more than once.
    pub(crate) async fn shutdown(&self) {
        let _ = self.command_tx.send(ControlMessage::Shutdown).await;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.io_task.abort();
        if let Some(handle) = &self.heartbeat_task {
            handle.abort();
        }
    }
}

/// Periodically round-trips `Browser.getVersion` to prove the connection
/// is still answering. A probe that times out shuts the actor down —
/// pending commands fail with `SessionClosed` — because a connection that
/// stopped responding must close, not linger indeterminate.
fn spawn_heartbeat(
    sender: mpsc::Sender<ControlMessage>,
    alive: Arc<AtomicBool>,
    heartbeat: Heartbeat,
) -> Option<JoinHandle<()>> {
    if heartbeat.interval.as_millis() == 0 {
        return None;
    }

    let response_deadline = heartbeat.deadline.min(Duration::from_secs(5));
    let next_id = heartbeat.next_id;
    let interval_duration = heartbeat.interval;

    Some(tokio::spawn(async move {
        let mut ticker = interval(interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so a freshly-opened
        // connection is not probed mid-handshake.
        ticker.tick().await;

        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;
            if !alive.load(Ordering::Relaxed) {
                break;
            }

            let id = next_id.fetch_add(1, Ordering::SeqCst);
            let payload = json!({ "id": id, "method": "Browser.getVersion", "params": {} });
            let (responder, response) = oneshot::channel();
            let command = OutboundCommand {
                id,
                payload: payload.to_string(),
                responder,
            };

            if sender.send(ControlMessage::Command(command)).await.is_err() {
                debug!(target: "cdp-session", "heartbeat send failed (actor gone)");
                break;
            }

            match tokio::time::timeout(response_deadline, response).await {
                Ok(Ok(Ok(_))) => {
                    // keep-alive succeeded
                }
                Ok(Ok(Err(err))) => {
                    warn!(target: "cdp-session", ?err, "heartbeat command error");
                    break;
                }
                Ok(Err(_)) => {
                    debug!(target: "cdp-session", "heartbeat responder dropped");
                    break;
                }
                Err(_) => {
                    warn!(target: "cdp-session", "heartbeat timed out; closing connection");
                    let _ = sender.send(ControlMessage::Shutdown).await;
                    break;
                }
            }
        }
    }))
}

async fn run_loop<S>(
    mut stream: S,
    mut command_rx: mpsc::Receiver<ControlMessage>,
    event_tx: mpsc::Sender<CdpEvent>,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Send
        + Unpin
        + 'static,
{
    // Invariant: at most one pending command per id; ids are allocated by
    // the session from a monotonic counter and never reused.
    let mut inflight: HashMap<u64, oneshot::Sender<Result<Value, SessionError>>> = HashMap::new();

    loop {
        tokio::select! {
            control = command_rx.recv() => {
                match control {
                    Some(ControlMessage::Command(command)) => {
                        if let Err(err) = stream.send(Message::Text(command.payload.into())).await {
                            let reason = SessionError::Connection(err.to_string());
                            let _ = command.responder.send(Err(reason.clone()));
                            fail_all(&mut inflight, SessionError::SessionClosed);
                            return Err(reason);
                        }
                        inflight.insert(command.id, command.responder);
                    }
                    Some(ControlMessage::Shutdown) | None => {
                        fail_all(&mut inflight, SessionError::SessionClosed);
                        let _ = stream.close().await;
                        return Ok(());
                    }
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(text.as_str(), &mut inflight, &event_tx);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        match std::str::from_utf8(&bytes) {
                            Ok(text) => dispatch_frame(text, &mut inflight, &event_tx),
                            Err(_) => debug!(target: "cdp-session", "ignoring non-utf8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(target: "cdp-session", "socket closed by remote");
                        fail_all(&mut inflight, SessionError::SessionClosed);
                        return Ok(());
                    }
                    Some(Ok(_)) => {
                        // ping/pong handled by the websocket layer
                    }
                    Some(Err(err)) => {
                        fail_all(&mut inflight, SessionError::SessionClosed);
                        return Err(SessionError::Connection(err.to_string()));
                    }
                    None => {
                        fail_all(&mut inflight, SessionError::SessionClosed);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Route one inbound frame: frames with an `id` are responses, frames with
/// a `method` and no `id` are events. Events are forwarded with `try_send`
/// so a slow consumer can never stall response correlation.
fn dispatch_frame(
    text: &str,
    inflight: &mut HashMap<u64, oneshot::Sender<Result<Value, SessionError>>>,
    event_tx: &mpsc::Sender<CdpEvent>,
) {
    let json: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(target: "cdp-session", %err, "failed to parse frame as json");
            return;
        }
    };

    if let Some(id) = json.get("id").and_then(Value::as_u64) {
        let result = extract_payload(&json);
        match inflight.remove(&id) {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => {
                // Late response for a command whose caller already timed
                // out; the slot was consumed, nothing to correlate.
                debug!(target: "cdp-session", id, "response for unknown command id");
            }
        }
    } else if let Some(method) = json.get("method").and_then(Value::as_str) {
        metrics::record_event();
        let event = CdpEvent {
            method: method.to_string(),
            params: json.get("params").cloned().unwrap_or(Value::Null),
            session_id: json
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        if event_tx.try_send(event).is_err() {
            debug!(target: "cdp-session", method, "event channel full or closed; dropping event");
        }
    }
}

fn extract_payload(json: &Value) -> Result<Value, SessionError> {
    if let Some(error) = json.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown cdp error")
            .to_string();
        return Err(SessionError::Cdp { code, message });
    }
    Ok(json.get("result").cloned().unwrap_or(Value::Null))
}

fn fail_all(
    inflight: &mut HashMap<u64, oneshot::Sender<Result<Value, SessionError>>>,
    error: SessionError,
) {
    for (_, responder) in inflight.drain() {
        let _ = responder.send(Err(error.clone()));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Channel-backed fake socket used by transport and session tests.

    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_util::{Sink, Stream};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    pub(crate) struct FakeSocket {
        incoming: mpsc::UnboundedReceiver<Result<Message, WsError>>,
        outgoing: mpsc::UnboundedSender<Message>,
    }

    pub(crate) struct FakeSocketDriver {
        pub to_session: mpsc::UnboundedSender<Result<Message, WsError>>,
        pub from_session: mpsc::UnboundedReceiver<Message>,
    }

    impl FakeSocketDriver {
        /// Push a raw json frame into the session's read loop.
        pub fn push(&self, frame: serde_json::Value) {
            let _ = self
                .to_session
                .send(Ok(Message::Text(frame.to_string().into())));
        }

        /// Pull the next command the session wrote to the wire.
        pub async fn next_command(&mut self) -> serde_json::Value {
            let message = self
                .from_session
                .recv()
                .await
                .expect("session closed its write half");
            match message {
                Message::Text(text) => serde_json::from_str(text.as_str()).expect("valid json"),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        /// Simulate the connection dropping out from under the session.
        pub fn disconnect(self) {
            drop(self.to_session);
        }
    }

    pub(crate) fn fake_socket() -> (FakeSocket, FakeSocketDriver) {
        let (to_session, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_session) = mpsc::unbounded_channel();
        (
            FakeSocket { incoming, outgoing },
            FakeSocketDriver {
                to_session,
                from_session,
            },
        )
    }

    impl Stream for FakeSocket {
        type Item = Result<Message, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_recv(cx)
        }
    }

    impl Sink<Message> for FakeSocket {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.outgoing
                .send(item)
                .map_err(|_| WsError::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    use super::testing::fake_socket;
    use super::*;

    async fn submit(transport: &Transport, id: u64) -> oneshot::Receiver<Result<Value, SessionError>> {
        let (tx, rx) = oneshot::channel();
        transport
            .submit(OutboundCommand {
                id,
                payload: json!({"id": id, "method": "Browser.getVersion", "params": {}}).to_string(),
                responder: tx,
            })
            .await
            .expect("submit");
        rx
    }

    #[tokio::test]
    async fn correlates_response_by_id() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let transport = Transport::spawn(socket, event_tx);

        let rx = submit(&transport, 1).await;
        let written = driver.next_command().await;
        assert_eq!(written["id"], 1);

        driver.push(json!({"id": 1, "result": {"product": "Chrome"}}));
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["product"], "Chrome");
    }

    #[tokio::test]
    async fn events_interleaved_with_responses_do_not_confuse_correlation() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let transport = Transport::spawn(socket, event_tx);

        let rx = submit(&transport, 7).await;
        driver.next_command().await;

        driver.push(json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.0}}));
        driver.push(json!({"id": 7, "result": {}}));

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cdp_error_payload_becomes_typed_error() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let transport = Transport::spawn(socket, event_tx);

        let rx = submit(&transport, 3).await;
        driver.next_command().await;
        driver.push(json!({"id": 3, "error": {"code": -32000, "message": "No node found"}}));

        match rx.await.unwrap() {
            Err(SessionError::Cdp { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "No node found");
            }
            other => panic!("expected cdp error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_command() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let transport = Transport::spawn(socket, event_tx);

        let rx_a = submit(&transport, 1).await;
        let rx_b = submit(&transport, 2).await;
        driver.next_command().await;
        driver.next_command().await;

        driver.disconnect();

        assert!(matches!(
            rx_a.await.unwrap(),
            Err(SessionError::SessionClosed)
        ));
        assert!(matches!(
            rx_b.await.unwrap(),
            Err(SessionError::SessionClosed)
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn late_response_after_abandoned_wait_is_dropped() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let transport = Transport::spawn(socket, event_tx);

        let rx = submit(&transport, 1).await;
        driver.next_command().await;
        drop(rx); // caller timed out and walked away

        driver.push(json!({"id": 1, "result": {}}));

        // A fresh command with a new id still round-trips cleanly.
        let rx = submit(&transport, 2).await;
        let written = driver.next_command().await;
        assert_eq!(written["id"], 2);
        driver.push(json!({"id": 2, "result": {"ok": true}}));
        assert_eq!(rx.await.unwrap().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn heartbeat_timeout_forces_closure_instead_of_lingering() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut transport = Transport::spawn(socket, event_tx);
        transport.heartbeat_task = spawn_heartbeat(
            transport.command_tx.clone(),
            transport.alive.clone(),
            Heartbeat {
                next_id: Arc::new(AtomicU64::new(1)),
                interval: Duration::from_millis(10),
                deadline: Duration::from_millis(20),
            },
        );

        let probe = driver.next_command().await;
        assert_eq!(probe["method"], "Browser.getVersion");

        // Nobody answers the probe: the actor must shut down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn answered_heartbeats_keep_the_connection_alive() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut transport = Transport::spawn(socket, event_tx);
        transport.heartbeat_task = spawn_heartbeat(
            transport.command_tx.clone(),
            transport.alive.clone(),
            Heartbeat {
                next_id: Arc::new(AtomicU64::new(1)),
                interval: Duration::from_millis(10),
                deadline: Duration::from_millis(100),
            },
        );

        for _ in 0..3 {
            let probe = driver.next_command().await;
            assert_eq!(probe["method"], "Browser.getVersion");
            driver.push(json!({"id": probe["id"], "result": {"product": "Chrome"}}));
        }

        assert!(transport.is_alive());
    }

    #[tokio::test]
    async fn shutdown_drains_pending_and_stops_loop() {
        let (socket, mut driver) = fake_socket();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let transport = Transport::spawn(socket, event_tx);

        let rx = submit(&transport, 1).await;
        driver.next_command().await;

        transport.shutdown().await;
        assert!(matches!(rx.await.unwrap(), Err(SessionError::SessionClosed)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!transport.is_alive());
    }
}
