//! Observer fan-out.
//!
//! [`BroadcastHub`] keeps one outbound queue per connected observer and
//! delivers every [`HubMessage`] to all of them. The core (register,
//! broadcast, inbound handling, liveness) does not know about sockets;
//! [`BroadcastHub::serve`] adds the WebSocket front end on top of it.
//!
//! Liveness: every probe interval each connection is marked suspect and sent
//! a WebSocket ping. A pong clears the mark. A connection that is still
//! suspect at the next tick is closed and removed.
//!
//! Observer protocol (text frames):
//!
//! ```text
//! server → {"type":"connected","timestamp":…}          on connect
//! client → {"type":"ping"}   server → {"type":"pong","timestamp":…}
//! client → {"type":"<command>",…}                      forwarded as ObserverCommand
//! server → {"type":"<kind>",…payload,"timestamp":…}    broadcasts
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::conversation::ConversationSignal;
use crate::now_ms;
use crate::supervisor::WorkerSignal;

/// Capacity of the observer → daemon command channel.
const INBOUND_CAPACITY: usize = 256;

/// Frames queued per observer before it counts as stalled and is evicted.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// How long a connection's writer may take to flush its close frame.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One server → observer message.
#[derive(Debug, Clone, PartialEq)]
pub struct HubMessage {
    pub kind: String,
    pub payload: Map<String, Value>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl HubMessage {
    /// Build a message stamped with the current time. A non-object payload
    /// is wrapped as `{"data": payload}`.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            kind: kind.into(),
            payload,
            timestamp: now_ms(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for HubMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.payload.len() + 2))?;
        map.serialize_entry("type", &self.kind)?;
        for (key, value) in &self.payload {
            if key == "type" || key == "timestamp" {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.end()
    }
}

impl From<&WorkerSignal> for HubMessage {
    fn from(signal: &WorkerSignal) -> Self {
        match signal {
            WorkerSignal::Status(status) => Self::new("status", json!({ "status": status })),
            WorkerSignal::Event(event) => Self::new("event", json!({ "event": event })),
            WorkerSignal::Output(line) => Self::new("output", json!({ "line": line })),
            WorkerSignal::Error(message) => Self::new("error", json!({ "message": message })),
            WorkerSignal::Exit(info) => Self::new(
                "exit",
                json!({ "code": info.code, "signal": info.signal }),
            ),
        }
    }
}

impl From<&ConversationSignal> for HubMessage {
    fn from(signal: &ConversationSignal) -> Self {
        match signal {
            ConversationSignal::Message(message) => {
                Self::new("chat_message", json!({ "message": message }))
            }
            ConversationSignal::Chunk(text) => Self::new("chat_chunk", json!({ "text": text })),
            ConversationSignal::Event(event) => Self::new("chat_event", json!({ "event": event })),
            ConversationSignal::Error(message) => {
                Self::new("chat_error", json!({ "message": message }))
            }
            ConversationSignal::Status(status) => {
                Self::new("chat_status", json!({ "status": status }))
            }
            ConversationSignal::HistoryCleared => Self::new("chat_cleared", Value::Null),
        }
    }
}

/// A typed JSON message received from an observer.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverCommand {
    pub connection: Uuid,
    pub message: Map<String, Value>,
}

impl ObserverCommand {
    /// The command name (`type` field).
    pub fn kind(&self) -> &str {
        self.message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.message.get(key)
    }
}

/// A frame queued for one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
    Close,
}

/// Transport-side view of a registered observer.
#[derive(Debug)]
pub struct ObserverHandle {
    pub id: Uuid,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Cancelled when the hub evicts or closes the connection.
    pub closed: CancellationToken,
}

struct ObserverConnection {
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
    suspect: bool,
}

/// Fan-out hub for observer connections.
pub struct BroadcastHub {
    probe_interval: Duration,
    connections: Mutex<HashMap<Uuid, ObserverConnection>>,
    inbound_tx: mpsc::Sender<ObserverCommand>,
    inbound_rx: Mutex<Option<mpsc::Receiver<ObserverCommand>>>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("probe_interval", &self.probe_interval)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl BroadcastHub {
    pub fn new(config: &HubConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Arc::new(Self {
            probe_interval: config.probe_interval(),
            connections: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    /// Receiver of observer commands. Returns `None` after the first call.
    pub fn inbound(&self) -> Option<mpsc::Receiver<ObserverCommand>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Add an observer and queue its `connected` greeting.
    pub fn register(&self) -> ObserverHandle {
        let id = Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
        let closed = CancellationToken::new();
        self.lock().insert(
            id,
            ObserverConnection {
                tx,
                closed: closed.clone(),
                suspect: false,
            },
        );
        tracing::debug!(%id, "observer registered");
        self.send_to(id, &HubMessage::new("connected", Value::Null));
        ObserverHandle {
            id,
            outbound,
            closed,
        }
    }

    /// Forget an observer. Safe to call for unknown ids.
    pub fn unregister(&self, id: Uuid) {
        if let Some(conn) = self.lock().remove(&id) {
            conn.closed.cancel();
            tracing::debug!(%id, "observer unregistered");
        }
    }

    /// Deliver to every open connection. Never fails; returns the number of
    /// connections the message was queued for. An observer whose queue is
    /// full is evicted.
    pub fn broadcast(&self, message: &HubMessage) -> usize {
        let payload: Arc<str> = match message.to_json() {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::warn!(kind = %message.kind, error = %e, "failed to serialize hub message");
                return 0;
            }
        };

        let snapshot: Vec<(Uuid, mpsc::Sender<Outbound>)> = self
            .lock()
            .iter()
            .map(|(id, conn)| (*id, conn.tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        let mut stalled = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(Outbound::Text(Arc::clone(&payload))) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => stalled.push(id),
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }
        for id in dead {
            self.unregister(id);
        }
        for id in stalled {
            self.evict(id, "outbound queue full");
        }
        delivered
    }

    /// Queue a message for one connection.
    pub fn send_to(&self, id: Uuid, message: &HubMessage) -> bool {
        let Ok(text) = message.to_json() else {
            return false;
        };
        let tx = self.lock().get(&id).map(|conn| conn.tx.clone());
        match tx {
            Some(tx) => match tx.try_send(Outbound::Text(text.into())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.evict(id, "outbound queue full");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, id: Uuid, text: &str) {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) if map.get("type").is_some_and(Value::is_string) => map,
            _ => {
                tracing::debug!(%id, frame = %text, "ignoring unrecognized observer frame");
                return;
            }
        };

        if message.get("type").and_then(Value::as_str) == Some("ping") {
            self.send_to(id, &HubMessage::new("pong", Value::Null));
            return;
        }

        let command = ObserverCommand {
            connection: id,
            message,
        };
        if self.inbound_tx.send(command).await.is_err() {
            tracing::debug!(%id, "no command consumer; dropping observer command");
        }
    }

    /// Record a pong from `id`.
    pub fn mark_alive(&self, id: Uuid) {
        if let Some(conn) = self.lock().get_mut(&id) {
            conn.suspect = false;
        }
    }

    /// Run one liveness round. Returns the number of evicted connections.
    pub fn probe(&self) -> usize {
        let evicted: Vec<(Uuid, ObserverConnection)> = {
            let mut connections = self.lock();
            let stale: Vec<Uuid> = connections
                .iter()
                .filter(|(_, conn)| conn.suspect)
                .map(|(id, _)| *id)
                .collect();
            let evicted = stale
                .into_iter()
                .filter_map(|id| connections.remove(&id).map(|conn| (id, conn)))
                .collect();
            for conn in connections.values_mut() {
                conn.suspect = true;
                // A full queue is left suspect and evicted on the next tick.
                let _ = conn.tx.try_send(Outbound::Ping);
            }
            evicted
        };

        for (id, conn) in &evicted {
            tracing::info!(%id, "evicting unresponsive observer");
            let _ = conn.tx.try_send(Outbound::Close);
            conn.closed.cancel();
        }
        evicted.len()
    }

    /// Close and forget every connection.
    pub fn close_all(&self) {
        let drained: Vec<ObserverConnection> = self.lock().drain().map(|(_, conn)| conn).collect();
        for conn in drained {
            let _ = conn.tx.try_send(Outbound::Close);
            conn.closed.cancel();
        }
    }

    fn evict(&self, id: Uuid, reason: &str) {
        let Some(conn) = self.lock().remove(&id) else {
            return;
        };
        tracing::warn!(%id, reason, "evicting stalled observer");
        let _ = conn.tx.try_send(Outbound::Close);
        conn.closed.cancel();
    }

    /// Accept WebSocket observers on `listener` until `cancel` fires.
    ///
    /// Also runs the liveness ticker. On return every connection is closed.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let ticker = tokio::spawn(liveness_loop(Arc::clone(&self), cancel.clone()));
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "observer hub listening");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(Arc::clone(&self), stream, peer, cancel.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept observer connection"),
                },
            }
        }

        self.close_all();
        ticker.abort();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ObserverConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn liveness_loop(hub: Arc<BroadcastHub>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(hub.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                hub.probe();
            }
        }
    }
}

async fn handle_connection(
    hub: Arc<BroadcastHub>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut frames) = ws.split();
    let ObserverHandle {
        id,
        mut outbound,
        closed,
    } = hub.register();
    tracing::info!(%id, %peer, "observer connected");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::text(text.to_string()),
                Outbound::Ping => Message::Ping(Vec::new().into()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => hub.handle_text(id, text.as_str()).await,
                Some(Ok(Message::Pong(_))) => hub.mark_alive(id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%id, error = %e, "observer read failed");
                    break;
                }
            },
        }
    }

    hub.unregister(id);
    if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    tracing::info!(%id, "observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ExitInfo;
    use crate::supervisor::WorkerStatus;

    fn hub() -> Arc<BroadcastHub> {
        BroadcastHub::new(&HubConfig::default())
    }

    fn text(frame: Outbound) -> Value {
        match frame {
            Outbound::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn message_shape_spreads_payload() {
        let msg = HubMessage {
            kind: "status".into(),
            payload: json!({"status": "running"}).as_object().unwrap().clone(),
            timestamp: 5,
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"status","status":"running","timestamp":5}"#
        );
    }

    #[test]
    fn payload_cannot_shadow_type_or_timestamp() {
        let msg = HubMessage {
            kind: "output".into(),
            payload: json!({"type": "x", "timestamp": 1, "line": "hi"})
                .as_object()
                .unwrap()
                .clone(),
            timestamp: 9,
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"output","line":"hi","timestamp":9}"#
        );
    }

    #[test]
    fn signal_mapping() {
        let status = HubMessage::from(&WorkerSignal::Status(WorkerStatus::Paused));
        assert_eq!(status.kind, "status");
        assert_eq!(status.payload["status"], "paused");

        let exit = HubMessage::from(&WorkerSignal::Exit(ExitInfo::code(2)));
        assert_eq!(exit.kind, "exit");
        assert_eq!(exit.payload["code"], 2);
        assert_eq!(exit.payload["signal"], Value::Null);

        let chunk = HubMessage::from(&ConversationSignal::Chunk("abc".into()));
        assert_eq!(chunk.kind, "chat_chunk");
        assert_eq!(chunk.payload["text"], "abc");

        let cleared = HubMessage::from(&ConversationSignal::HistoryCleared);
        assert_eq!(cleared.kind, "chat_cleared");
        assert!(cleared.payload.is_empty());
    }

    #[test]
    fn broadcast_without_observers_is_fine() {
        let hub = hub();
        assert_eq!(hub.broadcast(&HubMessage::new("status", json!({}))), 0);
    }

    #[tokio::test]
    async fn register_sends_connected_greeting() {
        let hub = hub();
        let mut handle = hub.register();
        let greeting = text(handle.outbound.recv().await.unwrap());
        assert_eq!(greeting["type"], "connected");
        assert!(greeting["timestamp"].is_i64());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn observers_receive_identical_payloads() {
        let hub = hub();
        let mut a = hub.register();
        let mut b = hub.register();
        a.outbound.recv().await.unwrap();
        b.outbound.recv().await.unwrap();

        let delivered = hub.broadcast(&HubMessage::new("output", json!({"line": "x"})));
        assert_eq!(delivered, 2);
        let fa = a.outbound.recv().await.unwrap();
        let fb = b.outbound.recv().await.unwrap();
        assert_eq!(fa, fb);
    }

    #[tokio::test]
    async fn closed_receivers_are_dropped_silently() {
        let hub = hub();
        let a = hub.register();
        let mut b = hub.register();
        drop(a);

        assert_eq!(hub.broadcast(&HubMessage::new("output", json!({}))), 1);
        assert_eq!(hub.connection_count(), 1);
        b.outbound.recv().await.unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered_to_sender_only() {
        let hub = hub();
        let mut a = hub.register();
        let mut b = hub.register();
        a.outbound.recv().await.unwrap();
        b.outbound.recv().await.unwrap();

        hub.handle_text(a.id, r#"{"type":"ping"}"#).await;
        assert_eq!(text(a.outbound.recv().await.unwrap())["type"], "pong");
        assert!(b.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn typed_frames_become_commands() {
        let hub = hub();
        let mut inbound = hub.inbound().unwrap();
        assert!(hub.inbound().is_none());
        let a = hub.register();

        hub.handle_text(a.id, "not json").await;
        hub.handle_text(a.id, r#"{"no_type":true}"#).await;
        hub.handle_text(a.id, r#"{"type":"start","watch":true}"#).await;

        let cmd = inbound.recv().await.unwrap();
        assert_eq!(cmd.connection, a.id);
        assert_eq!(cmd.kind(), "start");
        assert_eq!(cmd.get("watch"), Some(&Value::Bool(true)));
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_connection_is_evicted_on_second_probe() {
        let hub = hub();
        let mut alive = hub.register();
        let mut silent = hub.register();
        alive.outbound.recv().await.unwrap();
        silent.outbound.recv().await.unwrap();

        assert_eq!(hub.probe(), 0);
        assert_eq!(alive.outbound.recv().await.unwrap(), Outbound::Ping);
        assert_eq!(silent.outbound.recv().await.unwrap(), Outbound::Ping);
        hub.mark_alive(alive.id);

        assert_eq!(hub.probe(), 1);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(silent.outbound.recv().await.unwrap(), Outbound::Close);
        assert!(silent.closed.is_cancelled());
        assert!(!alive.closed.is_cancelled());

        hub.broadcast(&HubMessage::new("output", json!({"line": "after"})));
        assert_eq!(alive.outbound.recv().await.unwrap(), Outbound::Ping);
        assert!(matches!(alive.outbound.recv().await, Some(Outbound::Text(_))));
        assert_eq!(silent.outbound.recv().await, None);
    }

    #[tokio::test]
    async fn stalled_observer_is_evicted_when_its_queue_fills() {
        let hub = hub();
        let stalled = hub.register();
        let mut reader = hub.register();
        let message = HubMessage::new("output", json!({"line": "x"}));

        // The greeting already holds one slot of the stalled queue.
        for _ in 1..OUTBOUND_CAPACITY {
            assert_eq!(hub.broadcast(&message), 2);
            while reader.outbound.try_recv().is_ok() {}
        }
        assert_eq!(hub.broadcast(&message), 1);
        assert_eq!(hub.connection_count(), 1);
        assert!(stalled.closed.is_cancelled());
        assert!(!reader.closed.is_cancelled());

        assert_eq!(hub.broadcast(&message), 1);
    }

    #[tokio::test]
    async fn close_all_empties_the_hub() {
        let hub = hub();
        let mut a = hub.register();
        a.outbound.recv().await.unwrap();
        hub.close_all();
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(a.outbound.recv().await, Some(Outbound::Close));
        assert!(a.closed.is_cancelled());
    }
}
