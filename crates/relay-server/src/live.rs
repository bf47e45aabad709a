//! Event fan-out to connected live-transport clients.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use relay_bus::Subscriber;
use relay_core::events::Event;
use relay_core::ids::SessionId;

const DEFAULT_SEND_QUEUE: usize = 256;

/// One connected client. The transport layer above this (out of scope
/// here) drains `rx` into whatever socket it owns.
pub struct ClientConnection {
    pub id: String,
    session_id: RwLock<Option<SessionId>>,
    tx: mpsc::Sender<String>,
}

impl ClientConnection {
    fn new(id: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            session_id: RwLock::new(None),
            tx,
        }
    }

    /// Bind this client to a session "room".
    pub fn bind_session(&self, session_id: SessionId) {
        *self.session_id.write() = Some(session_id);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    /// Queue a message. Returns false when the client's queue is full or
    /// closed — the message is dropped, never blocking the caller.
    fn send(&self, json: String) -> bool {
        self.tx.try_send(json).is_ok()
    }
}

/// Session-room fan-out of serialized events to connected clients.
pub struct LiveTransport {
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
    send_queue: usize,
}

impl LiveTransport {
    pub fn new() -> Self {
        Self::with_send_queue(DEFAULT_SEND_QUEUE)
    }

    pub fn with_send_queue(send_queue: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            send_queue,
        }
    }

    /// Register a client and hand back its message stream.
    pub fn register(&self) -> (Arc<ClientConnection>, mpsc::Receiver<String>) {
        let id = format!("client_{}", Uuid::now_v7());
        let (tx, rx) = mpsc::channel(self.send_queue);
        let conn = Arc::new(ClientConnection::new(id.clone(), tx));
        let _ = self.connections.write().insert(id, Arc::clone(&conn));
        (conn, rx)
    }

    pub fn unregister(&self, connection_id: &str) {
        let _ = self.connections.write().remove(connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Push a serialized event to every client bound to the session.
    pub fn broadcast_to_session(&self, session_id: &SessionId, json: &str) {
        let conns: Vec<Arc<ClientConnection>> =
            self.connections.read().values().cloned().collect();
        let mut recipients = 0;
        for conn in conns {
            if conn.session_id().as_ref() == Some(session_id) {
                recipients += 1;
                if !conn.send(json.to_string()) {
                    warn!(conn_id = %conn.id, session_id = %session_id, "client queue full, dropping event");
                }
            }
        }
        debug!(session_id = %session_id, recipients, "broadcast event to session");
    }
}

impl Default for LiveTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for LiveTransport {
    fn name(&self) -> &str {
        "live_transport"
    }

    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let json = serde_json::to_string(&event)?;
        self.broadcast_to_session(&event.session_id, &json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::events::EventType;
    use serde_json::json;

    #[test]
    fn register_and_unregister() {
        let transport = LiveTransport::new();
        assert_eq!(transport.connection_count(), 0);

        let (conn, _rx) = transport.register();
        assert!(conn.id.starts_with("client_"));
        assert_eq!(transport.connection_count(), 1);

        transport.unregister(&conn.id);
        assert_eq!(transport.connection_count(), 0);
    }

    #[tokio::test]
    async fn handle_routes_by_session_room() {
        let transport = LiveTransport::new();
        let session_a = SessionId::new();
        let session_b = SessionId::new();

        let (conn_a, mut rx_a) = transport.register();
        conn_a.bind_session(session_a.clone());
        let (conn_b, mut rx_b) = transport.register();
        conn_b.bind_session(session_b);
        let (_unbound, mut rx_c) = transport.register();

        let event = Event::for_session(
            EventType::StatusUpdate,
            session_a,
            json!({"status": "RUNNING"}),
        );
        transport.handle(event).await.unwrap();

        let msg = rx_a.try_recv().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "status_update");
        assert_eq!(parsed["content"]["status"], "RUNNING");

        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let transport = LiveTransport::with_send_queue(2);
        let session_id = SessionId::new();
        let (conn, mut rx) = transport.register();
        conn.bind_session(session_id.clone());

        for i in 0..5 {
            let event = Event::for_session(
                EventType::MessageDelta,
                session_id.clone(),
                json!({"n": i}),
            );
            transport.handle(event).await.unwrap();
        }

        // Only the first two made it; the rest were dropped
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn multiple_clients_in_same_room() {
        let transport = LiveTransport::new();
        let session_id = SessionId::new();
        let (conn_a, mut rx_a) = transport.register();
        conn_a.bind_session(session_id.clone());
        let (conn_b, mut rx_b) = transport.register();
        conn_b.bind_session(session_id.clone());

        let event = Event::for_session(EventType::StatusUpdate, session_id, json!({}));
        transport.handle(event).await.unwrap();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregistered_client_receives_nothing() {
        let transport = LiveTransport::new();
        let session_id = SessionId::new();
        let (conn, mut rx) = transport.register();
        conn.bind_session(session_id.clone());
        transport.unregister(&conn.id);

        let event = Event::for_session(EventType::StatusUpdate, session_id, json!({}));
        transport.handle(event).await.unwrap();

        assert!(rx.try_recv().is_err());
    }
}
