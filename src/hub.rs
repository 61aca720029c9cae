use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Registry of connected WS sessions and the fan-out point for server-pushed
/// events. Each connection owns an outbound channel drained by its own writer
/// task; the hub only ever holds the sending half.
#[derive(Default)]
pub struct Hub {
    connections: DashMap<Uuid, mpsc::UnboundedSender<Value>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: Uuid, sender: mpsc::UnboundedSender<Value>) {
        self.connections.insert(session_id, sender);
    }

    pub fn unregister(&self, session_id: Uuid) {
        self.connections.remove(&session_id);
    }

    /// Sends to one connection. Returns `false` if the connection is unknown
    /// or its receiver has already gone away (in which case it is dropped).
    pub fn send_to(&self, session_id: Uuid, value: Value) -> bool {
        let delivered = match self.connections.get(&session_id) {
            Some(tx) => tx.send(value).is_ok(),
            None => return false,
        };
        if !delivered {
            self.connections.remove(&session_id);
        }
        delivered
    }

    /// Fans `value` out to every connection, dropping any whose receiver has
    /// gone away.
    pub fn broadcast(&self, value: Value) {
        self.connections.retain(|_, tx| tx.send(value.clone()).is_ok());
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_to_unknown_session_returns_false() {
        let hub = Hub::new();
        assert!(!hub.send_to(Uuid::new_v4(), json!({"type": "ping"})));
    }

    #[test]
    fn broadcast_reaches_every_registered_connection() {
        let hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.register(Uuid::new_v4(), tx_a);
        hub.register(Uuid::new_v4(), tx_b);
        hub.broadcast(json!({"type": "system:status"}));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn broadcast_drops_dead_connections() {
        let hub = Hub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(Uuid::new_v4(), tx);
        drop(rx);
        hub.broadcast(json!({"type": "system:status"}));
        assert!(hub.is_empty());
    }

    #[test]
    fn unregister_removes_connection() {
        let hub = Hub::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.register(id, tx);
        assert_eq!(hub.connection_count(), 1);
        hub.unregister(id);
        assert!(hub.is_empty());
    }
}
