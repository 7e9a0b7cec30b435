// Connected-client registry.
//
// One record per live socket, keyed by the hub-assigned client id. The
// socket task owns the receiving half of the outbound channel; everything
// else in the hub reaches a client by pushing into its sender here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tandem_common::protocol::Envelope;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Instruction queued for a client's socket task.
#[derive(Debug)]
pub enum Outbound {
    /// Encode and send a protocol frame.
    Frame(Envelope),
    /// Close the connection (liveness timeout).
    Close,
}

/// Book-keeping for one connected client.
#[derive(Debug)]
pub struct ClientRecord {
    /// User announced on inbound frames, once seen.
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// Refreshed on every inbound frame.
    pub last_activity: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Shared map of connected clients.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<Uuid, ClientRecord>>>,
}

impl ClientRegistry {
    pub async fn register(
        &self,
        client_id: Uuid,
        outbound: mpsc::UnboundedSender<Outbound>,
        now: DateTime<Utc>,
    ) {
        let mut clients = self.clients.write().await;
        clients.insert(
            client_id,
            ClientRecord { user_id: None, connected_at: now, last_activity: now, outbound },
        );
    }

    /// Refresh the activity clock and note the announced user, if any.
    pub async fn touch(&self, client_id: Uuid, user_id: Option<&str>, now: DateTime<Utc>) {
        let mut clients = self.clients.write().await;
        if let Some(record) = clients.get_mut(&client_id) {
            record.last_activity = now;
            if let Some(user) = user_id {
                if record.user_id.as_deref() != Some(user) {
                    record.user_id = Some(user.to_owned());
                }
            }
        }
    }

    pub async fn user_of(&self, client_id: Uuid) -> Option<String> {
        self.clients.read().await.get(&client_id).and_then(|r| r.user_id.clone())
    }

    pub async fn remove(&self, client_id: Uuid) -> Option<ClientRecord> {
        self.clients.write().await.remove(&client_id)
    }

    /// Queue a frame for one client. False when the client is gone.
    pub async fn send(&self, client_id: Uuid, envelope: Envelope) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&client_id) {
            Some(record) => record.outbound.send(Outbound::Frame(envelope)).is_ok(),
            None => false,
        }
    }

    /// Ask a client's socket task to close the connection.
    pub async fn close(&self, client_id: Uuid) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&client_id) {
            Some(record) => record.outbound.send(Outbound::Close).is_ok(),
            None => false,
        }
    }

    /// Queue one frame for many clients, skipping any that are gone.
    /// Returns the number of successful deliveries.
    pub async fn send_to_each(&self, recipients: &[Uuid], envelope: &Envelope) -> usize {
        let senders: Vec<mpsc::UnboundedSender<Outbound>> = {
            let clients = self.clients.read().await;
            recipients
                .iter()
                .filter_map(|id| clients.get(id).map(|record| record.outbound.clone()))
                .collect()
        };

        let mut delivered = 0;
        for sender in senders {
            if sender.send(Outbound::Frame(envelope.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Split clients into (idle, live) by last activity before the cutoff.
    pub async fn partition_idle(&self, cutoff: DateTime<Utc>) -> (Vec<Uuid>, Vec<Uuid>) {
        let clients = self.clients.read().await;
        let mut idle = Vec::new();
        let mut live = Vec::new();
        for (id, record) in clients.iter() {
            if record.last_activity < cutoff {
                idle.push(*id);
            } else {
                live.push(*id);
            }
        }
        (idle, live)
    }

    pub async fn contains(&self, client_id: Uuid) -> bool {
        self.clients.read().await.contains_key(&client_id)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tandem_common::protocol::{MessageBody, PingPayload};

    fn frame() -> Envelope {
        Envelope::new(MessageBody::Ping(PingPayload { sent_at: Utc::now() }))
    }

    #[tokio::test]
    async fn register_send_and_remove() {
        let registry = ClientRegistry::default();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(id, tx, Utc::now()).await;
        assert!(registry.contains(id).await);

        assert!(registry.send(id, frame()).await);
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));

        assert!(registry.remove(id).await.is_some());
        assert!(!registry.send(id, frame()).await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn touch_refreshes_activity_and_notes_the_user() {
        let registry = ClientRegistry::default();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let start = Utc::now();
        registry.register(id, tx, start).await;
        assert_eq!(registry.user_of(id).await, None);

        let later = start + TimeDelta::seconds(5);
        registry.touch(id, Some("user-a"), later).await;
        assert_eq!(registry.user_of(id).await.as_deref(), Some("user-a"));

        let (idle, live) = registry.partition_idle(start + TimeDelta::seconds(1)).await;
        assert!(idle.is_empty());
        assert_eq!(live, vec![id]);
    }

    #[tokio::test]
    async fn partition_splits_on_the_cutoff() {
        let registry = ClientRegistry::default();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let start = Utc::now();
        registry.register(stale, tx_a, start).await;
        registry.register(fresh, tx_b, start).await;
        registry.touch(fresh, None, start + TimeDelta::seconds(45)).await;

        let (idle, live) = registry.partition_idle(start + TimeDelta::seconds(30)).await;
        assert_eq!(idle, vec![stale]);
        assert_eq!(live, vec![fresh]);
    }

    #[tokio::test]
    async fn close_reaches_the_socket_task() {
        let registry = ClientRegistry::default();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(id, tx, Utc::now()).await;

        assert!(registry.close(id).await);
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
    }

    #[tokio::test]
    async fn send_to_each_counts_only_reachable_clients() {
        let registry = ClientRegistry::default();
        let alive = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(alive, tx, Utc::now()).await;

        let delivered = registry.send_to_each(&[alive, gone], &frame()).await;
        assert_eq!(delivered, 1);
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
    }
}
