//! Fan-out of relay frames to every peer in a room.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, and
//! each peer's receiver buffers up to `capacity` frames. A peer that falls
//! further behind loses the oldest frames (reported as `Lagged`) and
//! recovers them through a sync step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// Broadcast group for a single room.
///
/// Frames go to every subscriber including the sender; the connection
/// task filters its own frames out.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to all receivers. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkboard_core::UserId;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::new(UserId::from(name), name)
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = peer("alice");
        let peer_id = alice.peer_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        assert!(group.remove_peer(&peer_id).await.is_some());
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&peer_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let alice = peer("alice");

        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(peer("bob")).await;
        let mut rx3 = group.add_peer(peer("carol")).await;

        let msg = SyncMessage::delta(alice.peer_id, "r1", 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let bytes = rx.recv().await.unwrap();
            let decoded = SyncMessage::decode(&bytes).unwrap();
            assert_eq!(decoded.payload, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_lagging_receiver_drops_oldest() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(peer("slow")).await;

        for i in 0..4u8 {
            group.broadcast_raw(Arc::new(vec![i]));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                assert_eq!(n, 2);
                group.record_lag(n);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(*rx.recv().await.unwrap(), vec![2]);
        assert_eq!(group.stats().await.messages_lagged, 2);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let alice = peer("alice");
        let _rx = group.add_peer(alice.clone()).await;

        let msg = SyncMessage::ping(alice.peer_id);
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_peer(peer("alice")).await;
        let _rx2 = group.add_peer(peer("bob")).await;

        let mut names: Vec<String> = group.peers().await.into_iter().map(|p| p.name).collect();
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);
    }
}
