//! Fan-out of encoded frames to every connection in a room.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, each
//! of which buffers up to `capacity` frames. A connection that falls further
//! behind sees `RecvError::Lagged` and is resynchronized with the full state.
//!
//! Every relay carries the connection it came from so that connection can
//! skip its own echo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One encoded frame plus the connection that caused it.
///
/// `origin` is `None` for frames the room itself produced.
#[derive(Debug)]
pub struct Relay {
    pub origin: Option<Uuid>,
    pub bytes: Vec<u8>,
}

impl Relay {
    /// Whether `peer_id` should receive this frame.
    pub fn is_for(&self, peer_id: Uuid) -> bool {
        self.origin != Some(peer_id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// The broadcast group of a single room.
///
/// Owned by the room task, so the peer table needs no lock; the send path
/// only touches the channel and an atomic counter.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Relay>>,
    peers: HashMap<Uuid, PeerInfo>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: HashMap::new(),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a peer and hand back its receiver.
    pub fn add_peer(&mut self, info: PeerInfo) -> broadcast::Receiver<Arc<Relay>> {
        self.peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub fn remove_peer(&mut self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    /// Encode and relay a message to every subscriber.
    ///
    /// Returns the number of receivers; filtering out the origin is the
    /// receiver's job.
    pub fn relay(&self, origin: Option<Uuid>, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.relay_raw(Arc::new(Relay { origin, bytes })))
    }

    /// Relay an already encoded frame.
    pub fn relay_raw(&self, relay: Arc<Relay>) -> usize {
        let count = self.sender.send(relay).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
