//! Presence: who is in a story and where their caret is.
//!
//! ```text
//! Local selection change
//!       │
//!       ▼
//! PresenceRoom::update_local_selection()
//!       │  (rate-limited: 30fps)
//!       ▼
//! AwarenessMessage::Update { peer_id, clock, state }
//!       │
//!       ▼   (relayed by the room, colour stamped)
//! Remote PresenceRoom::handle_message()
//!       │
//!       ▼
//! AwarenessTable (stale clocks rejected)
//! ```
//!
//! Awareness is ephemeral: it is relayed, never persisted, and purged when
//! the owning connection goes away.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Colours
// ───────────────────────────────────────────────────────────────────

/// RGB colour for carets and selections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// Fixed colour of a story's original author.
    pub const AUTHOR: CursorColor = CursorColor {
        r: 0.11,
        g: 0.098,
        b: 0.09,
    };

    /// Generate a stable, visually distinct colour from a UUID.
    ///
    /// The hue is derived from the UUID; saturation and lightness are fixed
    /// so every colour stays readable on a light page.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }

    /// `#rrggbb` form used on the wire.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

/// A caret: block index plus character offset inside that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaretPosition {
    pub block: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: CaretPosition,
    pub focus: CaretPosition,
}

impl SelectionRange {
    pub fn caret(block: usize, offset: usize) -> Self {
        let at = CaretPosition { block, offset };
        Self { anchor: at, focus: at }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

/// What one connection shows the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub name: String,
    /// Overwritten by the server with the colour assigned at join.
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub selection: Option<SelectionRange>,
}

impl AwarenessState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Awareness payload carried in `MessageType::Awareness` frames (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AwarenessMessage {
    #[serde(rename_all = "camelCase")]
    Update {
        peer_id: Uuid,
        clock: u64,
        state: AwarenessState,
    },
    #[serde(rename_all = "camelCase")]
    Remove { peer_id: Uuid },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Update { peer_id, .. } | AwarenessMessage::Remove { peer_id } => {
                *peer_id
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Table
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    clock: u64,
    state: AwarenessState,
}

/// Latest awareness state per peer.
#[derive(Debug, Clone, Default)]
pub struct AwarenessTable {
    entries: HashMap<Uuid, Entry>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a message; returns false when it was stale or changed nothing.
    pub fn apply(&mut self, msg: &AwarenessMessage) -> bool {
        match msg {
            AwarenessMessage::Update {
                peer_id,
                clock,
                state,
            } => self.set(*peer_id, *clock, state.clone()),
            AwarenessMessage::Remove { peer_id } => self.remove(peer_id).is_some(),
        }
    }

    pub fn set(&mut self, peer_id: Uuid, clock: u64, state: AwarenessState) -> bool {
        if let Some(existing) = self.entries.get(&peer_id) {
            if clock <= existing.clock {
                return false;
            }
        }
        self.entries.insert(peer_id, Entry { clock, state });
        true
    }

    pub fn remove(&mut self, peer_id: &Uuid) -> Option<AwarenessState> {
        self.entries.remove(peer_id).map(|e| e.state)
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&AwarenessState> {
        self.entries.get(peer_id).map(|e| &e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &AwarenessState)> {
        self.entries.iter().map(|(id, e)| (id, &e.state))
    }

    /// Current table as update messages, for replay to a joiner.
    pub fn to_messages(&self) -> Vec<AwarenessMessage> {
        self.entries
            .iter()
            .map(|(peer_id, e)| AwarenessMessage::Update {
                peer_id: *peer_id,
                clock: e.clock,
                state: e.state.clone(),
            })
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room (client side)
// ───────────────────────────────────────────────────────────────────

/// Local awareness state plus everything known about remote peers.
pub struct PresenceRoom {
    local_peer_id: Uuid,
    local: AwarenessState,
    clock: u64,
    peers: AwarenessTable,
    last_selection_broadcast: Option<Instant>,
    /// A selection change was throttled and has not gone out yet.
    selection_pending: bool,
    /// Minimum interval between selection broadcasts (33ms = 30fps).
    selection_interval: Duration,
}

impl PresenceRoom {
    pub fn new(local_peer_id: Uuid) -> Self {
        Self::with_interval(local_peer_id, Duration::from_millis(33))
    }

    /// Create with custom broadcast interval (for testing).
    pub fn with_interval(local_peer_id: Uuid, interval: Duration) -> Self {
        Self {
            local_peer_id,
            local: AwarenessState::default(),
            clock: 0,
            peers: AwarenessTable::new(),
            last_selection_broadcast: None,
            selection_pending: false,
            selection_interval: interval,
        }
    }

    pub fn local_peer_id(&self) -> Uuid {
        self.local_peer_id
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    /// Replace the whole local state. Never throttled.
    pub fn set_local_state(&mut self, state: AwarenessState) -> AwarenessMessage {
        self.local = state;
        self.outgoing()
    }

    /// Move the local caret; `None` if throttled. A throttled selection is
    /// held back until [`flush_pending_selection`](Self::flush_pending_selection).
    pub fn update_local_selection(
        &mut self,
        selection: Option<SelectionRange>,
    ) -> Option<AwarenessMessage> {
        self.local.selection = selection;
        if let Some(last) = self.last_selection_broadcast {
            if last.elapsed() < self.selection_interval {
                self.selection_pending = true;
                return None;
            }
        }
        Some(self.outgoing())
    }

    /// Time until a held-back selection may go out; `None` if nothing is held back.
    pub fn pending_selection_delay(&self) -> Option<Duration> {
        if !self.selection_pending {
            return None;
        }
        let elapsed = self
            .last_selection_broadcast
            .map_or(self.selection_interval, |last| last.elapsed());
        Some(self.selection_interval.saturating_sub(elapsed))
    }

    /// The held-back selection, once its throttle window has closed.
    pub fn flush_pending_selection(&mut self) -> Option<AwarenessMessage> {
        match self.pending_selection_delay() {
            Some(wait) if wait.is_zero() => Some(self.outgoing()),
            _ => None,
        }
    }

    /// Broadcast the current local state regardless of rate limiting.
    pub fn force_broadcast(&mut self) -> AwarenessMessage {
        self.outgoing()
    }

    fn outgoing(&mut self) -> AwarenessMessage {
        self.clock += 1;
        self.last_selection_broadcast = Some(Instant::now());
        self.selection_pending = false;
        AwarenessMessage::Update {
            peer_id: self.local_peer_id,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Handle an incoming awareness message; own messages are ignored.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.peer_id() == self.local_peer_id {
            return false;
        }
        self.peers.apply(msg)
    }

    /// Drop a peer after a `PeerLeft` notification.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Forget all remote peers (on reconnect the server replays them).
    pub fn clear_remote(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&AwarenessState> {
        self.peers.get(peer_id)
    }

    pub fn remote_peers(&self) -> &AwarenessTable {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
