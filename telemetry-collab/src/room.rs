//! One story being edited: a tokio task that owns the replica.
//!
//! ```text
//!  connections ──► RoomHandle ──► mpsc (one queue) ──► Room task
//!                                                         │  Bridge (replica + tree)
//!                                                         │  BroadcastGroup ──► relays
//!                                                         │  AwarenessTable
//!                                                         ▼
//!                                         debounced persist ──► StoryStore::push
//! ```
//!
//! Everything that touches the replica runs on the room task, one command
//! at a time. The only suspension point is the initial fetch; every push,
//! including the flush before an idle room closes, runs in a spawned task
//! and reports back through the same queue.
//!
//! Lifecycle: `Uninitialized → Loading → Ready ⇄ Persisting → Idle → Closed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use telemetry_core::{initial_blocks, Bridge, StorySnapshot};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Relay};
use crate::presence::{AwarenessMessage, AwarenessTable, CursorColor};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};
use crate::storage::{StoreError, StoryStore, StoryUpdate};

/// Key of a room: the story id as text (numeric ids keep their decimal form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for DocumentId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Uninitialized,
    Loading,
    Ready,
    Persisting,
    Idle,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Quiet period after the last change before a push (default: 1s)
    pub persist_debounce: Duration,
    /// Upper bound on how long a change may wait for a push (default: 10s)
    pub persist_max_wait: Duration,
    /// Delay before retrying a failed push (default: 5s)
    pub persist_retry: Duration,
    /// How long an empty room lingers before closing (default: 0)
    pub idle_timeout: Duration,
    /// Relay frames buffered per connection (default: 256)
    pub broadcast_capacity: usize,
    pub max_peers: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_secs(1),
            persist_max_wait: Duration::from_secs(10),
            persist_retry: Duration::from_secs(5),
            idle_timeout: Duration::ZERO,
            broadcast_capacity: 256,
            max_peers: 100,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RoomError {
    #[error("story {0} not found")]
    NotFound(DocumentId),
    #[error("loading story {id} failed: {reason}")]
    Load { id: DocumentId, reason: String },
    #[error("room {0} is full")]
    Full(DocumentId),
    #[error("room {0} is closed")]
    Closed(DocumentId),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Everything a new connection needs before it sees any relay.
pub struct JoinAccepted {
    /// Full encoded document state.
    pub state: Vec<u8>,
    /// The joiner's own info with the colour it was assigned.
    pub info: PeerInfo,
    /// Connections that were already in the room.
    pub peers: Vec<PeerInfo>,
    pub awareness: Vec<AwarenessMessage>,
    pub relay: broadcast::Receiver<Arc<Relay>>,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub id: DocumentId,
    pub state: RoomState,
    pub connections: usize,
    pub revision: u64,
    pub dirty: bool,
    pub persists: u64,
    pub persist_failures: u64,
    pub snapshot: StorySnapshot,
}

pub(crate) enum RoomCommand {
    Join {
        info: PeerInfo,
        reply: oneshot::Sender<Result<JoinAccepted, RoomError>>,
    },
    Update {
        peer_id: Uuid,
        bytes: Vec<u8>,
    },
    SyncStep1 {
        state_vector: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, RoomError>>,
    },
    Awareness {
        peer_id: Uuid,
        message: AwarenessMessage,
    },
    Leave {
        peer_id: Uuid,
    },
    Resync {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Inspect {
        reply: oneshot::Sender<RoomInfo>,
    },
    PersistDone {
        result: Result<(), StoreError>,
    },
}

pub(crate) type RoomTable = Arc<Mutex<HashMap<DocumentId, RoomHandle>>>;

// ─── Handle ─────────────────────────────────────────────────────────

/// Cheap, cloneable address of a room task.
#[derive(Clone)]
pub struct RoomHandle {
    id: DocumentId,
    generation: u64,
    tx: mpsc::UnboundedSender<RoomCommand>,
    state: watch::Receiver<RoomState>,
}

impl RoomHandle {
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    /// Wait until the room reaches `target` (or closes).
    pub async fn wait_for_state(&self, target: RoomState) -> RoomState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|s| *s == target || *s == RoomState::Closed).await {
            Ok(state) => *state,
            Err(_) => RoomState::Closed,
        };
        state
    }

    /// Queue a command; hands it back if the room is gone.
    pub(crate) fn send(&self, cmd: RoomCommand) -> Result<(), RoomCommand> {
        self.tx.send(cmd).map_err(|e| e.0)
    }

    fn post(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.send(cmd).map_err(|_| RoomError::Closed(self.id.clone()))
    }

    pub fn update(&self, peer_id: Uuid, bytes: Vec<u8>) -> Result<(), RoomError> {
        self.post(RoomCommand::Update { peer_id, bytes })
    }

    pub fn awareness(&self, peer_id: Uuid, message: AwarenessMessage) -> Result<(), RoomError> {
        self.post(RoomCommand::Awareness { peer_id, message })
    }

    pub fn leave(&self, peer_id: Uuid) {
        if self.post(RoomCommand::Leave { peer_id }).is_err() {
            log::debug!("leave of {peer_id} after room {} closed", self.id);
        }
    }

    /// Diff between the room's state and a peer's state vector.
    pub async fn sync_step1(&self, state_vector: Vec<u8>) -> Result<Vec<u8>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.post(RoomCommand::SyncStep1 { state_vector, reply })?;
        rx.await.map_err(|_| RoomError::Closed(self.id.clone()))?
    }

    /// Full encoded state.
    pub async fn resync(&self) -> Result<Vec<u8>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.post(RoomCommand::Resync { reply })?;
        rx.await.map_err(|_| RoomError::Closed(self.id.clone()))
    }

    pub async fn inspect(&self) -> Result<RoomInfo, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.post(RoomCommand::Inspect { reply })?;
        rx.await.map_err(|_| RoomError::Closed(self.id.clone()))
    }
}

/// Start a room task; the caller registers the handle.
pub(crate) fn spawn(
    id: DocumentId,
    generation: u64,
    config: RoomConfig,
    store: Arc<dyn StoryStore>,
    table: RoomTable,
) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(RoomState::Uninitialized);

    let room = Room {
        id: id.clone(),
        generation,
        group: BroadcastGroup::new(config.broadcast_capacity),
        config,
        store,
        table,
        rx,
        tx: tx.downgrade(),
        state_tx,
        bridge: Bridge::new(),
        awareness: AwarenessTable::new(),
        author_id: None,
        dirty: false,
        dirty_since: None,
        persist_in_flight: false,
        persist_at: None,
        idle_at: None,
        persists: 0,
        persist_failures: 0,
    };
    tokio::spawn(room.run());

    RoomHandle {
        id,
        generation,
        tx,
        state: state_rx,
    }
}

// ─── Task ───────────────────────────────────────────────────────────

struct Room {
    id: DocumentId,
    generation: u64,
    config: RoomConfig,
    store: Arc<dyn StoryStore>,
    table: RoomTable,
    rx: mpsc::UnboundedReceiver<RoomCommand>,
    tx: mpsc::WeakUnboundedSender<RoomCommand>,
    state_tx: watch::Sender<RoomState>,

    bridge: Bridge,
    group: BroadcastGroup,
    awareness: AwarenessTable,
    author_id: Option<String>,

    dirty: bool,
    dirty_since: Option<Instant>,
    persist_in_flight: bool,
    persist_at: Option<Instant>,
    idle_at: Option<Instant>,
    persists: u64,
    persist_failures: u64,
}

impl Room {
    async fn run(mut self) {
        self.set_state(RoomState::Loading);
        if let Err(e) = self.load().await {
            log::warn!("room {}: {e}", self.id);
            self.fail(e).await;
            return;
        }
        log::info!(
            "room {} ready ({} blocks)",
            self.id,
            self.bridge.snapshot().block_count()
        );
        self.set_state(RoomState::Ready);
        self.idle_at = Some(Instant::now() + self.config.idle_timeout);

        loop {
            let deadline = match (self.persist_at, self.idle_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            tokio::select! {
                biased;
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.on_timer().await {
                        break;
                    }
                }
            }
        }
    }

    async fn load(&mut self) -> Result<(), RoomError> {
        let record = self
            .store
            .fetch(self.id.as_str())
            .await
            .map_err(|e| RoomError::Load {
                id: self.id.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| RoomError::NotFound(self.id.clone()))?;

        let blocks = initial_blocks(&record.content, record.title.as_deref());
        self.bridge.seed(&blocks).map_err(|e| RoomError::Load {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;
        self.author_id = record.author_id;
        Ok(())
    }

    /// Load failed: unregister, answer every queued joiner, close.
    async fn fail(mut self, error: RoomError) {
        let table = self.table.clone();
        let mut rooms = table.lock().await;
        self.unregister(&mut rooms);
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                RoomCommand::Join { reply, .. } => {
                    let _ = reply.send(Err(error.clone()));
                }
                RoomCommand::SyncStep1 { reply, .. } => {
                    let _ = reply.send(Err(error.clone()));
                }
                _ => {}
            }
        }
        drop(rooms);
        self.set_state(RoomState::Closed);
    }

    fn unregister(&self, rooms: &mut HashMap<DocumentId, RoomHandle>) {
        if rooms
            .get(&self.id)
            .is_some_and(|h| h.generation() == self.generation)
        {
            rooms.remove(&self.id);
        }
    }

    fn set_state(&self, state: RoomState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            log::debug!("room {}: {prev:?} → {state:?}", self.id);
        }
    }

    fn resting_state(&self) -> RoomState {
        if self.persist_in_flight {
            RoomState::Persisting
        } else if self.group.peer_count() == 0 {
            RoomState::Idle
        } else {
            RoomState::Ready
        }
    }

    fn relay(&self, origin: Option<Uuid>, msg: &SyncMessage) {
        if let Err(e) = self.group.relay(origin, msg) {
            log::error!("room {}: relay failed: {e}", self.id);
        }
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { info, reply } => self.on_join(info, reply),
            RoomCommand::Update { peer_id, bytes } => self.on_update(peer_id, bytes),
            RoomCommand::SyncStep1 { state_vector, reply } => {
                let diff = self
                    .bridge
                    .replica()
                    .encode_diff(&state_vector)
                    .map_err(|e| RoomError::Rejected(e.to_string()));
                let _ = reply.send(diff);
            }
            RoomCommand::Awareness { peer_id, message } => self.on_awareness(peer_id, message),
            RoomCommand::Leave { peer_id } => self.on_leave(peer_id),
            RoomCommand::Resync { reply } => {
                let _ = reply.send(self.bridge.encode_state());
            }
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.info());
            }
            RoomCommand::PersistDone { result } => self.on_persist_done(result),
        }
    }

    fn on_join(&mut self, mut info: PeerInfo, reply: oneshot::Sender<Result<JoinAccepted, RoomError>>) {
        if self.group.peer_count() >= self.config.max_peers {
            let _ = reply.send(Err(RoomError::Full(self.id.clone())));
            return;
        }

        let is_author = self.author_id.is_some() && info.user_id == self.author_id;
        info.color = if is_author {
            CursorColor::AUTHOR.to_hex()
        } else {
            CursorColor::from_uuid(info.peer_id).to_hex()
        };

        let peer_id = info.peer_id;
        let peers = self.group.peers();
        let state = self.bridge.encode_state();
        let awareness = self.awareness.to_messages();

        // announce before subscribing so the joiner never sees its own join
        match SyncMessage::peer_joined(&info) {
            Ok(msg) => self.relay(Some(peer_id), &msg),
            Err(e) => log::error!("room {}: {e}", self.id),
        }
        let accepted = JoinAccepted {
            state,
            info: info.clone(),
            peers,
            awareness,
            relay: self.group.add_peer(info.clone()),
        };
        if reply.send(Ok(accepted)).is_err() {
            // joiner went away while queued
            self.group.remove_peer(&peer_id);
            self.relay(None, &SyncMessage::peer_left(peer_id));
            return;
        }

        self.idle_at = None;
        self.set_state(self.resting_state());
        log::info!(
            "peer {peer_id} ({}) joined room {} ({} connections)",
            info.name,
            self.id,
            self.group.peer_count()
        );
    }

    fn on_update(&mut self, peer_id: Uuid, bytes: Vec<u8>) {
        if !self.group.has_peer(&peer_id) {
            log::debug!("room {}: update from unknown peer {peer_id} ignored", self.id);
            return;
        }
        match self.bridge.apply_remote(&bytes) {
            Ok(changed) => {
                self.relay(Some(peer_id), &SyncMessage::update(peer_id, 0, bytes));
                if changed.is_some() {
                    self.mark_dirty();
                }
            }
            Err(e) => log::warn!("room {}: rejected update from {peer_id}: {e}", self.id),
        }
    }

    fn on_awareness(&mut self, peer_id: Uuid, message: AwarenessMessage) {
        let Some(color) = self.group.peer(&peer_id).map(|p| p.color.clone()) else {
            return;
        };
        if message.peer_id() != peer_id {
            log::debug!("room {}: {peer_id} sent awareness for another peer", self.id);
            return;
        }
        let message = match message {
            AwarenessMessage::Update {
                peer_id,
                clock,
                mut state,
            } => {
                state.color = color;
                AwarenessMessage::Update {
                    peer_id,
                    clock,
                    state,
                }
            }
            remove => remove,
        };
        if self.awareness.apply(&message) {
            match SyncMessage::awareness(peer_id, 0, &message) {
                Ok(msg) => self.relay(Some(peer_id), &msg),
                Err(e) => log::error!("room {}: {e}", self.id),
            }
        }
    }

    fn on_leave(&mut self, peer_id: Uuid) {
        if self.group.remove_peer(&peer_id).is_none() {
            return;
        }
        if self.awareness.remove(&peer_id).is_some() {
            match SyncMessage::awareness(peer_id, 0, &AwarenessMessage::Remove { peer_id }) {
                Ok(msg) => self.relay(None, &msg),
                Err(e) => log::error!("room {}: {e}", self.id),
            }
        }
        self.relay(None, &SyncMessage::peer_left(peer_id));
        log::info!(
            "peer {peer_id} left room {} ({} connections)",
            self.id,
            self.group.peer_count()
        );

        if self.group.peer_count() == 0 {
            self.idle_at = Some(Instant::now() + self.config.idle_timeout);
        }
        self.set_state(self.resting_state());
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            state: *self.state_tx.borrow(),
            connections: self.group.peer_count(),
            revision: self.bridge.revision(),
            dirty: self.dirty,
            persists: self.persists,
            persist_failures: self.persist_failures,
            snapshot: StorySnapshot::derive(&self.bridge.snapshot()),
        }
    }

    // ─── Persistence ────────────────────────────────────────────────

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.dirty_since.get_or_insert_with(Instant::now);
        self.schedule_persist(self.config.persist_debounce);
    }

    /// (Re)arm the push timer, never past the max-wait bound.
    fn schedule_persist(&mut self, delay: Duration) {
        let mut at = Instant::now() + delay;
        if let Some(since) = self.dirty_since {
            at = at.min(since + self.config.persist_max_wait);
        }
        self.persist_at = Some(at);
    }

    fn take_update(&mut self) -> StoryUpdate {
        self.dirty = false;
        self.dirty_since = None;
        StoryUpdate::from(StorySnapshot::derive(&self.bridge.snapshot()))
    }

    fn start_persist(&mut self) {
        if self.persist_in_flight || !self.dirty {
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let update = self.take_update();
        self.persist_in_flight = true;
        self.set_state(RoomState::Persisting);

        let store = self.store.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let result = store.push(id.as_str(), update).await;
            let _ = tx.send(RoomCommand::PersistDone { result });
        });
    }

    fn on_persist_done(&mut self, result: Result<(), StoreError>) {
        self.persist_in_flight = false;
        match result {
            Ok(()) => {
                self.persists += 1;
                log::info!("room {}: persisted", self.id);
                if self.dirty {
                    self.schedule_persist(self.config.persist_debounce);
                }
            }
            Err(e) => {
                self.persist_failures += 1;
                log::warn!(
                    "room {}: persist failed, retrying in {:?}: {e}",
                    self.id,
                    self.config.persist_retry
                );
                self.dirty = true;
                self.dirty_since.get_or_insert_with(Instant::now);
                self.persist_at = Some(Instant::now() + self.config.persist_retry);
            }
        }
        if self.group.peer_count() == 0 && self.idle_at.is_none() {
            let delay = if self.dirty {
                self.config.persist_retry
            } else {
                Duration::ZERO
            };
            self.idle_at = Some(Instant::now() + delay);
        }
        self.set_state(self.resting_state());
    }

    /// Returns true once the room has closed.
    async fn on_timer(&mut self) -> bool {
        let now = Instant::now();
        if self.persist_at.is_some_and(|at| at <= now) {
            self.persist_at = None;
            self.start_persist();
        }
        if self.idle_at.is_some_and(|at| at <= now) {
            self.idle_at = None;
            return self.try_close().await;
        }
        false
    }

    async fn try_close(&mut self) -> bool {
        if self.group.peer_count() > 0 {
            return false;
        }
        if self.persist_in_flight {
            // re-armed by on_persist_done
            return false;
        }
        if self.dirty {
            // flush off the task; on_persist_done re-arms the idle timer
            self.start_persist();
            return false;
        }

        let table = self.table.clone();
        let mut rooms = table.lock().await;
        // anything queued before we took the lock is still ours to serve
        while let Ok(cmd) = self.rx.try_recv() {
            self.handle(cmd);
        }
        if self.group.peer_count() > 0 {
            return false;
        }
        self.unregister(&mut rooms);
        self.rx.close();
        drop(rooms);

        self.persist_at = None;
        self.set_state(RoomState::Closed);
        log::info!("room {} closed", self.id);
        true
    }
}
