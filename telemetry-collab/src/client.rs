//! Editor-side connection: a local replica kept in sync over WebSocket.
//!
//! The client owns its own [`Bridge`]; local edits go through
//! [`SyncClient::edit`] and are shipped as `Update` frames, remote frames
//! are replayed into the tree by a reader task. Edits made while the
//! connection is down are rejected rather than queued.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use telemetry_core::{Bridge, CollabError, StorySnapshot, TreeEdit, TreeError, TreeSnapshot, TreeUpdate};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::{AwarenessMessage, AwarenessState, PresenceRoom, SelectionRange};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::room::DocumentId;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Remote edits were replayed into the local tree.
    RemoteChange(TreeUpdate),
    /// A full or partial state sync arrived after the initial one.
    Resynced,
    Awareness(AwarenessMessage),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The server reported an error.
    ServerError(String),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for the initial state")]
    Timeout,
    #[error("not connected")]
    Disconnected,
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<TreeError> for ClientError {
    fn from(e: TreeError) -> Self {
        ClientError::Collab(CollabError::Tree(e))
    }
}

struct Shared {
    bridge: Mutex<Bridge>,
    presence: Mutex<PresenceRoom>,
    peers: Mutex<HashMap<Uuid, PeerInfo>>,
    info: Mutex<PeerInfo>,
    state: Mutex<ConnectionState>,
    /// A task is waiting to send a throttled selection; only touched under
    /// the presence lock.
    selection_flush: AtomicBool,
}

/// The sync client.
pub struct SyncClient {
    doc_id: DocumentId,
    peer_id: Uuid,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Message>,
    runtime: Handle,
    events: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Connect to `ws://…/{doc_id}` and wait for the initial state.
    pub async fn connect(
        server_url: &str,
        doc_id: impl Into<DocumentId>,
        info: PeerInfo,
    ) -> Result<Self, ClientError> {
        Self::connect_with_timeout(server_url, doc_id, info, Duration::from_secs(10)).await
    }

    pub async fn connect_with_timeout(
        server_url: &str,
        doc_id: impl Into<DocumentId>,
        info: PeerInfo,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let doc_id = doc_id.into();
        let url = format!("{}/{doc_id}", server_url.trim_end_matches('/'));
        let (ws, _) = tokio_tungstenite::connect_async_with_config(url.as_str(), Some(crate::server::ws_config()), false)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let hello = SyncMessage::peer_joined(&info)?.encode()?;
        sink.send(Message::Binary(hello.into()))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let initial = tokio::time::timeout(timeout, async {
            while let Some(frame) = stream.next().await {
                let Ok(Message::Binary(data)) = frame else {
                    continue;
                };
                let msg = SyncMessage::decode(&data)?;
                match msg.msg_type {
                    MessageType::SyncStep2 => return Ok(msg.payload),
                    MessageType::Error => return Err(ClientError::Rejected(msg.error_reason()?)),
                    _ => {}
                }
            }
            Err::<Vec<u8>, _>(ClientError::Disconnected)
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        let mut bridge = Bridge::new();
        bridge.apply_remote(&initial)?;

        let peer_id = info.peer_id;
        let mut presence = PresenceRoom::new(peer_id);
        presence.set_local_state(AwarenessState::new(info.name.clone()));

        let shared = Arc::new(Shared {
            bridge: Mutex::new(bridge),
            presence: Mutex::new(presence),
            peers: Mutex::new(HashMap::new()),
            info: Mutex::new(info),
            state: Mutex::new(ConnectionState::Connected),
            selection_flush: AtomicBool::new(false),
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if sink.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader = {
            let shared = shared.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                            Ok(msg) => {
                                if let Some(event) = handle_frame(&shared, &out_tx, msg) {
                                    let _ = event_tx.send(event);
                                }
                            }
                            Err(e) => log::warn!("dropping undecodable frame: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                *shared.state.lock() = ConnectionState::Disconnected;
                shared.presence.lock().clear_remote();
                shared.peers.lock().clear();
                let _ = event_tx.send(SyncEvent::Disconnected);
            })
        };

        Ok(Self {
            doc_id,
            peer_id,
            shared,
            outgoing: out_tx,
            runtime: Handle::current(),
            events: Some(event_rx),
            tasks: vec![writer, reader],
        })
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Own info; carries the colour the server assigned once it arrived.
    pub fn info(&self) -> PeerInfo {
        self.shared.info.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.events.take()
    }

    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.shared.bridge.lock().snapshot()
    }

    pub fn story(&self) -> StorySnapshot {
        StorySnapshot::derive(&self.snapshot())
    }

    /// Other peers currently in the room.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.peers.lock().values().cloned().collect()
    }

    pub fn remote_awareness(&self) -> Vec<(Uuid, AwarenessState)> {
        self.shared
            .presence
            .lock()
            .remote_peers()
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect()
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(ClientError::Disconnected),
        }
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::Binary(msg.encode()?.into()))
            .map_err(|_| ClientError::Disconnected)
    }

    /// Apply a local edit and ship it; `false` if nothing changed.
    pub fn edit<F>(&self, f: F) -> Result<bool, ClientError>
    where
        F: FnOnce(&mut TreeEdit) -> Result<(), TreeError>,
    {
        self.ensure_connected()?;
        let Some(update) = self.shared.bridge.lock().apply_local(f)? else {
            return Ok(false);
        };
        self.send(&SyncMessage::update(self.peer_id, 0, update))?;
        Ok(true)
    }

    /// Replace the whole local awareness state.
    pub fn set_awareness(&self, state: AwarenessState) -> Result<(), ClientError> {
        self.ensure_connected()?;
        let message = self.shared.presence.lock().set_local_state(state);
        self.send(&SyncMessage::awareness(self.peer_id, 0, &message)?)
    }

    /// Move the caret; returns `false` when the broadcast was throttled.
    /// A throttled caret still goes out once the throttle window closes.
    pub fn update_selection(&self, selection: Option<SelectionRange>) -> Result<bool, ClientError> {
        self.ensure_connected()?;
        let message = {
            let mut presence = self.shared.presence.lock();
            let message = presence.update_local_selection(selection);
            if message.is_none() && !self.shared.selection_flush.swap(true, Ordering::Relaxed) {
                self.runtime.spawn(flush_selection(
                    self.shared.clone(),
                    self.outgoing.clone(),
                    self.peer_id,
                ));
            }
            message
        };
        match message {
            Some(message) => {
                self.send(&SyncMessage::awareness(self.peer_id, 0, &message)?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ask the server for anything this replica is missing.
    pub fn request_sync(&self) -> Result<(), ClientError> {
        self.ensure_connected()?;
        let state_vector = self.shared.bridge.lock().replica().state_vector();
        self.send(&SyncMessage::sync_step1(self.peer_id, state_vector))
    }

    /// Announce departure and close the socket.
    pub async fn disconnect(&mut self) {
        let mut tasks = std::mem::take(&mut self.tasks);
        if self.state() == ConnectionState::Connected && !tasks.is_empty() {
            let _ = self.send(&SyncMessage::peer_left(self.peer_id));
            let _ = self.outgoing.send(Message::Close(None));
            // the writer stops by itself after the close frame
            let writer = tasks.remove(0);
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                log::debug!("writer did not finish closing {}", self.doc_id);
            }
        }
        *self.shared.state.lock() = ConnectionState::Disconnected;
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Wait out the throttle window, then send whatever selection is still held back.
async fn flush_selection(shared: Arc<Shared>, outgoing: mpsc::UnboundedSender<Message>, peer_id: Uuid) {
    loop {
        let step = {
            let mut presence = shared.presence.lock();
            match presence.pending_selection_delay() {
                Some(wait) if !wait.is_zero() => ControlFlow::Continue(wait),
                _ => {
                    shared.selection_flush.store(false, Ordering::Relaxed);
                    ControlFlow::Break(presence.flush_pending_selection())
                }
            }
        };
        match step {
            ControlFlow::Continue(wait) => tokio::time::sleep(wait).await,
            ControlFlow::Break(Some(message)) => {
                if *shared.state.lock() != ConnectionState::Connected {
                    return;
                }
                match SyncMessage::awareness(peer_id, 0, &message).and_then(|msg| msg.encode()) {
                    Ok(frame) => {
                        let _ = outgoing.send(Message::Binary(frame.into()));
                    }
                    Err(e) => log::warn!("dropping held-back selection: {e}"),
                }
                return;
            }
            ControlFlow::Break(None) => return,
        }
    }
}

fn handle_frame(
    shared: &Shared,
    outgoing: &mpsc::UnboundedSender<Message>,
    msg: SyncMessage,
) -> Option<SyncEvent> {
    match msg.msg_type {
        MessageType::Update => match shared.bridge.lock().apply_remote(&msg.payload) {
            Ok(update) => update.map(SyncEvent::RemoteChange),
            Err(e) => {
                log::warn!("dropping remote update: {e}");
                None
            }
        },
        MessageType::SyncStep2 => match shared.bridge.lock().apply_remote(&msg.payload) {
            Ok(_) => Some(SyncEvent::Resynced),
            Err(e) => {
                log::warn!("dropping state sync: {e}");
                None
            }
        },
        MessageType::Awareness => {
            let message = msg.awareness_message().ok()?;
            shared
                .presence
                .lock()
                .handle_message(&message)
                .then_some(SyncEvent::Awareness(message))
        }
        MessageType::PeerJoined => {
            let info = msg.peer_info().ok()?;
            if info.peer_id == shared.presence.lock().local_peer_id() {
                *shared.info.lock() = info;
                return None;
            }
            shared.peers.lock().insert(info.peer_id, info.clone());
            Some(SyncEvent::PeerJoined(info))
        }
        MessageType::PeerLeft => {
            shared.peers.lock().remove(&msg.peer_id);
            shared.presence.lock().remove_peer(&msg.peer_id);
            Some(SyncEvent::PeerLeft(msg.peer_id))
        }
        MessageType::Ping => {
            let pong = SyncMessage::pong(msg.peer_id).encode().ok()?;
            let _ = outgoing.send(Message::Binary(pong.into()));
            None
        }
        MessageType::Error => Some(SyncEvent::ServerError(msg.error_reason().unwrap_or_default())),
        _ => None,
    }
}
