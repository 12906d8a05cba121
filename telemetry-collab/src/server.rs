//! WebSocket front end: one task per connection, routed by story id.
//!
//! ```text
//! ws://host/{story_id}
//!
//! client                              server
//!   │ PeerJoined(info)  ──────────►   registry.join(story_id)
//!   │ ◄──────────  SyncStep2(full state)
//!   │ ◄──────────  PeerJoined(own info, assigned colour)
//!   │ ◄──────────  PeerJoined(each existing peer)
//!   │ ◄──────────  Awareness(each known state)
//!   │ Update / Awareness / SyncStep1 ⇄ relays from the room
//! ```
//!
//! A connection never sees its own updates echoed. If it falls behind the
//! room's relay buffer it receives a fresh `SyncStep2` with the full state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Relay;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, MAX_FRAME_SIZE};
use crate::registry::RoomRegistry;
use crate::room::{DocumentId, JoinAccepted, RoomConfig, RoomError, RoomHandle};
use crate::storage::StoryStore;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// How long a new connection has to send its `PeerJoined`
    pub handshake_timeout: Duration,
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            handshake_timeout: Duration::from_secs(10),
            room: RoomConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Room(#[from] RoomError),
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_frames: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    counters: Counters,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn StoryStore>) -> Self {
        let registry = Arc::new(RoomRegistry::new(store, config.room.clone()));
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.shared.registry
    }

    pub async fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
            total_bytes: c.total_bytes.load(Ordering::Relaxed),
            rejected_frames: c.rejected_frames.load(Ordering::Relaxed),
            active_rooms: self.shared.registry.active_rooms().await.len(),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);
                shared.counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(&shared, stream, addr).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
                shared.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

/// Story id from the request path: its last non-empty segment.
pub fn document_id_from_path(path: &str) -> Option<DocumentId> {
    path.split('?')
        .next()?
        .split('/')
        .filter(|segment| !segment.is_empty())
        .last()
        .map(DocumentId::from)
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), ServerError> {
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn reject(sink: &mut WsSink, reason: &str) -> Result<(), ServerError> {
    send(sink, &SyncMessage::error(Uuid::nil(), reason)).await?;
    sink.close().await?;
    Ok(())
}

/// Next sync frame, answering pings on the way; `None` on close.
async fn next_frame(
    shared: &Shared,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> Result<Option<SyncMessage>, ServerError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Binary(data) => {
                shared.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .total_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                match SyncMessage::decode(&data) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => {
                        shared.counters.rejected_frames.fetch_add(1, Ordering::Relaxed);
                        log::warn!("dropping undecodable frame: {e}");
                    }
                }
            }
            Message::Ping(payload) => sink.send(Message::Pong(payload)).await?,
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Skip everything until the client introduces itself.
async fn wait_for_hello(
    shared: &Shared,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> Result<Option<SyncMessage>, ServerError> {
    while let Some(msg) = next_frame(shared, sink, stream).await? {
        if msg.msg_type == MessageType::PeerJoined {
            return Ok(Some(msg));
        }
        log::debug!("ignoring {:?} frame before handshake", msg.msg_type);
    }
    Ok(None)
}

async fn handle_connection(shared: &Shared, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
    let mut path = String::new();
    let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, capture_path, Some(ws_config())).await?;
    let (mut sink, mut stream) = ws.split();

    let Some(doc_id) = document_id_from_path(&path) else {
        return reject(&mut sink, "missing story id").await;
    };

    let handshake = tokio::time::timeout(
        shared.config.handshake_timeout,
        wait_for_hello(shared, &mut sink, &mut stream),
    )
    .await;
    let hello = match handshake {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return reject(&mut sink, "handshake timed out").await,
    };

    let mut info = hello
        .peer_info()
        .unwrap_or_else(|_| PeerInfo::with_id(hello.peer_id, "Anonymous"));
    info.peer_id = hello.peer_id;

    let joined = shared.registry.join(&doc_id, info).await;
    let (room, JoinAccepted { state, info, peers, awareness, relay }) = match joined {
        Ok(joined) => joined,
        Err(e) => {
            log::warn!("{addr} could not join story {doc_id}: {e}");
            return reject(&mut sink, &e.to_string()).await;
        }
    };
    let peer_id = info.peer_id;

    let result = match greet(&mut sink, state, &info, &peers, &awareness).await {
        Ok(()) => {
            log::info!("{addr} joined story {doc_id} as {peer_id}");
            pump(shared, &room, peer_id, relay, &mut sink, &mut stream).await
        }
        Err(e) => Err(e),
    };

    room.leave(peer_id);
    log::info!("{peer_id} disconnected from story {doc_id}");
    result
}

/// Everything a joiner is sent before its first relay.
async fn greet(
    sink: &mut WsSink,
    state: Vec<u8>,
    info: &PeerInfo,
    peers: &[PeerInfo],
    awareness: &[AwarenessMessage],
) -> Result<(), ServerError> {
    send(sink, &SyncMessage::sync_step2(Uuid::nil(), state)).await?;
    send(sink, &SyncMessage::peer_joined(info)?).await?;
    for peer in peers {
        send(sink, &SyncMessage::peer_joined(peer)?).await?;
    }
    for message in awareness {
        send(sink, &SyncMessage::awareness(message.peer_id(), 0, message)?).await?;
    }
    Ok(())
}

/// Main loop of a joined connection.
async fn pump(
    shared: &Shared,
    room: &RoomHandle,
    peer_id: Uuid,
    mut relay: tokio::sync::broadcast::Receiver<Arc<Relay>>,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> Result<(), ServerError> {
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(shared.config.heartbeat_interval_secs.max(1)));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = next_frame(shared, sink, stream) => {
                let Some(msg) = frame? else {
                    return Ok(());
                };
                match msg.msg_type {
                    MessageType::Update => room.update(peer_id, msg.payload)?,
                    MessageType::Awareness => match msg.awareness_message() {
                        Ok(awareness) => room.awareness(peer_id, awareness)?,
                        Err(e) => log::warn!("{peer_id}: bad awareness payload: {e}"),
                    },
                    MessageType::SyncStep1 => match room.sync_step1(msg.payload).await {
                        Ok(diff) => send(sink, &SyncMessage::sync_step2(Uuid::nil(), diff)).await?,
                        Err(RoomError::Rejected(reason)) => {
                            send(sink, &SyncMessage::error(Uuid::nil(), &reason)).await?
                        }
                        Err(e) => return Err(e.into()),
                    },
                    MessageType::Ping => send(sink, &SyncMessage::pong(Uuid::nil())).await?,
                    MessageType::Pong => {}
                    MessageType::PeerLeft => return Ok(()),
                    other => log::debug!("{peer_id}: ignoring {other:?} frame"),
                }
            }
            relayed = relay.recv() => match relayed {
                Ok(relayed) => {
                    if relayed.is_for(peer_id) {
                        sink.send(Message::Binary(relayed.bytes.clone().into())).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("{peer_id} lagged by {skipped} frames; resyncing");
                    let state = room.resync().await?;
                    send(sink, &SyncMessage::sync_step2(Uuid::nil(), state)).await?;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = heartbeat.tick() => send(sink, &SyncMessage::ping(Uuid::nil())).await?,
        }
    }
}

/// Frames past the decode limit are refused by the socket before they are buffered.
pub(crate) fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_FRAME_SIZE))
        .max_frame_size(Some(MAX_FRAME_SIZE))
}
