//! # telemetry-collab — rooms, transport and persistence for live editing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │
//! │ (per editor)│   bincode frames   │ (per process)│
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │ RoomRegistry
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐     ┌─────────────┐
//! │ Bridge      │                    │ Room task    │ ──► │ StoryStore  │
//! │ (local)     │                    │ Bridge +     │     │ http/rocks/ │
//! └─────────────┘                    │ BroadcastGrp │     │ memory      │
//!                                    └──────────────┘     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire frames (bincode-encoded [`SyncMessage`])
//! - [`presence`] — awareness states, colours, client-side throttling
//! - [`broadcast`] — per-room fan-out with lag detection
//! - [`room`] — the per-story actor: load, relay, debounced persist, eviction
//! - [`registry`] — story id → room
//! - [`server`] — WebSocket front end
//! - [`client`] — editor-side connection
//! - [`storage`] — where stories are loaded from and pushed to

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Relay};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use presence::{
    AwarenessMessage, AwarenessState, AwarenessTable, CaretPosition, CursorColor, PresenceRoom,
    SelectionRange,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use registry::RoomRegistry;
pub use room::{DocumentId, JoinAccepted, RoomConfig, RoomError, RoomHandle, RoomInfo, RoomState};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{
    HttpStoreConfig, HttpStoryStore, MemoryStoryStore, RocksStoryStore, StoreConfig, StoreError,
    StoryMetadata, StoryRecord, StoryStore, StoryUpdate,
};
