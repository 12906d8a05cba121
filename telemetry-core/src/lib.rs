//! Document model and CRDT bridge for collaborative story editing.
//!
//! ```text
//!   stored markup ──► markup::parse ──► DocumentTree ◄──► collab::Bridge ◄──► yrs replica
//!                                            │
//!                                            ▼
//!                                  snapshot::StorySnapshot ──► story store
//! ```
//!
//! The tree is the authoritative editing surface; the replica is what gets
//! exchanged between peers. [`collab::Bridge`] keeps the two in lockstep.

pub mod collab;
pub mod markup;
pub mod snapshot;
pub mod tree;

pub use collab::{Bridge, CollabError, Replica, ReplicatedChange};
pub use snapshot::{initial_blocks, word_count, StorySnapshot, BODY_PLACEHOLDER, TITLE_PLACEHOLDER};
pub use tree::{
    BlockKind, BlockSpec, ChangeOrigin, DocumentTree, Format, NodeKey, RunSpec, TreeEdit,
    TreeError, TreeSnapshot, TreeUpdate,
};
