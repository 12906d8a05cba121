//! CRDT replication of the document tree.
//!
//! ```text
//!   local edit ──► DocumentTree ──► Bridge::on_tree_update ──► Replica (Local origin)
//!                                                                  │ encoded update
//!                                                                  ▼
//!                                                               transport
//!                                                                  │
//!   DocumentTree ◄── Bridge::remote_operations_to_tree_mutation ◄── Replica (Remote origin)
//! ```

pub mod bridge;
pub mod replica;

use thiserror::Error;

use crate::tree::TreeError;

pub use bridge::{tree_change_to_operations, Bridge};
pub use replica::{BlockDelta, Replica, ReplicatedChange, TextDelta};

/// Errors raised while exchanging updates with a replica.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollabError {
    #[error("malformed update: {0}")]
    Decode(String),
    #[error("update could not be integrated: {0}")]
    Apply(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
}
