//! Replicated document store backed by a yrs `Doc`.
//!
//! Layout of the shared document:
//! ```text
//! "blocks": Array
//!   ├── Map { "kind": "title",     "text": Text }
//!   ├── Map { "kind": "paragraph", "text": Text }
//!   └── ...
//! ```
//! Inline formats are text attributes (`bold`, `italic`, ...) set to `true`.
//! Text positions are UTF-16 code units so they line up with both the event
//! deltas and browser peers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use yrs::types::text::{Diff, YChange};
use yrs::types::{Attrs, Change, Delta, EntryChange, Event, Events, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, DeepObservable, Doc, Map, MapPrelim, MapRef, OffsetKind, Options,
    Origin, Out, ReadTxn, StateVector, Subscription, Text, TextPrelim, TextRef, Transact,
    TransactionMut, Update,
};

use super::CollabError;
use crate::tree::{BlockKind, BlockSpec, ChangeOrigin, Format, RunSpec};

pub(crate) const BLOCKS: &str = "blocks";
pub(crate) const KIND: &str = "kind";
pub(crate) const TEXT: &str = "text";

const LOCAL_ORIGIN: &str = "telemetry:local";
const REMOTE_ORIGIN: &str = "telemetry:remote";

fn origin_token(origin: ChangeOrigin) -> Origin {
    match origin {
        ChangeOrigin::Local => Origin::from(LOCAL_ORIGIN),
        ChangeOrigin::Remote => Origin::from(REMOTE_ORIGIN),
    }
}

// ─── Owned change records ───────────────────────────────────────────

/// Structural change of the block array.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Retain(usize),
    Remove(usize),
    Insert(Vec<BlockSpec>),
}

/// Change of one block's text, in UTF-16 units.
#[derive(Debug, Clone, PartialEq)]
pub enum TextDelta {
    Retain { len: usize, set: Format, clear: Format },
    Delete(usize),
    Insert { text: String, format: Format },
}

/// A committed non-local replica change, detached from the transaction.
///
/// Block indices refer to the order after the transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicatedChange {
    Blocks(Vec<BlockDelta>),
    Kind { index: usize, kind: BlockKind },
    Text { index: usize, delta: Vec<TextDelta> },
    /// The block's text object was replaced; carries the new content.
    Reset { index: usize, block: BlockSpec },
    /// An event the tree mapping does not cover.
    Unrecognized(String),
}

impl ReplicatedChange {
    /// Replay order within one transaction: structure, then kinds, then text.
    fn rank(&self) -> u8 {
        match self {
            ReplicatedChange::Blocks(_) => 0,
            ReplicatedChange::Kind { .. } | ReplicatedChange::Reset { .. } => 1,
            ReplicatedChange::Text { .. } => 2,
            ReplicatedChange::Unrecognized(_) => 3,
        }
    }
}

// ─── Attribute helpers ──────────────────────────────────────────────

/// Full attribute set for `format`: every known flag is either `true` or
/// cleared with `null`, so inserted text never inherits neighbour formats.
pub(crate) fn format_attrs(format: Format) -> Attrs {
    Format::NAMED
        .iter()
        .map(|(name, flag)| {
            let value = if format.contains(*flag) {
                Any::Bool(true)
            } else {
                Any::Null
            };
            (Arc::<str>::from(*name), value)
        })
        .collect()
}

fn attrs_to_format(attrs: Option<&Attrs>) -> Format {
    let mut format = Format::empty();
    if let Some(attrs) = attrs {
        for (name, value) in attrs.iter() {
            if let Some(flag) = Format::from_attr_name(name) {
                if *value == Any::Bool(true) {
                    format |= flag;
                }
            }
        }
    }
    format
}

fn attrs_to_patch(attrs: Option<&Attrs>) -> (Format, Format) {
    let mut set = Format::empty();
    let mut clear = Format::empty();
    if let Some(attrs) = attrs {
        for (name, value) in attrs.iter() {
            if let Some(flag) = Format::from_attr_name(name) {
                if *value == Any::Bool(true) {
                    set |= flag;
                } else {
                    clear |= flag;
                }
            }
        }
    }
    (set, clear)
}

fn out_string(value: &Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

pub(crate) fn parse_kind(value: Option<Out>) -> BlockKind {
    let raw = value.as_ref().and_then(out_string);
    match raw.as_deref().map(str::parse::<BlockKind>) {
        Some(Ok(kind)) => kind,
        other => {
            log::warn!("unrecognized block kind {other:?}; treating as paragraph");
            BlockKind::Paragraph
        }
    }
}

/// Read one block map into a spec.
pub(crate) fn read_block<T: ReadTxn>(txn: &T, map: &MapRef) -> BlockSpec {
    let kind = parse_kind(map.get(txn, KIND));
    let runs = match map.get(txn, TEXT) {
        Some(Out::YText(text)) => read_runs(txn, &text),
        _ => Vec::new(),
    };
    BlockSpec::new(kind, runs)
}

fn read_runs<T: ReadTxn>(txn: &T, text: &TextRef) -> Vec<RunSpec> {
    let diffs: Vec<Diff<YChange>> = text.diff(txn, YChange::identity);
    diffs
        .iter()
        .filter_map(|d| {
            let s = out_string(&d.insert)?;
            Some(RunSpec::new(s, attrs_to_format(d.attributes.as_deref())))
        })
        .collect()
}

// ─── Event conversion ───────────────────────────────────────────────

fn convert_event(txn: &TransactionMut, event: &Event) -> ReplicatedChange {
    let path: Vec<PathSegment> = event.path().into_iter().collect();
    match (event, path.as_slice()) {
        (Event::Array(e), []) => {
            let delta = e
                .delta(txn)
                .iter()
                .map(|change| match change {
                    Change::Retain(n) => BlockDelta::Retain(*n as usize),
                    Change::Removed(n) => BlockDelta::Remove(*n as usize),
                    Change::Added(values) => BlockDelta::Insert(
                        values
                            .iter()
                            .map(|v| match v {
                                Out::YMap(map) => read_block(txn, map),
                                other => {
                                    log::warn!("non-map block inserted: {other:?}");
                                    BlockSpec::new(BlockKind::Paragraph, Vec::new())
                                }
                            })
                            .collect(),
                    ),
                })
                .collect();
            ReplicatedChange::Blocks(delta)
        }
        (Event::Map(e), [PathSegment::Index(index)]) => {
            let index = *index as usize;
            let keys = e.keys(txn);
            if keys.contains_key(TEXT) {
                return ReplicatedChange::Reset {
                    index,
                    block: read_block(txn, e.target()),
                };
            }
            match keys.get(KIND) {
                Some(EntryChange::Inserted(v)) | Some(EntryChange::Updated(_, v)) => {
                    ReplicatedChange::Kind {
                        index,
                        kind: parse_kind(Some(v.clone())),
                    }
                }
                Some(EntryChange::Removed(_)) => ReplicatedChange::Kind {
                    index,
                    kind: BlockKind::Paragraph,
                },
                None => ReplicatedChange::Unrecognized(format!(
                    "map change on keys {:?}",
                    keys.keys().collect::<Vec<_>>()
                )),
            }
        }
        (Event::Text(e), [PathSegment::Index(index), PathSegment::Key(key)]) if key.as_ref() == TEXT => {
            let delta = e
                .delta(txn)
                .iter()
                .filter_map(|d| match d {
                    Delta::Retain(len, attrs) => {
                        let (set, clear) = attrs_to_patch(attrs.as_deref());
                        Some(TextDelta::Retain {
                            len: *len as usize,
                            set,
                            clear,
                        })
                    }
                    Delta::Deleted(len) => Some(TextDelta::Delete(*len as usize)),
                    Delta::Inserted(value, attrs) => match out_string(value) {
                        Some(text) => Some(TextDelta::Insert {
                            text,
                            format: attrs_to_format(attrs.as_deref()),
                        }),
                        None => {
                            log::warn!("ignoring embedded value in block text: {value:?}");
                            None
                        }
                    },
                })
                .collect();
            ReplicatedChange::Text {
                index: *index as usize,
                delta,
            }
        }
        (_, path) => ReplicatedChange::Unrecognized(format!("event at path {path:?}")),
    }
}

// ─── Replica ────────────────────────────────────────────────────────

/// One replica of a story's shared document.
///
/// A deep observer on the block array records every committed transaction
/// that did not originate locally; [`Replica::apply_update`] hands those
/// records back to the caller.
pub struct Replica {
    doc: Doc,
    blocks: ArrayRef,
    pending: Arc<Mutex<Vec<ReplicatedChange>>>,
    _subscription: Subscription,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let blocks = doc.get_or_insert_array(BLOCKS);
        let pending: Arc<Mutex<Vec<ReplicatedChange>>> = Arc::default();

        let sink = pending.clone();
        let local = origin_token(ChangeOrigin::Local);
        let subscription = blocks.observe_deep(move |txn: &TransactionMut, events: &Events| {
            if txn.origin() == Some(&local) {
                return;
            }
            let mut changes: Vec<ReplicatedChange> =
                events.iter().map(|event| convert_event(txn, event)).collect();
            changes.sort_by_key(ReplicatedChange::rank);
            sink.lock().extend(changes);
        });

        Self {
            doc,
            blocks,
            pending,
            _subscription: subscription,
        }
    }

    /// Decode and integrate an encoded update.
    ///
    /// A payload that fails to decode is rejected before any transaction is
    /// opened, leaving the replica untouched. Re-applying an update that is
    /// already integrated yields no changes.
    pub fn apply_update(
        &self,
        bytes: &[u8],
        origin: ChangeOrigin,
    ) -> Result<Vec<ReplicatedChange>, CollabError> {
        let update = Update::decode_v1(bytes).map_err(|e| CollabError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut_with(origin_token(origin));
            txn.apply_update(update)
                .map_err(|e| CollabError::Apply(format!("{e:?}")))?;
        }
        Ok(std::mem::take(&mut *self.pending.lock()))
    }

    /// Run a local mutation and return the encoded update it produced.
    pub fn transact_local<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut, &ArrayRef),
    {
        let mut txn = self.doc.transact_mut_with(origin_token(ChangeOrigin::Local));
        f(&mut txn, &self.blocks);
        txn.encode_update_v1()
    }

    /// Full state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| CollabError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    pub fn read_blocks(&self) -> Vec<BlockSpec> {
        let txn = self.doc.transact();
        self.blocks
            .iter(&txn)
            .map(|value| match value {
                Out::YMap(map) => read_block(&txn, &map),
                _ => BlockSpec::new(BlockKind::Paragraph, Vec::new()),
            })
            .collect()
    }

    pub fn block_count(&self) -> usize {
        let txn = self.doc.transact();
        self.blocks.len(&txn) as usize
    }

    /// Attribute keys carried by the text of block `index` (test helper for
    /// format mapping).
    pub fn block_attribute_names(&self, index: usize) -> HashMap<String, bool> {
        let txn = self.doc.transact();
        let mut names = HashMap::new();
        if let Some(Out::YMap(map)) = self.blocks.get(&txn, index as u32) {
            if let Some(Out::YText(text)) = map.get(&txn, TEXT) {
                for diff in text.diff(&txn, YChange::identity) {
                    for (name, value) in diff.attributes.iter().flat_map(|a| a.iter()) {
                        names.insert(name.to_string(), *value == Any::Bool(true));
                    }
                }
            }
        }
        names
    }
}

/// Insert a new block map at `index` with the given content.
pub(crate) fn insert_block(txn: &mut TransactionMut, blocks: &ArrayRef, index: u32, spec: &BlockSpec) {
    let map: MapRef = blocks.insert(txn, index, MapPrelim::default());
    map.insert(txn, KIND, spec.kind.as_str().to_string());
    let text: TextRef = map.insert(txn, TEXT, TextPrelim::new(""));
    let mut offset = 0u32;
    for run in &spec.runs {
        text.insert_with_attributes(txn, offset, &run.text, format_attrs(run.format));
        offset += utf16_len(&run.text) as u32;
    }
}

pub(crate) fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}
