//! Two-way translation between the document tree and the replica.
//!
//! Local tree updates become CRDT operations in one `Local` transaction;
//! remote replica changes are replayed into the tree as one `Remote` update.
//! Each direction ignores what the other one produced, so nothing echoes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use yrs::{Array, ArrayRef, Map, Out, Text, TextRef, TransactionMut};

use super::replica::{
    format_attrs, insert_block, utf16_len, BlockDelta, Replica, ReplicatedChange, TextDelta, KIND,
    TEXT,
};
use super::CollabError;
use crate::tree::{
    runs_from_chars, styled_chars, BlockSpec, ChangeOrigin, DocumentTree, Format, NodeKey,
    StyledChar, TreeEdit, TreeError, TreeSnapshot, TreeUpdate,
};

// ─── Tree → replica ─────────────────────────────────────────────────

/// Emit the CRDT operations that turn `update.prev` into `update.next`.
///
/// Assumes the replica's block array currently mirrors `update.prev`.
/// Blocks whose relative order changed are removed and reinserted; dirty
/// blocks that stayed in place get a kind update and a minimal text splice.
pub fn tree_change_to_operations(txn: &mut TransactionMut, blocks: &ArrayRef, update: &TreeUpdate) {
    let prev = &update.prev;
    let next = &update.next;

    let next_pos: HashMap<NodeKey, usize> = next
        .blocks()
        .iter()
        .enumerate()
        .map(|(i, k)| (*k, i))
        .collect();
    let stay = stable_blocks(prev.blocks(), &next_pos);

    for (index, key) in prev.blocks().iter().enumerate().rev() {
        if !stay.contains(key) {
            blocks.remove_range(txn, index as u32, 1);
        }
    }

    for (index, key) in next.blocks().iter().enumerate() {
        if !stay.contains(key) {
            if let Some(spec) = next.block_spec(*key) {
                insert_block(txn, blocks, index as u32, &spec);
            }
        } else if update.dirty.contains(key) {
            sync_block(txn, blocks, index, prev, next, *key);
        }
    }
}

/// Largest set of surviving blocks whose relative order is unchanged.
fn stable_blocks(prev: &[NodeKey], next_pos: &HashMap<NodeKey, usize>) -> HashSet<NodeKey> {
    let common: Vec<(NodeKey, usize)> = prev
        .iter()
        .filter_map(|k| next_pos.get(k).map(|p| (*k, *p)))
        .collect();

    if common.windows(2).all(|w| w[0].1 < w[1].1) {
        return common.into_iter().map(|(k, _)| k).collect();
    }

    let n = common.len();
    let mut length = vec![1usize; n];
    let mut back: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        for j in 0..i {
            if common[j].1 < common[i].1 && length[j] + 1 > length[i] {
                length[i] = length[j] + 1;
                back[i] = Some(j);
            }
        }
    }

    let mut stay = HashSet::new();
    let mut cursor = (0..n).max_by_key(|i| length[*i]);
    while let Some(i) = cursor {
        stay.insert(common[i].0);
        cursor = back[i];
    }
    stay
}

fn sync_block(
    txn: &mut TransactionMut,
    blocks: &ArrayRef,
    index: usize,
    prev: &TreeSnapshot,
    next: &TreeSnapshot,
    key: NodeKey,
) {
    let Some(Out::YMap(map)) = blocks.get(&*txn, index as u32) else {
        log::warn!("replica has no block at index {index}; skipping {key}");
        return;
    };

    if let Some(kind) = next.block_kind(key) {
        if prev.block_kind(key) != Some(kind) {
            map.insert(txn, KIND, kind.as_str().to_string());
        }
    }

    let Some(Out::YText(text)) = map.get(&*txn, TEXT) else {
        log::warn!("block {key} at index {index} has no text");
        return;
    };
    let old = chars_of(prev, key);
    let new = chars_of(next, key);
    if old != new {
        splice_text(txn, &text, &old, &new);
    }
}

fn chars_of(tree: &TreeSnapshot, key: NodeKey) -> Vec<StyledChar> {
    tree.block_spec(key)
        .map(|spec| styled_chars(&spec.runs))
        .unwrap_or_default()
}

fn units(chars: &[StyledChar]) -> u32 {
    chars.iter().map(|c| c.ch.len_utf16() as u32).sum()
}

fn splice_text(txn: &mut TransactionMut, text: &TextRef, old: &[StyledChar], new: &[StyledChar]) {
    let prefix = old
        .iter()
        .zip(new)
        .take_while(|(a, b)| a.ch == b.ch)
        .count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a.ch == b.ch)
        .count();

    let start = units(&old[..prefix]);
    let removed = &old[prefix..old.len() - suffix];
    if !removed.is_empty() {
        text.remove_range(txn, start, units(removed));
    }

    let mut offset = start;
    for run in runs_from_chars(&new[prefix..new.len() - suffix]) {
        text.insert_with_attributes(txn, offset, &run.text, format_attrs(run.format));
        offset += utf16_len(&run.text) as u32;
    }

    // Format changes on characters kept on either side of the splice, in
    // positions of the new text.
    let mut changed: Vec<(usize, Format)> = Vec::new();
    for i in 0..prefix {
        if old[i].format != new[i].format {
            changed.push((i, new[i].format));
        }
    }
    for j in 0..suffix {
        let (oi, ni) = (old.len() - suffix + j, new.len() - suffix + j);
        if old[oi].format != new[ni].format {
            changed.push((ni, new[ni].format));
        }
    }

    let mut i = 0;
    while i < changed.len() {
        let (first, format) = changed[i];
        let mut last = first;
        while i + 1 < changed.len() && changed[i + 1].0 == last + 1 && changed[i + 1].1 == format {
            i += 1;
            last = changed[i].0;
        }
        let at = units(&new[..first]);
        let len = units(&new[first..=last]);
        text.format(txn, at, len, format_attrs(format));
        i += 1;
    }
}

// ─── Replica → tree ─────────────────────────────────────────────────

fn block_at(edit: &TreeEdit, index: usize) -> Result<NodeKey, TreeError> {
    let blocks = edit.state().blocks();
    blocks
        .get(index)
        .copied()
        .ok_or(TreeError::IndexOutOfRange {
            index,
            len: blocks.len(),
        })
}

/// Consume `len` UTF-16 units of `chars` starting at `*pos`.
fn take_units<'a>(chars: &'a [StyledChar], pos: &mut usize, len: usize) -> Result<&'a [StyledChar], TreeError> {
    let start = *pos;
    let mut consumed = 0;
    while consumed < len {
        let c = chars.get(*pos).ok_or_else(|| {
            TreeError::Inconsistent(format!("text delta runs past end ({len} units at {start})"))
        })?;
        consumed += c.ch.len_utf16();
        *pos += 1;
    }
    if consumed != len {
        return Err(TreeError::Inconsistent("text delta splits a character".into()));
    }
    Ok(&chars[start..*pos])
}

fn apply_text_delta(chars: &[StyledChar], delta: &[TextDelta]) -> Result<Vec<StyledChar>, TreeError> {
    let mut out = Vec::with_capacity(chars.len());
    let mut pos = 0;
    for d in delta {
        match d {
            TextDelta::Retain { len, set, clear } => {
                for c in take_units(chars, &mut pos, *len)? {
                    out.push(StyledChar {
                        ch: c.ch,
                        format: (c.format - *clear) | *set,
                    });
                }
            }
            TextDelta::Delete(len) => {
                take_units(chars, &mut pos, *len)?;
            }
            TextDelta::Insert { text, format } => {
                out.extend(text.chars().map(|ch| StyledChar { ch, format: *format }));
            }
        }
    }
    out.extend_from_slice(&chars[pos..]);
    Ok(out)
}

fn replay(edit: &mut TreeEdit, change: &ReplicatedChange) -> Result<(), TreeError> {
    match change {
        ReplicatedChange::Blocks(delta) => {
            let mut index = 0;
            for d in delta {
                match d {
                    BlockDelta::Retain(n) => index += n,
                    BlockDelta::Remove(n) => {
                        for _ in 0..*n {
                            let key = block_at(edit, index)?;
                            edit.remove_block(key)?;
                        }
                    }
                    BlockDelta::Insert(specs) => {
                        for spec in specs {
                            edit.insert_block(index, spec.clone())?;
                            index += 1;
                        }
                    }
                }
            }
            Ok(())
        }
        ReplicatedChange::Kind { index, kind } => {
            let key = block_at(edit, *index)?;
            edit.set_block_kind(key, *kind)
        }
        ReplicatedChange::Reset { index, block } => {
            let key = block_at(edit, *index)?;
            edit.set_block_kind(key, block.kind)?;
            edit.replace_runs(key, block.runs.clone())
        }
        ReplicatedChange::Text { index, delta } => {
            let key = block_at(edit, *index)?;
            let chars = edit
                .state()
                .block_spec(key)
                .map(|spec| styled_chars(&spec.runs))
                .unwrap_or_default();
            let next = apply_text_delta(&chars, delta)?;
            edit.replace_runs(key, runs_from_chars(&next))
        }
        ReplicatedChange::Unrecognized(what) => Err(TreeError::Inconsistent(what.clone())),
    }
}

// ─── Bridge ─────────────────────────────────────────────────────────

/// A replica paired with the tree it mirrors.
pub struct Bridge {
    replica: Replica,
    tree: DocumentTree,
    emitted: u64,
    rebuilds: u64,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            replica: Replica::new(),
            tree: DocumentTree::new(),
            emitted: 0,
            rebuilds: 0,
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn tree(&self) -> &DocumentTree {
        &self.tree
    }

    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.tree.snapshot()
    }

    pub fn revision(&self) -> u64 {
        self.tree.revision()
    }

    /// Number of updates this bridge has written into the replica.
    pub fn emitted_updates(&self) -> u64 {
        self.emitted
    }

    /// Number of times the tree had to be rebuilt from the replica.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Fill an empty document with `blocks`; returns the encoded update.
    pub fn seed(&mut self, blocks: &[BlockSpec]) -> Result<Option<Vec<u8>>, CollabError> {
        self.apply_local(|edit| {
            for spec in blocks {
                edit.append_block(spec.clone());
            }
            Ok(())
        })
    }

    /// Run a local edit and translate it; `None` when nothing changed.
    pub fn apply_local<F>(&mut self, f: F) -> Result<Option<Vec<u8>>, CollabError>
    where
        F: FnOnce(&mut TreeEdit) -> Result<(), TreeError>,
    {
        let update = self.tree.update(ChangeOrigin::Local, f)?;
        Ok(self.on_tree_update(&update))
    }

    /// Tree listener: translates local updates, skips remote ones.
    pub fn on_tree_update(&mut self, update: &TreeUpdate) -> Option<Vec<u8>> {
        match update.origin {
            ChangeOrigin::Remote => None,
            ChangeOrigin::Local if update.is_empty() => None,
            ChangeOrigin::Local => {
                let encoded = self
                    .replica
                    .transact_local(|txn, blocks| tree_change_to_operations(txn, blocks, update));
                self.emitted += 1;
                Some(encoded)
            }
        }
    }

    /// Integrate a remote update and replay it into the tree.
    ///
    /// Returns `None` when the update changed nothing (e.g. a re-delivery).
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<Option<TreeUpdate>, CollabError> {
        let changes = self.replica.apply_update(bytes, ChangeOrigin::Remote)?;
        Ok(self.remote_operations_to_tree_mutation(&changes))
    }

    /// Replay replica changes as a single `Remote` tree update.
    ///
    /// If the changes do not line up with the tree, or the replayed tree no
    /// longer matches the replica (content the tree cannot hold, such as
    /// embeds, shifts later offsets), the tree is rebuilt from the replica.
    pub fn remote_operations_to_tree_mutation(
        &mut self,
        changes: &[ReplicatedChange],
    ) -> Option<TreeUpdate> {
        if changes.is_empty() {
            return None;
        }
        let replayed = self.tree.update(ChangeOrigin::Remote, |edit| {
            changes.iter().try_for_each(|change| replay(edit, change))
        });
        let update = match replayed {
            Ok(update) if self.is_consistent() => update,
            Ok(_) => {
                log::warn!("tree diverged from replica after replay; rebuilding");
                self.rebuild()?
            }
            Err(e) => {
                log::warn!("remote change replay failed ({e}); rebuilding tree from replica");
                self.rebuild()?
            }
        };
        // Listener dispatch: remote updates are never translated back.
        let echoed = self.on_tree_update(&update);
        debug_assert!(echoed.is_none());
        Some(update)
    }

    fn rebuild(&mut self) -> Option<TreeUpdate> {
        self.rebuilds += 1;
        let blocks = self.replica.read_blocks();
        let rebuilt = self.tree.update(ChangeOrigin::Remote, |edit| {
            edit.clear();
            for spec in blocks {
                edit.append_block(spec);
            }
            Ok(())
        });
        match rebuilt {
            Ok(update) => Some(update),
            Err(e) => {
                log::error!("tree rebuild failed: {e}");
                None
            }
        }
    }

    /// Full replica state, for a joining peer.
    pub fn encode_state(&self) -> Vec<u8> {
        self.replica.encode_state_as_update()
    }

    /// True when the tree holds exactly what the replica holds.
    pub fn is_consistent(&self) -> bool {
        self.tree.snapshot().to_specs() == self.replica.read_blocks()
    }
}
