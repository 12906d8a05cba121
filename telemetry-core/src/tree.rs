//! Tree-structured rich-text model for a story.
//!
//! ```text
//! Root
//!  ├── Title      ── TextRun*
//!  ├── Subtitle   ── TextRun*
//!  ├── Paragraph  ── TextRun*
//!  └── Quote      ── TextRun*
//! ```
//!
//! The tree is an arena of [`Node`]s keyed by [`NodeKey`]. A committed state
//! is an immutable [`TreeSnapshot`]; every mutation runs inside
//! [`DocumentTree::update`], which applies a batch of [`TreeEdit`] operations
//! to a working copy and publishes it as one [`TreeUpdate`] carrying both
//! snapshots, the dirty keys and the [`ChangeOrigin`].
//!
//! Text offsets in this module count Unicode scalar values (`char`s).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

// ─── Keys, kinds, formats ───────────────────────────────────────────

/// Stable identity of a node within one [`DocumentTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(u64);

impl NodeKey {
    pub const ROOT: NodeKey = NodeKey(0);

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Inline formatting carried by a text run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Format: u8 {
        const BOLD = 1;
        const ITALIC = 1 << 1;
        const UNDERLINE = 1 << 2;
        const STRIKETHROUGH = 1 << 3;
        const SUPERSCRIPT = 1 << 4;
        const CODE = 1 << 5;
    }
}

impl Format {
    /// Attribute name of every flag, in a fixed order.
    pub const NAMED: [(&'static str, Format); 6] = [
        ("bold", Format::BOLD),
        ("italic", Format::ITALIC),
        ("underline", Format::UNDERLINE),
        ("strikethrough", Format::STRIKETHROUGH),
        ("superscript", Format::SUPERSCRIPT),
        ("code", Format::CODE),
    ];

    /// Look up a single flag by its attribute name.
    pub fn from_attr_name(name: &str) -> Option<Format> {
        Self::NAMED
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
    }
}

/// Block-level node kinds (children of the root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Title,
    Subtitle,
    Paragraph,
    Quote,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Title => "title",
            BlockKind::Subtitle => "subtitle",
            BlockKind::Paragraph => "paragraph",
            BlockKind::Quote => "quote",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockKind {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "title" => Ok(BlockKind::Title),
            "subtitle" => Ok(BlockKind::Subtitle),
            "paragraph" => Ok(BlockKind::Paragraph),
            "quote" => Ok(BlockKind::Quote),
            other => Err(TreeError::UnknownKind(other.to_string())),
        }
    }
}

/// Who produced a tree or replica change.
///
/// Only `Local` changes are translated into replicated operations; `Remote`
/// changes are the result of replaying them and must never be re-emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TreeError {
    #[error("node {0} not found")]
    NodeNotFound(NodeKey),
    #[error("node {0} is not a block")]
    NotABlock(NodeKey),
    #[error("offset {offset} out of range for block {key} (length {len})")]
    OffsetOutOfRange { key: NodeKey, offset: usize, len: usize },
    #[error("block index {index} out of range ({len} blocks)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("unknown block kind `{0}`")]
    UnknownKind(String),
    #[error("change does not match tree: {0}")]
    Inconsistent(String),
}

// ─── Nodes ──────────────────────────────────────────────────────────

/// Children list shared by the root and every block node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub parent: Option<NodeKey>,
    pub children: Vec<NodeKey>,
}

/// A leaf with uniformly formatted text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub parent: NodeKey,
    pub text: String,
    pub format: Format,
}

/// Closed set of node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Root(Element),
    Title(Element),
    Subtitle(Element),
    Paragraph(Element),
    Quote(Element),
    TextRun(TextRun),
}

impl Node {
    pub fn block(kind: BlockKind, element: Element) -> Node {
        match kind {
            BlockKind::Title => Node::Title(element),
            BlockKind::Subtitle => Node::Subtitle(element),
            BlockKind::Paragraph => Node::Paragraph(element),
            BlockKind::Quote => Node::Quote(element),
        }
    }

    pub fn block_kind(&self) -> Option<BlockKind> {
        match self {
            Node::Title(_) => Some(BlockKind::Title),
            Node::Subtitle(_) => Some(BlockKind::Subtitle),
            Node::Paragraph(_) => Some(BlockKind::Paragraph),
            Node::Quote(_) => Some(BlockKind::Quote),
            Node::Root(_) | Node::TextRun(_) => None,
        }
    }

    pub fn element(&self) -> Option<&Element> {
        match self {
            Node::Root(e) | Node::Title(e) | Node::Subtitle(e) | Node::Paragraph(e) | Node::Quote(e) => Some(e),
            Node::TextRun(_) => None,
        }
    }

    fn element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Root(e) | Node::Title(e) | Node::Subtitle(e) | Node::Paragraph(e) | Node::Quote(e) => Some(e),
            Node::TextRun(_) => None,
        }
    }

    pub fn parent(&self) -> Option<NodeKey> {
        match self {
            Node::TextRun(run) => Some(run.parent),
            other => other.element().and_then(|e| e.parent),
        }
    }
}

// ─── Value-level block description ──────────────────────────────────

/// A run of text detached from any tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub text: String,
    pub format: Format,
}

impl RunSpec {
    pub fn new(text: impl Into<String>, format: Format) -> Self {
        Self { text: text.into(), format }
    }
}

/// A block detached from any tree: used by markup import, replica reads and
/// tree construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    pub kind: BlockKind,
    pub runs: Vec<RunSpec>,
}

impl BlockSpec {
    pub fn new(kind: BlockKind, runs: Vec<RunSpec>) -> Self {
        Self { kind, runs: normalize_runs(runs) }
    }

    /// Single unformatted run (or none, for empty text).
    pub fn plain(kind: BlockKind, text: impl Into<String>) -> Self {
        Self::new(kind, vec![RunSpec::new(text, Format::empty())])
    }

    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

/// One character together with its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyledChar {
    pub ch: char,
    pub format: Format,
}

/// Explode runs into per-character form.
pub fn styled_chars(runs: &[RunSpec]) -> Vec<StyledChar> {
    runs.iter()
        .flat_map(|r| r.text.chars().map(move |ch| StyledChar { ch, format: r.format }))
        .collect()
}

/// Regroup characters into maximal equal-format runs.
pub fn runs_from_chars(chars: &[StyledChar]) -> Vec<RunSpec> {
    let mut runs: Vec<RunSpec> = Vec::new();
    for c in chars {
        match runs.last_mut() {
            Some(last) if last.format == c.format => last.text.push(c.ch),
            _ => runs.push(RunSpec::new(c.ch.to_string(), c.format)),
        }
    }
    runs
}

/// Drop empty runs and merge neighbours with equal format.
pub fn normalize_runs(runs: Vec<RunSpec>) -> Vec<RunSpec> {
    let mut out: Vec<RunSpec> = Vec::with_capacity(runs.len());
    for run in runs.into_iter().filter(|r| !r.text.is_empty()) {
        match out.last_mut() {
            Some(last) if last.format == run.format => last.text.push_str(&run.text),
            _ => out.push(run),
        }
    }
    out
}

// ─── Snapshot ───────────────────────────────────────────────────────

/// Immutable committed tree state.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    nodes: HashMap<NodeKey, Node>,
    next_key: u64,
}

impl Default for TreeSnapshot {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeKey::ROOT, Node::Root(Element::default()));
        Self { nodes, next_key: 1 }
    }
}

impl TreeSnapshot {
    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(&key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Block keys in document order.
    pub fn blocks(&self) -> &[NodeKey] {
        match self.nodes.get(&NodeKey::ROOT).and_then(Node::element) {
            Some(root) => &root.children,
            None => &[],
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks().is_empty()
    }

    pub fn index_of(&self, key: NodeKey) -> Option<usize> {
        self.blocks().iter().position(|k| *k == key)
    }

    pub fn block_kind(&self, key: NodeKey) -> Option<BlockKind> {
        self.nodes.get(&key).and_then(Node::block_kind)
    }

    /// Text runs of a block, in order.
    pub fn block_runs(&self, key: NodeKey) -> Vec<&TextRun> {
        let Some(element) = self.nodes.get(&key).and_then(Node::element) else {
            return Vec::new();
        };
        element
            .children
            .iter()
            .filter_map(|k| match self.nodes.get(k) {
                Some(Node::TextRun(run)) => Some(run),
                _ => None,
            })
            .collect()
    }

    pub fn block_text(&self, key: NodeKey) -> String {
        self.block_runs(key).iter().map(|r| r.text.as_str()).collect()
    }

    pub fn block_spec(&self, key: NodeKey) -> Option<BlockSpec> {
        let kind = self.block_kind(key)?;
        let runs = self
            .block_runs(key)
            .into_iter()
            .map(|r| RunSpec::new(r.text.clone(), r.format))
            .collect();
        Some(BlockSpec { kind, runs })
    }

    pub fn to_specs(&self) -> Vec<BlockSpec> {
        self.blocks().iter().filter_map(|k| self.block_spec(*k)).collect()
    }

    /// First block of the given kind in document order.
    pub fn first_block_of(&self, kind: BlockKind) -> Option<NodeKey> {
        self.blocks()
            .iter()
            .copied()
            .find(|k| self.block_kind(*k) == Some(kind))
    }

    /// Plain text of the whole document, blocks separated by a blank line.
    pub fn text_content(&self) -> String {
        self.blocks()
            .iter()
            .map(|k| self.block_text(*k))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn block_chars(&self, key: NodeKey) -> Result<Vec<StyledChar>, TreeError> {
        let node = self.nodes.get(&key).ok_or(TreeError::NodeNotFound(key))?;
        if node.block_kind().is_none() {
            return Err(TreeError::NotABlock(key));
        }
        Ok(self
            .block_runs(key)
            .iter()
            .flat_map(|r| r.text.chars().map(|ch| StyledChar { ch, format: r.format }))
            .collect())
    }

    fn alloc_key(&mut self) -> NodeKey {
        let key = NodeKey(self.next_key);
        self.next_key += 1;
        key
    }

    fn root_children_mut(&mut self) -> &mut Vec<NodeKey> {
        let root = self
            .nodes
            .entry(NodeKey::ROOT)
            .or_insert_with(|| Node::Root(Element::default()));
        match root.element_mut() {
            Some(element) => &mut element.children,
            None => unreachable!("root is always an element"),
        }
    }
}

// ─── Updates ────────────────────────────────────────────────────────

/// One committed tree transaction.
#[derive(Debug, Clone)]
pub struct TreeUpdate {
    pub origin: ChangeOrigin,
    pub revision: u64,
    pub prev: Arc<TreeSnapshot>,
    pub next: Arc<TreeSnapshot>,
    /// Blocks and runs created, removed, moved or rewritten.
    pub dirty: HashSet<NodeKey>,
}

impl TreeUpdate {
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }
}

/// Owner of the current tree state.
#[derive(Debug)]
pub struct DocumentTree {
    current: Arc<TreeSnapshot>,
    revision: u64,
}

impl Default for DocumentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentTree {
    pub fn new() -> Self {
        Self {
            current: Arc::new(TreeSnapshot::default()),
            revision: 0,
        }
    }

    /// Build a tree directly from block specs (revision stays 0).
    pub fn from_specs(specs: &[BlockSpec]) -> Self {
        let mut edit = TreeEdit::new(TreeSnapshot::default());
        for spec in specs {
            edit.attach_block(edit.state.block_count(), spec.clone());
        }
        Self {
            current: Arc::new(edit.state),
            revision: 0,
        }
    }

    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.current.clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Run a batch of edits as one atomic update.
    ///
    /// If `f` fails, nothing is committed. A batch that changes nothing is
    /// returned with an empty dirty set and does not bump the revision.
    pub fn update<F>(&mut self, origin: ChangeOrigin, f: F) -> Result<TreeUpdate, TreeError>
    where
        F: FnOnce(&mut TreeEdit) -> Result<(), TreeError>,
    {
        let mut edit = TreeEdit::new((*self.current).clone());
        f(&mut edit)?;

        let TreeEdit { state, dirty } = edit;
        if dirty.is_empty() {
            return Ok(TreeUpdate {
                origin,
                revision: self.revision,
                prev: self.current.clone(),
                next: self.current.clone(),
                dirty,
            });
        }

        let next = Arc::new(state);
        let prev = std::mem::replace(&mut self.current, next.clone());
        self.revision += 1;
        Ok(TreeUpdate {
            origin,
            revision: self.revision,
            prev,
            next,
            dirty,
        })
    }
}

// ─── Edit primitives ────────────────────────────────────────────────

/// Working copy handed to [`DocumentTree::update`] closures.
pub struct TreeEdit {
    state: TreeSnapshot,
    dirty: HashSet<NodeKey>,
}

impl TreeEdit {
    fn new(state: TreeSnapshot) -> Self {
        Self {
            state,
            dirty: HashSet::new(),
        }
    }

    /// The working state, including edits made so far in this batch.
    pub fn state(&self) -> &TreeSnapshot {
        &self.state
    }

    pub fn insert_block(&mut self, index: usize, spec: BlockSpec) -> Result<NodeKey, TreeError> {
        let len = self.state.block_count();
        if index > len {
            return Err(TreeError::IndexOutOfRange { index, len });
        }
        Ok(self.attach_block(index, spec))
    }

    pub fn append_block(&mut self, spec: BlockSpec) -> NodeKey {
        let index = self.state.block_count();
        self.attach_block(index, spec)
    }

    fn attach_block(&mut self, index: usize, spec: BlockSpec) -> NodeKey {
        let key = self.state.alloc_key();
        let element = Element {
            parent: Some(NodeKey::ROOT),
            children: Vec::new(),
        };
        self.state.nodes.insert(key, Node::block(spec.kind, element));
        self.state.root_children_mut().insert(index, key);
        self.dirty.insert(key);
        self.write_runs(key, normalize_runs(spec.runs));
        key
    }

    /// Detach a block and its runs; returns what was removed.
    pub fn remove_block(&mut self, key: NodeKey) -> Result<BlockSpec, TreeError> {
        let spec = self
            .state
            .block_spec(key)
            .ok_or_else(|| self.missing_block(key))?;
        let runs = self
            .state
            .nodes
            .get(&key)
            .and_then(Node::element)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        for run in runs {
            self.state.nodes.remove(&run);
            self.dirty.insert(run);
        }
        self.state.nodes.remove(&key);
        self.state.root_children_mut().retain(|k| *k != key);
        self.dirty.insert(key);
        Ok(spec)
    }

    /// Move a block so that it ends up at `to` in the resulting order.
    pub fn move_block(&mut self, key: NodeKey, to: usize) -> Result<(), TreeError> {
        let from = self
            .state
            .index_of(key)
            .ok_or_else(|| self.missing_block(key))?;
        let len = self.state.block_count();
        if to >= len {
            return Err(TreeError::IndexOutOfRange { index: to, len });
        }
        if from == to {
            return Ok(());
        }
        let children = self.state.root_children_mut();
        children.remove(from);
        children.insert(to, key);
        self.dirty.insert(key);
        Ok(())
    }

    pub fn set_block_kind(&mut self, key: NodeKey, kind: BlockKind) -> Result<(), TreeError> {
        let current = self
            .state
            .block_kind(key)
            .ok_or_else(|| self.missing_block(key))?;
        if current == kind {
            return Ok(());
        }
        if let Some(node) = self.state.nodes.remove(&key) {
            let element = node.element().cloned().unwrap_or_default();
            self.state.nodes.insert(key, Node::block(kind, element));
        }
        self.dirty.insert(key);
        Ok(())
    }

    /// Insert text inheriting the format at the insertion point.
    pub fn insert_text(&mut self, key: NodeKey, offset: usize, text: &str) -> Result<(), TreeError> {
        let chars = self.state.block_chars(key)?;
        check_offset(key, offset, chars.len())?;
        let format = match offset {
            0 => chars.first().map(|c| c.format).unwrap_or_default(),
            n => chars[n - 1].format,
        };
        self.insert_formatted(key, offset, text, format)
    }

    pub fn insert_formatted(
        &mut self,
        key: NodeKey,
        offset: usize,
        text: &str,
        format: Format,
    ) -> Result<(), TreeError> {
        let mut chars = self.state.block_chars(key)?;
        check_offset(key, offset, chars.len())?;
        if text.is_empty() {
            return Ok(());
        }
        let inserted = text.chars().map(|ch| StyledChar { ch, format });
        chars.splice(offset..offset, inserted);
        self.write_chars(key, &chars);
        Ok(())
    }

    pub fn delete_text(&mut self, key: NodeKey, offset: usize, len: usize) -> Result<(), TreeError> {
        let mut chars = self.state.block_chars(key)?;
        check_range(key, offset, len, chars.len())?;
        if len == 0 {
            return Ok(());
        }
        chars.drain(offset..offset + len);
        self.write_chars(key, &chars);
        Ok(())
    }

    /// Toggle `flags` on or off over a character range.
    pub fn format_text(
        &mut self,
        key: NodeKey,
        offset: usize,
        len: usize,
        flags: Format,
        enabled: bool,
    ) -> Result<(), TreeError> {
        if enabled {
            self.patch_format(key, offset, len, flags, Format::empty())
        } else {
            self.patch_format(key, offset, len, Format::empty(), flags)
        }
    }

    /// Set and clear flags over a character range in one step.
    pub fn patch_format(
        &mut self,
        key: NodeKey,
        offset: usize,
        len: usize,
        set: Format,
        clear: Format,
    ) -> Result<(), TreeError> {
        let mut chars = self.state.block_chars(key)?;
        check_range(key, offset, len, chars.len())?;
        for c in &mut chars[offset..offset + len] {
            c.format = (c.format - clear) | set;
        }
        self.write_chars(key, &chars);
        Ok(())
    }

    /// Replace a block's content with unformatted text.
    pub fn replace_text(&mut self, key: NodeKey, text: &str) -> Result<(), TreeError> {
        self.replace_runs(key, vec![RunSpec::new(text, Format::empty())])
    }

    pub fn replace_runs(&mut self, key: NodeKey, runs: Vec<RunSpec>) -> Result<(), TreeError> {
        let current = self.state.block_chars(key)?;
        let next = styled_chars(&runs);
        if current != next {
            self.write_runs(key, normalize_runs(runs));
        }
        Ok(())
    }

    /// Split a block at `offset`; the tail becomes a new paragraph after it.
    pub fn split_block(&mut self, key: NodeKey, offset: usize) -> Result<NodeKey, TreeError> {
        let chars = self.state.block_chars(key)?;
        check_offset(key, offset, chars.len())?;
        let index = self
            .state
            .index_of(key)
            .ok_or_else(|| self.missing_block(key))?;
        let (head, tail) = chars.split_at(offset);
        let tail = runs_from_chars(tail);
        self.write_chars(key, head);
        Ok(self.attach_block(index + 1, BlockSpec::new(BlockKind::Paragraph, tail)))
    }

    /// Append a block's text to the previous block and remove it.
    ///
    /// Returns the surviving block, or `None` when `key` is the first block.
    pub fn merge_with_previous(&mut self, key: NodeKey) -> Result<Option<NodeKey>, TreeError> {
        let index = self
            .state
            .index_of(key)
            .ok_or_else(|| self.missing_block(key))?;
        if index == 0 {
            return Ok(None);
        }
        let prev = self.state.blocks()[index - 1];
        let mut chars = self.state.block_chars(prev)?;
        chars.extend(self.state.block_chars(key)?);
        self.remove_block(key)?;
        self.write_chars(prev, &chars);
        Ok(Some(prev))
    }

    /// Remove every block.
    pub fn clear(&mut self) {
        let blocks = self.state.blocks().to_vec();
        for key in blocks {
            // Keys come from the live block list.
            let _ = self.remove_block(key);
        }
    }

    fn missing_block(&self, key: NodeKey) -> TreeError {
        match self.state.nodes.get(&key) {
            Some(_) => TreeError::NotABlock(key),
            None => TreeError::NodeNotFound(key),
        }
    }

    fn write_chars(&mut self, key: NodeKey, chars: &[StyledChar]) {
        let runs = runs_from_chars(chars);
        let unchanged = self
            .state
            .block_chars(key)
            .map(|current| current == chars)
            .unwrap_or(false);
        if !unchanged {
            self.write_runs(key, runs);
        }
    }

    /// Rebuild the run children of a block from normalized runs.
    fn write_runs(&mut self, key: NodeKey, runs: Vec<RunSpec>) {
        let old = self
            .state
            .nodes
            .get(&key)
            .and_then(Node::element)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        for run in old {
            self.state.nodes.remove(&run);
            self.dirty.insert(run);
        }

        let mut children = Vec::with_capacity(runs.len());
        for run in runs {
            let run_key = self.state.alloc_key();
            self.state.nodes.insert(
                run_key,
                Node::TextRun(TextRun {
                    parent: key,
                    text: run.text,
                    format: run.format,
                }),
            );
            self.dirty.insert(run_key);
            children.push(run_key);
        }

        if let Some(element) = self.state.nodes.get_mut(&key).and_then(Node::element_mut) {
            element.children = children;
        }
        self.dirty.insert(key);
    }
}

fn check_offset(key: NodeKey, offset: usize, len: usize) -> Result<(), TreeError> {
    if offset > len {
        return Err(TreeError::OffsetOutOfRange { key, offset, len });
    }
    Ok(())
}

fn check_range(key: NodeKey, offset: usize, count: usize, len: usize) -> Result<(), TreeError> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(TreeError::OffsetOutOfRange { key, offset: offset.saturating_add(count), len }),
    }
}
