//! Persisted projection of a story and the initial document built on load.

use crate::markup;
use crate::tree::{BlockKind, BlockSpec, TreeSnapshot};

/// Title text used when a story has neither a title node nor a stored title.
pub const TITLE_PLACEHOLDER: &str = "Untitled.";

/// Body text used when a story has no content yet.
pub const BODY_PLACEHOLDER: &str = "Start typing here...";

/// Derived view of a document pushed to the story store.
///
/// Always recomputed in full from the tree, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorySnapshot {
    pub content: String,
    pub word_count: usize,
    pub title: Option<String>,
    pub subtitle: Option<String>,
}

impl StorySnapshot {
    pub fn derive(tree: &TreeSnapshot) -> Self {
        let text_of = |kind| tree.first_block_of(kind).map(|key| tree.block_text(key));
        Self {
            content: markup::render(tree),
            word_count: word_count(&tree.text_content()),
            title: text_of(BlockKind::Title),
            subtitle: text_of(BlockKind::Subtitle),
        }
    }
}

/// Number of whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Blocks a room starts from: the stored markup plus placeholders.
///
/// A title block is synthesized at the top when the markup has none, using
/// the stored title if it is non-empty. Empty content also gets a
/// placeholder paragraph.
pub fn initial_blocks(content: &str, stored_title: Option<&str>) -> Vec<BlockSpec> {
    let mut blocks = markup::parse(content);

    if !blocks.iter().any(|b| b.kind == BlockKind::Title) {
        let title = stored_title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(TITLE_PLACEHOLDER);
        blocks.insert(0, BlockSpec::plain(BlockKind::Title, title));
    }
    if content.trim().is_empty() {
        blocks.push(BlockSpec::plain(BlockKind::Paragraph, BODY_PLACEHOLDER));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DocumentTree;

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("  one\ttwo\n\nthree  "), 3);
    }

    #[test]
    fn test_derive_snapshot() {
        let tree = DocumentTree::from_specs(&[
            BlockSpec::plain(BlockKind::Title, "My Story"),
            BlockSpec::plain(BlockKind::Subtitle, "A tale"),
            BlockSpec::plain(BlockKind::Paragraph, "It was a dark night."),
            BlockSpec::plain(BlockKind::Title, "Ignored"),
        ]);
        let snapshot = StorySnapshot::derive(&tree.snapshot());
        assert_eq!(snapshot.title.as_deref(), Some("My Story"));
        assert_eq!(snapshot.subtitle.as_deref(), Some("A tale"));
        assert_eq!(snapshot.word_count, 2 + 2 + 5 + 1);
        assert!(snapshot.content.starts_with("<h1>My Story</h1><h2>A tale</h2>"));
    }

    #[test]
    fn test_derive_without_title() {
        let tree = DocumentTree::from_specs(&[BlockSpec::plain(BlockKind::Paragraph, "body")]);
        let snapshot = StorySnapshot::derive(&tree.snapshot());
        assert_eq!(snapshot.title, None);
        assert_eq!(snapshot.subtitle, None);
    }

    #[test]
    fn test_initial_blocks_for_empty_story() {
        let blocks = initial_blocks("", None);
        assert_eq!(
            blocks,
            vec![
                BlockSpec::plain(BlockKind::Title, TITLE_PLACEHOLDER),
                BlockSpec::plain(BlockKind::Paragraph, BODY_PLACEHOLDER),
            ]
        );
    }

    #[test]
    fn test_initial_blocks_uses_stored_title() {
        let blocks = initial_blocks("<p>Hello</p>", Some("Stored"));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], BlockSpec::plain(BlockKind::Title, "Stored"));
        assert_eq!(blocks[1].text(), "Hello");
    }

    #[test]
    fn test_initial_blocks_keeps_existing_title() {
        let blocks = initial_blocks("<h1>Kept</h1><p>Body</p>", Some("Other"));
        assert_eq!(blocks[0], BlockSpec::plain(BlockKind::Title, "Kept"));
        assert_eq!(blocks.len(), 2);
    }
}
