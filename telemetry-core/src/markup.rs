//! HTML-subset import and export for stored story content.
//!
//! Import recognises the block tags `h1` (title), `h2` (subtitle), `p`,
//! `div`, `h3`–`h6`, `li` (paragraph) and `blockquote` (quote), plus the
//! inline tags `b`/`strong`, `i`/`em`, `u`, `s`/`strike`/`del`, `sup` and
//! `code`. Unknown tags are transparent; attributes are ignored. `<br>`
//! becomes a line break inside the current block.
//!
//! Only the first `h1` and the first `h2` keep their special kind; later
//! ones are imported as paragraphs.
//!
//! Export walks a [`TreeSnapshot`] and emits one element per block with
//! escaped text and nested inline tags.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::tree::{BlockKind, BlockSpec, Format, RunSpec, TreeSnapshot};

// ─── Tokenizer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open(String),
    Close(String),
    Text(String),
}

/// Named entities accepted besides numeric references.
fn resolve_entity(name: &str) -> Option<&'static str> {
    match name {
        "amp" => Some("&"),
        "lt" => Some("<"),
        "gt" => Some(">"),
        "quot" => Some("\""),
        "apos" => Some("'"),
        "nbsp" => Some("\u{a0}"),
        _ => None,
    }
}

fn element_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

/// Split markup into tags and decoded text. Stored stories are HTML, not
/// XML, so end tags are not matched against start tags and void elements
/// such as `<br>` need no closing slash. Comments and declarations are
/// skipped; text with an unknown entity is kept verbatim.
fn tokenize(input: &str) -> Vec<Token> {
    let mut reader = Reader::from_str(input);
    let config = reader.config_mut();
    config.trim_text(false);
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut tokens = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => tokens.push(Token::Open(element_name(e.name().as_ref()))),
            Ok(Event::End(e)) => tokens.push(Token::Close(element_name(e.name().as_ref()))),
            Ok(Event::Text(e)) => {
                let text = match e.unescape_with(resolve_entity) {
                    Ok(text) => text.into_owned(),
                    Err(_) => String::from_utf8_lossy(&e).into_owned(),
                };
                tokens.push(Token::Text(text));
            }
            Ok(Event::CData(e)) => tokens.push(Token::Text(String::from_utf8_lossy(&e).into_owned())),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("stopping markup import at malformed input: {e}");
                break;
            }
        }
    }
    tokens
}

// ─── Import ─────────────────────────────────────────────────────────

fn block_tag(name: &str) -> Option<BlockKind> {
    match name {
        "h1" => Some(BlockKind::Title),
        "h2" => Some(BlockKind::Subtitle),
        "blockquote" => Some(BlockKind::Quote),
        "p" | "div" | "li" | "h3" | "h4" | "h5" | "h6" => Some(BlockKind::Paragraph),
        _ => None,
    }
}

fn inline_tag(name: &str) -> Option<Format> {
    match name {
        "b" | "strong" => Some(Format::BOLD),
        "i" | "em" => Some(Format::ITALIC),
        "u" => Some(Format::UNDERLINE),
        "s" | "strike" | "del" => Some(Format::STRIKETHROUGH),
        "sup" => Some(Format::SUPERSCRIPT),
        "code" => Some(Format::CODE),
        _ => None,
    }
}

struct OpenBlock {
    tag: String,
    kind: BlockKind,
    runs: Vec<RunSpec>,
}

impl OpenBlock {
    fn ends_with_space(&self) -> bool {
        self.runs
            .last()
            .and_then(|r| r.text.chars().last())
            .map_or(true, |c| c == ' ' || c == '\n')
    }

    fn push(&mut self, text: &str, format: Format) {
        self.runs.push(RunSpec::new(text, format));
    }
}

#[derive(Default)]
struct Importer {
    blocks: Vec<BlockSpec>,
    current: Option<OpenBlock>,
    inline: Vec<(String, Format)>,
    seen_title: bool,
    seen_subtitle: bool,
}

impl Importer {
    fn format(&self) -> Format {
        self.inline
            .iter()
            .fold(Format::empty(), |acc, (_, f)| acc | *f)
    }

    fn open_block(&mut self, tag: String, kind: BlockKind) {
        // Paragraph markup nested inside a quote stays part of the quote.
        if let Some(open) = &self.current {
            if open.kind == BlockKind::Quote && kind == BlockKind::Paragraph {
                return;
            }
        }
        self.flush();
        self.current = Some(OpenBlock {
            tag,
            kind,
            runs: Vec::new(),
        });
    }

    fn close_block(&mut self, tag: &str) {
        if self.current.as_ref().is_some_and(|b| b.tag == tag) {
            self.flush();
        }
    }

    fn text(&mut self, raw: &str) {
        let collapsed = collapse_whitespace(raw);
        if self.current.is_none() {
            if collapsed.trim().is_empty() {
                return;
            }
            self.current = Some(OpenBlock {
                tag: String::new(),
                kind: BlockKind::Paragraph,
                runs: Vec::new(),
            });
        }
        let format = self.format();
        if let Some(block) = self.current.as_mut() {
            let text = if block.ends_with_space() {
                collapsed.trim_start_matches(' ')
            } else {
                collapsed.as_str()
            };
            if !text.is_empty() {
                block.push(text, format);
            }
        }
    }

    fn line_break(&mut self) {
        let format = self.format();
        let block = self.current.get_or_insert_with(|| OpenBlock {
            tag: String::new(),
            kind: BlockKind::Paragraph,
            runs: Vec::new(),
        });
        if let Some(last) = block.runs.last_mut() {
            let trimmed = last.text.trim_end_matches(' ').len();
            last.text.truncate(trimmed);
        }
        block.push("\n", format);
    }

    fn flush(&mut self) {
        let Some(mut block) = self.current.take() else {
            return;
        };
        trim_block_end(&mut block.runs);

        let kind = match block.kind {
            BlockKind::Title if self.seen_title => BlockKind::Paragraph,
            BlockKind::Subtitle if self.seen_subtitle => BlockKind::Paragraph,
            other => other,
        };
        match kind {
            BlockKind::Title => self.seen_title = true,
            BlockKind::Subtitle => self.seen_subtitle = true,
            BlockKind::Paragraph | BlockKind::Quote => {}
        }
        self.blocks.push(BlockSpec::new(kind, block.runs));
    }

    fn finish(mut self) -> Vec<BlockSpec> {
        self.flush();
        self.blocks
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_ascii_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Drop trailing spaces and one trailing line break (an empty line's `<br>`).
fn trim_block_end(runs: &mut Vec<RunSpec>) {
    while let Some(last) = runs.last_mut() {
        let trimmed = last.text.trim_end_matches(' ').len();
        last.text.truncate(trimmed);
        if last.text.is_empty() {
            runs.pop();
        } else {
            break;
        }
    }
    if let Some(last) = runs.last_mut() {
        if last.text.ends_with('\n') {
            last.text.pop();
            if last.text.is_empty() {
                runs.pop();
            }
        }
    }
}

/// Parse stored markup into block specs.
pub fn parse(markup: &str) -> Vec<BlockSpec> {
    let mut importer = Importer::default();
    for token in tokenize(markup) {
        match token {
            Token::Open(name) if name == "br" => importer.line_break(),
            Token::Open(name) => {
                if let Some(kind) = block_tag(&name) {
                    importer.open_block(name, kind);
                } else if let Some(format) = inline_tag(&name) {
                    importer.inline.push((name, format));
                }
            }
            Token::Close(name) => {
                if block_tag(&name).is_some() {
                    importer.close_block(&name);
                } else if inline_tag(&name).is_some() {
                    if let Some(pos) = importer.inline.iter().rposition(|(n, _)| *n == name) {
                        importer.inline.remove(pos);
                    }
                }
            }
            Token::Text(text) => importer.text(&text),
        }
    }
    importer.finish()
}

// ─── Export ─────────────────────────────────────────────────────────

/// Outer-to-inner nesting of inline tags.
const INLINE_TAGS: [(Format, &str); 6] = [
    (Format::BOLD, "strong"),
    (Format::ITALIC, "em"),
    (Format::UNDERLINE, "u"),
    (Format::STRIKETHROUGH, "s"),
    (Format::SUPERSCRIPT, "sup"),
    (Format::CODE, "code"),
];

fn block_element(kind: BlockKind) -> &'static str {
    match kind {
        BlockKind::Title => "h1",
        BlockKind::Subtitle => "h2",
        BlockKind::Paragraph => "p",
        BlockKind::Quote => "blockquote",
    }
}

fn escape_into(out: &mut String, text: &str) {
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push_str("<br>");
        }
        out.push_str(&quick_xml::escape::escape(line));
    }
}

/// Render block specs to markup.
pub fn render_blocks(blocks: &[BlockSpec]) -> String {
    let mut out = String::new();
    for block in blocks {
        let tag = block_element(block.kind);
        out.push('<');
        out.push_str(tag);
        out.push('>');
        if block.runs.is_empty() {
            out.push_str("<br>");
        }
        for run in &block.runs {
            for (flag, name) in INLINE_TAGS.iter() {
                if run.format.contains(*flag) {
                    out.push('<');
                    out.push_str(name);
                    out.push('>');
                }
            }
            escape_into(&mut out, &run.text);
            for (flag, name) in INLINE_TAGS.iter().rev() {
                if run.format.contains(*flag) {
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
        }
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }
    out
}

/// Render a tree snapshot to markup.
pub fn render(tree: &TreeSnapshot) -> String {
    render_blocks(&tree.to_specs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_kinds() {
        let blocks = parse("<h1>Title</h1><h2>Sub</h2><p>Body</p><blockquote>Quoted</blockquote>");
        let kinds: Vec<BlockKind> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::Title, BlockKind::Subtitle, BlockKind::Paragraph, BlockKind::Quote]
        );
        assert_eq!(blocks[3].text(), "Quoted");
    }

    #[test]
    fn test_parse_inline_formats() {
        let blocks = parse("<p>a <strong>b<em>c</em></strong> <code>d</code><sup>2</sup></p>");
        let runs = &blocks[0].runs;
        assert_eq!(runs[0], RunSpec::new("a ", Format::empty()));
        assert_eq!(runs[1], RunSpec::new("b", Format::BOLD));
        assert_eq!(runs[2], RunSpec::new("c", Format::BOLD | Format::ITALIC));
        assert_eq!(runs[3], RunSpec::new(" ", Format::empty()));
        assert_eq!(runs[4], RunSpec::new("d", Format::CODE));
        assert_eq!(runs[5], RunSpec::new("2", Format::SUPERSCRIPT));
    }

    #[test]
    fn test_parse_collapses_whitespace_and_decodes_entities() {
        let blocks = parse("<p>\n   Fish &amp;   chips &lt;3 &#233;&#x41;  </p>");
        assert_eq!(blocks[0].text(), "Fish & chips <3 éA");
    }

    #[test]
    fn test_parse_ignores_attributes_and_spans() {
        let html = r#"<h1 class="editor-title" data-x="a>b"><span style="white-space: pre-wrap;">Hello</span></h1>"#;
        let blocks = parse(html);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Title);
        assert_eq!(blocks[0].text(), "Hello");
    }

    #[test]
    fn test_parse_demotes_extra_titles() {
        let blocks = parse("<h1>One</h1><h1>Two</h1><h2>A</h2><h2>B</h2>");
        let kinds: Vec<BlockKind> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::Title, BlockKind::Paragraph, BlockKind::Subtitle, BlockKind::Paragraph]
        );
    }

    #[test]
    fn test_parse_line_breaks() {
        let blocks = parse("<p>line one<br>line two</p><p><br></p>");
        assert_eq!(blocks[0].text(), "line one\nline two");
        assert!(blocks[1].runs.is_empty());
    }

    #[test]
    fn test_parse_bare_text_and_empty_input() {
        assert!(parse("").is_empty());
        assert!(parse("   \n ").is_empty());
        let blocks = parse("just text");
        assert_eq!(blocks[0].kind, BlockKind::Paragraph);
        assert_eq!(blocks[0].text(), "just text");
    }

    #[test]
    fn test_parse_quote_with_nested_paragraph() {
        let blocks = parse("<blockquote><p>inner</p></blockquote><p>after</p>");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, BlockKind::Quote);
        assert_eq!(blocks[0].text(), "inner");
        assert_eq!(blocks[1].text(), "after");
    }

    #[test]
    fn test_parse_skips_comments() {
        let blocks = parse("<!-- note --><p>x</p>");
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_parse_tolerates_html_quirks() {
        let html = "<!DOCTYPE html><P>caps<BR/>and <b>unclosed</p></i><p>Tom &amp; Jerry&apos;s &copy; &nbsp;x</p>";
        let blocks = parse(html);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text(), "caps\nand unclosed");
        assert_eq!(blocks[0].runs.last().map(|r| r.format), Some(Format::BOLD));
        // an unknown entity leaves that text undecoded
        assert_eq!(blocks[1].text(), "Tom &amp; Jerry&apos;s &copy; &nbsp;x");
    }

    #[test]
    fn test_render_escapes_markup_characters() {
        let blocks = vec![BlockSpec::plain(BlockKind::Paragraph, "<b>\"x\" & 'y'</b>")];
        let html = render_blocks(&blocks);
        assert!(!html.contains("<b>"));
        assert_eq!(parse(&html), blocks);
    }

    #[test]
    fn test_render_blocks() {
        let blocks = vec![
            BlockSpec::plain(BlockKind::Title, "A & B"),
            BlockSpec::new(
                BlockKind::Paragraph,
                vec![
                    RunSpec::new("x", Format::BOLD | Format::UNDERLINE),
                    RunSpec::new("\ny", Format::empty()),
                ],
            ),
            BlockSpec::new(BlockKind::Quote, Vec::new()),
        ];
        assert_eq!(
            render_blocks(&blocks),
            "<h1>A &amp; B</h1><p><strong><u>x</u></strong><br>y</p><blockquote><br></blockquote>"
        );
    }

    #[test]
    fn test_render_then_parse_preserves_content() {
        let blocks = vec![
            BlockSpec::plain(BlockKind::Title, "T"),
            BlockSpec::plain(BlockKind::Subtitle, "S"),
            BlockSpec::new(
                BlockKind::Paragraph,
                vec![
                    RunSpec::new("a", Format::STRIKETHROUGH),
                    RunSpec::new("b", Format::ITALIC | Format::CODE),
                ],
            ),
        ];
        assert_eq!(parse(&render_blocks(&blocks)), blocks);
    }
}
