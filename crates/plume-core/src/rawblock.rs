//! Raw block extraction.
//!
//! `script`/`style`/`markdown`/`text` blocks are pulled out of the document
//! bodily before tag parsing; their content is opaque to the tag grammar.
//! Each block is converted eagerly by a pluggable [`BlockConverter`] and
//! replaced in the text with a `%!b{i}!%` marker that the parser carries as
//! an inert leaf node until final reassembly.

use crate::literal::{self, ProtectedLiteral};

/// Normalized block kind. Synonyms collapse at extraction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Script,
    Style,
    Markdown,
    Text,
}

impl RawKind {
    /// `js` -> script, `css`/`less` -> style, `md` -> markdown,
    /// `txt`/`raw` -> text. Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "script" | "js" => Some(Self::Script),
            "style" | "css" | "less" => Some(Self::Style),
            "markdown" | "md" => Some(Self::Markdown),
            "text" | "txt" | "raw" => Some(Self::Text),
            _ => None,
        }
    }
}

/// An extracted block: resolved attributes, converted content.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub kind: RawKind,
    pub attrs: String,
    pub content: String,
}

impl RawBlock {
    /// The final HTML put back in place of the block marker.
    pub fn render(&self) -> String {
        let attrs = if self.attrs.is_empty() {
            String::new()
        } else {
            format!(" {}", self.attrs)
        };
        match self.kind {
            RawKind::Script => format!("<script{}>{}</script>", attrs, self.content),
            RawKind::Style => format!("<style{}>{}</style>", attrs, self.content),
            RawKind::Markdown => {
                format!("<div class=\"markdown\"{}>{}</div>", attrs, self.content)
            }
            RawKind::Text => format!("<div class=\"text\"{}>{}</div>", attrs, self.content),
        }
    }
}

/// Content converters, selected by block kind. Implementations are external
/// collaborators as far as the compiler is concerned; the defaults below
/// are intentionally conservative.
pub trait BlockConverter {
    fn script(&self, src: &str) -> Result<String, String>;
    fn style(&self, src: &str) -> Result<String, String>;
    fn markdown(&self, src: &str) -> Result<String, String>;
    fn text(&self, src: &str) -> Result<String, String>;
}

/// Default converter set: a comment-stripping script/style cleaner built on
/// the literal protector (strings survive untouched), markdown through
/// pulldown-cmark, and HTML escaping for text blocks.
#[derive(Debug, Default)]
pub struct DefaultConverters;

impl BlockConverter for DefaultConverters {
    fn script(&self, src: &str) -> Result<String, String> {
        Ok(strip_code_comments(src, true))
    }

    fn style(&self, src: &str) -> Result<String, String> {
        Ok(strip_code_comments(src, false))
    }

    fn markdown(&self, src: &str) -> Result<String, String> {
        let parser = pulldown_cmark::Parser::new(src);
        let mut html = String::with_capacity(src.len());
        pulldown_cmark::html::push_html(&mut html, parser);
        Ok(html)
    }

    fn text(&self, src: &str) -> Result<String, String> {
        Ok(crate::escape_html(src))
    }
}

pub fn convert(
    conv: &dyn BlockConverter,
    kind: RawKind,
    src: &str,
) -> Result<String, String> {
    match kind {
        RawKind::Script => conv.script(src),
        RawKind::Style => conv.style(src),
        RawKind::Markdown => conv.markdown(src),
        RawKind::Text => conv.text(src),
    }
}

/// Removes comments and blank lines from script/style content without
/// touching string literals. Newlines between statements are preserved, so
/// no grammar analysis is needed.
fn strip_code_comments(src: &str, line_comments: bool) -> String {
    let (mut protected, lits) = literal::protect(&literal::encode_guards(src));

    if line_comments {
        // The protector only strips line comments at line starts; script
        // content also allows them after code.
        let mut out = String::with_capacity(protected.len());
        for line in protected.lines() {
            match line.find("//") {
                Some(pos) => out.push_str(line[..pos].trim_end()),
                None => out.push_str(line),
            }
            out.push('\n');
        }
        protected = out;
    }

    let trimmed: Vec<&str> = protected
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    literal::decode_guards(&literal::restore(&trimmed.join("\n"), &lits))
}

fn block_marker(index: usize) -> String {
    format!("%!b{index}!%")
}

/// Parses a `%!b{i}!%` marker at the start of `text`.
pub fn parse_marker(text: &str) -> Option<(usize, usize)> {
    let rest = text.strip_prefix("%!b")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || !rest[digits.len()..].starts_with("!%") {
        return None;
    }
    Some((digits.parse().ok()?, 3 + digits.len() + 2))
}

/// Extracts every raw block from protected text, replacing each with a
/// marker. Attributes and content are resolved against the literal table
/// before conversion; conversion failures abort compilation.
pub fn extract(
    text: &str,
    literals: &[ProtectedLiteral],
    conv: &dyn BlockConverter,
) -> Result<(String, Vec<RawBlock>), String> {
    let mut out = String::with_capacity(text.len());
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = find_block_open(rest) {
        let BlockOpen {
            start,
            body_start,
            name,
            kind,
            attrs,
        } = open;

        out.push_str(&rest[..start]);

        let close = format!("</{}>", name);
        let Some(close_pos) = find_ci(&rest[body_start..], &close) else {
            // No matching close tag: leave the opening tag as plain text.
            out.push_str(&rest[start..body_start]);
            rest = &rest[body_start..];
            continue;
        };

        let raw_content = &rest[body_start..body_start + close_pos];
        let content = literal::decode_guards(&literal::restore(raw_content, literals));
        let converted = convert(conv, kind, &content)
            .map_err(|e| format!("{} block conversion failed: {e}", name))?;

        blocks.push(RawBlock {
            kind,
            attrs: literal::decode_guards(&literal::restore(&attrs, literals)),
            content: converted,
        });
        out.push_str(&block_marker(blocks.len() - 1));

        rest = &rest[body_start + close_pos + close.len()..];
    }

    out.push_str(rest);
    Ok((out, blocks))
}

struct BlockOpen {
    start: usize,
    body_start: usize,
    name: String,
    kind: RawKind,
    attrs: String,
}

fn find_block_open(text: &str) -> Option<BlockOpen> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while let Some(pos) = text[i..].find('<') {
        let start = i + pos;
        let name_start = start + 1;
        let mut end = name_start;
        while end < bytes.len() && bytes[end].is_ascii_alphabetic() {
            end += 1;
        }
        let boundary = matches!(
            bytes.get(end),
            None | Some(b'>') | Some(b'/') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n')
        );
        if end > name_start && boundary {
            let name = &text[name_start..end];
            if let Some(kind) = RawKind::from_name(name) {
                // Attributes run to the first `>`; strings are placeholders
                // by now, so a bare `>` always closes the tag.
                if let Some(gt) = text[end..].find('>') {
                    let attr_text = text[end..end + gt].trim();
                    if !attr_text.ends_with('/') {
                        return Some(BlockOpen {
                            start,
                            body_start: end + gt + 1,
                            name: name.to_string(),
                            kind,
                            attrs: attr_text.to_string(),
                        });
                    }
                }
            }
        }
        i = start + 1;
    }
    None
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack_lower = haystack.to_ascii_lowercase();
    haystack_lower.find(&needle.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protect_and_extract(src: &str) -> (String, Vec<RawBlock>) {
        let (text, lits) = literal::protect(&literal::encode_guards(src));
        extract(&text, &lits, &DefaultConverters).unwrap()
    }

    #[test]
    fn test_extract_script_block() {
        let (text, blocks) = protect_and_extract("<script>let x = 1;</script>");
        assert_eq!(text, "%!b0!%");
        assert_eq!(blocks[0].kind, RawKind::Script);
        assert_eq!(blocks[0].content, "let x = 1;");
    }

    #[test]
    fn test_js_synonym_and_attrs() {
        let (_, blocks) = protect_and_extract(r#"<js defer="defer">run();</js>"#);
        assert_eq!(blocks[0].kind, RawKind::Script);
        assert_eq!(blocks[0].attrs, r#"defer="defer""#);
        assert_eq!(blocks[0].render(), r#"<script defer="defer">run();</script>"#);
    }

    #[test]
    fn test_script_inline_comment_stripped_string_kept() {
        let (_, blocks) =
            protect_and_extract("<script>let u = \"http://x\"; // trailing\n</script>");
        assert!(blocks[0].content.contains("http://x"));
        assert!(!blocks[0].content.contains("trailing"));
    }

    #[test]
    fn test_markdown_block() {
        let (_, blocks) = protect_and_extract("<md># Title</md>");
        assert!(blocks[0].content.contains("<h1>"));
        assert!(blocks[0].render().starts_with("<div class=\"markdown\">"));
    }

    #[test]
    fn test_text_block_is_escaped() {
        let (_, blocks) = protect_and_extract("<txt><b>bold</b></txt>");
        assert_eq!(blocks[0].content, "&lt;b&gt;bold&lt;/b&gt;");
    }

    #[test]
    fn test_unclosed_block_left_as_text() {
        let (text, blocks) = protect_and_extract("<style>body {}");
        assert!(blocks.is_empty());
        assert!(text.contains("<style>"));
    }

    #[test]
    fn test_non_greedy_close() {
        let (text, blocks) =
            protect_and_extract("<text>one</text>mid<text>two</text>");
        assert_eq!(blocks.len(), 2);
        assert_eq!(text, "%!b0!%mid%!b1!%");
        assert_eq!(blocks[0].content, "one");
    }
}
