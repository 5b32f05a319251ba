//! Tag parser.
//!
//! Rewrites protected, block-extracted text into a node tree. Tags are
//! classified by their first name character: `_` means an extensible
//! function tag, an uppercase letter means a component tag, lowercase
//! means passthrough HTML that is normalized (attributes sorted by key,
//! literals reinserted) and carried as plain text.
//!
//! The depth a tag opened at becomes its `level`; a matching open/close
//! pair always shares one level, and self-closing tags never move the
//! depth counter. Unbalanced markup is tolerated: stray closes are
//! dropped and unclosed tags auto-close at end of input, both with a
//! diagnostic rather than an error.

use crate::literal::{self, ProtectedLiteral};
use crate::rawblock::{self, BlockConverter, RawBlock};
use crate::registry::normalize_name;
use crate::{Diagnostic, format_f64};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Function,
    Component,
}

/// A parsed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Decoded quoted literal.
    Str(String),
    /// Bare or quoted numeric.
    Num(f64),
    Bool(bool),
    /// Unresolved context reference, operator token, or bare word.
    Ref(String),
    /// `{{expr}}` (`raw` false) or `{{{expr}}}` (`raw` true) valued
    /// attribute, resolved against the caller context at expansion time.
    Interp { expr: String, raw: bool },
}

impl ArgValue {
    /// The token text as written, used where a value is read as a name.
    pub fn display(&self) -> String {
        match self {
            ArgValue::Str(s) | ArgValue::Ref(s) => s.clone(),
            ArgValue::Num(n) => format_f64(*n),
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Interp { expr, .. } => expr.clone(),
        }
    }
}

/// Ordered argument table for one tag occurrence. Positional arguments get
/// stringified auto-indices as keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgList {
    pub entries: Vec<(String, ArgValue)>,
}

impl ArgList {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Positional values in order.
    pub fn positional(&self) -> impl Iterator<Item = &ArgValue> {
        self.entries
            .iter()
            .filter(|(k, _)| k.parse::<usize>().is_ok())
            .map(|(_, v)| v)
    }

    /// Keyed (non-positional) entries in order.
    pub fn keyed(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.entries
            .iter()
            .filter(|(k, _)| k.parse::<usize>().is_err())
            .map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Text(String),
    /// Marker for an extracted raw block, by index into `Document::blocks`.
    RawBlock(usize),
    Tag {
        kind: TagKind,
        name: String,
        args: ArgList,
        level: usize,
        children: Vec<NodeId>,
        self_closing: bool,
    },
}

/// The parsed-but-unexpanded document. Created once per cache miss and
/// shared read-only between renders.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub nodes: Vec<Node>,
    pub roots: Vec<NodeId>,
    pub literals: Vec<ProtectedLiteral>,
    pub blocks: Vec<RawBlock>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Document {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

/// Full source-to-IR pipeline: guard encoding, literal protection, raw
/// block extraction, tag parsing.
pub fn compile_source(src: &str, conv: &dyn BlockConverter) -> Result<Document, String> {
    let encoded = literal::encode_guards(src);
    let (protected, literals) = literal::protect(&encoded);
    let (text, blocks) = rawblock::extract(&protected, &literals, conv)?;
    Ok(parse(&text, literals, blocks))
}

struct Parser {
    doc: Document,
    open: Vec<NodeId>,
    buf: String,
}

fn parse(text: &str, literals: Vec<ProtectedLiteral>, blocks: Vec<RawBlock>) -> Document {
    let mut p = Parser {
        doc: Document {
            literals,
            blocks,
            ..Document::default()
        },
        open: Vec::new(),
        buf: String::new(),
    };

    let mut rest = text;
    while let Some(pos) = rest.find('<') {
        p.buf.push_str(&rest[..pos]);
        let tag_text = &rest[pos..];
        match scan_tag(tag_text) {
            Some(tag) => {
                let consumed = tag.consumed;
                p.apply(tag);
                rest = &tag_text[consumed..];
            }
            None => {
                p.buf.push('<');
                rest = &tag_text[1..];
            }
        }
    }
    p.buf.push_str(rest);
    p.flush_text();

    while let Some(id) = p.open.pop() {
        if let Node::Tag { name, .. } = &p.doc.nodes[id] {
            p.doc.diagnostics.push(Diagnostic::warn(
                "unbalanced_tag",
                format!("tag '{}' was never closed", name),
            ));
        }
    }

    p.doc
}

impl Parser {
    /// Splits the pending text buffer on raw-block markers and attaches the
    /// resulting nodes to the current parent. Text is fully resolved here
    /// (literals back in place, guard encoding undone) so nothing
    /// document-local leaks into expanded output that another document
    /// might splice in.
    fn flush_text(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let buf = std::mem::take(&mut self.buf);
        let mut rest = buf.as_str();
        while let Some(pos) = rest.find("%!b") {
            match rawblock::parse_marker(&rest[pos..]) {
                Some((index, len)) => {
                    if pos > 0 {
                        self.attach_text(&rest[..pos]);
                    }
                    self.attach(Node::RawBlock(index));
                    rest = &rest[pos + len..];
                }
                None => {
                    self.attach_text(&rest[..pos + 3]);
                    rest = &rest[pos + 3..];
                }
            }
        }
        if !rest.is_empty() {
            self.attach_text(rest);
        }
    }

    fn attach_text(&mut self, text: &str) {
        let restored = literal::decode_guards(&literal::restore(text, &self.doc.literals));
        self.attach(Node::Text(restored));
    }

    fn attach(&mut self, node: Node) -> NodeId {
        let id = self.doc.nodes.len();
        self.doc.nodes.push(node);
        match self.open.last() {
            Some(&parent) => {
                if let Node::Tag { children, .. } = &mut self.doc.nodes[parent] {
                    children.push(id);
                }
            }
            None => self.doc.roots.push(id),
        }
        id
    }

    fn apply(&mut self, tag: ScannedTag) {
        let kind = match classify(&tag.name) {
            Some(kind) => kind,
            None => {
                // Passthrough HTML: normalize and keep as text.
                self.buf.push_str(&render_passthrough(
                    &tag,
                    &self.doc.literals,
                ));
                return;
            }
        };

        if tag.closing {
            self.flush_text();
            self.close_tag(&tag.name);
            return;
        }

        self.flush_text();
        let args = if is_condition_tag(&tag.name) {
            parse_condition_args(&tag.attrs, &self.doc.literals)
        } else {
            parse_args(&tag.attrs, &self.doc.literals)
        };

        let level = self.open.len();
        let id = self.attach(Node::Tag {
            kind,
            name: tag.name,
            args,
            level,
            children: Vec::new(),
            self_closing: tag.self_closing,
        });
        if !tag.self_closing {
            self.open.push(id);
        }
    }

    fn close_tag(&mut self, name: &str) {
        let matches = |id: &NodeId| match &self.doc.nodes[*id] {
            Node::Tag { name: n, .. } => n == name,
            _ => false,
        };

        if self.open.last().map(matches).unwrap_or(false) {
            self.open.pop();
            return;
        }

        match self.open.iter().rposition(|id| matches(id)) {
            Some(pos) => {
                // Auto-close everything opened after the match.
                while self.open.len() > pos {
                    let id = self.open.pop().unwrap();
                    if self.open.len() > pos {
                        if let Node::Tag { name: n, .. } = &self.doc.nodes[id] {
                            self.doc.diagnostics.push(Diagnostic::warn(
                                "unbalanced_tag",
                                format!("tag '{}' auto-closed by '</{}>'", n, name),
                            ));
                        }
                    }
                }
            }
            None => {
                self.doc.diagnostics.push(Diagnostic::warn(
                    "unbalanced_tag",
                    format!("stray closing tag '</{}>'", name),
                ));
            }
        }
    }
}

fn classify(name: &str) -> Option<TagKind> {
    let first = name.chars().next()?;
    if first == '_' {
        Some(TagKind::Function)
    } else if first.is_ascii_uppercase() {
        Some(TagKind::Component)
    } else {
        None
    }
}

/// `_if`, `_elif` and `_else` keep their raw comparison tokens instead of
/// key=value attributes.
fn is_condition_tag(name: &str) -> bool {
    matches!(
        name.strip_prefix('_').map(normalize_name).as_deref(),
        Some("if" | "elif" | "else")
    )
}

struct ScannedTag {
    consumed: usize,
    closing: bool,
    name: String,
    attrs: String,
    self_closing: bool,
}

/// Scans one tag starting at a `<`. Returns `None` when the text does not
/// form a tag, in which case the `<` is ordinary text.
fn scan_tag(text: &str) -> Option<ScannedTag> {
    let bytes = text.as_bytes();
    let mut i = 1;
    let closing = bytes.get(i) == Some(&b'/');
    if closing {
        i += 1;
    }

    let name_start = i;
    match bytes.get(i) {
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => i += 1,
        _ => return None,
    }
    while let Some(b) = bytes.get(i) {
        if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'$' | b'-' | b':') {
            i += 1;
        } else {
            break;
        }
    }
    let name = text[name_start..i].to_string();
    let condition = !closing && is_condition_tag(&name);

    let mut attrs = String::new();
    loop {
        let b = *bytes.get(i)?;
        match b {
            b'>' => {
                // Inside `_if`-family attributes a comparison `>` is kept:
                // either `>=`, or a bare `>` with whitespace on both sides.
                if condition && bytes.get(i + 1) == Some(&b'=') {
                    attrs.push_str(">=");
                    i += 2;
                    continue;
                }
                if condition
                    && attrs.ends_with(|c: char| c.is_whitespace())
                    && bytes.get(i + 1).is_some_and(|b| b.is_ascii_whitespace())
                {
                    attrs.push('>');
                    i += 1;
                    continue;
                }
                i += 1;
                break;
            }
            b'<' => {
                if condition
                    && (bytes.get(i + 1) == Some(&b'=')
                        || (attrs.ends_with(|c: char| c.is_whitespace())
                            && bytes.get(i + 1).is_some_and(|b| b.is_ascii_whitespace())))
                {
                    attrs.push('<');
                    i += 1;
                    continue;
                }
                return None;
            }
            _ => {
                let ch = text[i..].chars().next()?;
                attrs.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    let mut attrs = attrs.trim().to_string();
    let mut self_closing = false;
    if attrs.ends_with('/') {
        self_closing = true;
        attrs.pop();
        attrs.truncate(attrs.trim_end().len());
    }

    Some(ScannedTag {
        consumed: i,
        closing,
        name,
        attrs,
        self_closing,
    })
}

/// Rebuilds a passthrough tag: keyed attributes lexically sorted, literals
/// reinserted verbatim, no semantic processing.
fn render_passthrough(tag: &ScannedTag, literals: &[ProtectedLiteral]) -> String {
    if tag.closing {
        return format!("</{}>", tag.name);
    }

    let mut keyed: Vec<&str> = Vec::new();
    let mut bare: Vec<&str> = Vec::new();
    for token in tag.attrs.split_whitespace() {
        match token.split_once('=') {
            Some((k, _)) if !k.is_empty() && !k.starts_with("{{") => keyed.push(token),
            _ => bare.push(token),
        }
    }
    keyed.sort();

    let mut out = String::new();
    out.push('<');
    out.push_str(&tag.name);
    for token in keyed.into_iter().chain(bare) {
        out.push(' ');
        out.push_str(&literal::restore(token, literals));
    }
    if tag.self_closing {
        out.push('/');
    }
    out.push('>');
    out
}

/// Parses one attribute value token.
fn parse_value(token: &str, literals: &[ProtectedLiteral]) -> ArgValue {
    if let Some((index, len)) = literal::parse_placeholder(token) {
        if len == token.len() {
            let text = literals
                .get(index)
                .map(|l| l.text.clone())
                .unwrap_or_default();
            // Quoted numerics coerce to numbers.
            if let Ok(n) = text.parse::<f64>() {
                return ArgValue::Num(n);
            }
            return ArgValue::Str(text);
        }
    }
    if let Some(inner) = strip_interp(token) {
        return ArgValue::Interp {
            expr: inner.0,
            raw: inner.1,
        };
    }
    match token {
        "true" => return ArgValue::Bool(true),
        "false" => return ArgValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = token.parse::<f64>() {
        return ArgValue::Num(n);
    }
    ArgValue::Ref(token.to_string())
}

fn strip_interp(token: &str) -> Option<(String, bool)> {
    if token.starts_with("{{{") && token.ends_with("}}}") && token.len() >= 6 {
        return Some((token[3..token.len() - 3].to_string(), true));
    }
    if token.starts_with("{{") && token.ends_with("}}") && token.len() >= 4 {
        return Some((token[2..token.len() - 2].to_string(), false));
    }
    None
}

/// Parses function/component attributes: `key=value`, bare positional
/// values, and `k1=k2=value` multi-assignment.
fn parse_args(attrs: &str, literals: &[ProtectedLiteral]) -> ArgList {
    let mut list = ArgList::default();
    let mut index = 0usize;

    for token in attrs.split_whitespace() {
        if token.starts_with("{{") {
            list.entries
                .push((index.to_string(), parse_value(token, literals)));
            index += 1;
            continue;
        }

        let segments: Vec<&str> = token.split('=').collect();
        if segments.len() >= 2 && !segments[0].is_empty() {
            let value = parse_value(segments[segments.len() - 1], literals);
            for key in &segments[..segments.len() - 1] {
                let key = match literal::parse_placeholder(key) {
                    Some((i, len)) if len == key.len() => literals
                        .get(i)
                        .map(|l| l.text.clone())
                        .unwrap_or_default(),
                    _ => key.to_string(),
                };
                list.entries.push((key, value.clone()));
            }
        } else {
            list.entries
                .push((index.to_string(), parse_value(token, literals)));
            index += 1;
        }
    }
    list
}

/// Tokenizes `_if`-family attributes into positional comparison tokens.
/// Operators become standalone `Ref` tokens; `!x`/`!!x` stay attached to
/// their operand.
fn parse_condition_args(attrs: &str, literals: &[ProtectedLiteral]) -> ArgList {
    let mut tokens: Vec<String> = Vec::new();
    let mut word = String::new();
    let bytes = attrs.as_bytes();
    let mut i = 0;

    let mut flush = |word: &mut String, tokens: &mut Vec<String>| {
        if !word.is_empty() {
            tokens.push(std::mem::take(word));
        }
    };

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => {
                flush(&mut word, &mut tokens);
                i += 1;
            }
            b'&' | b'|' => {
                flush(&mut word, &mut tokens);
                tokens.push((b as char).to_string());
                // Doubled forms collapse to one combinator.
                while bytes.get(i + 1) == Some(&b) {
                    i += 1;
                }
                i += 1;
            }
            b'=' => {
                flush(&mut word, &mut tokens);
                tokens.push("=".to_string());
                i += 1;
            }
            b'<' | b'>' => {
                flush(&mut word, &mut tokens);
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(format!("{}=", b as char));
                    i += 2;
                } else {
                    tokens.push((b as char).to_string());
                    i += 1;
                }
            }
            b'!' if word.is_empty() && bytes.get(i + 1) == Some(&b'=') => {
                flush(&mut word, &mut tokens);
                tokens.push("!=".to_string());
                i += 2;
            }
            _ => {
                let ch = attrs[i..].chars().next().unwrap_or(' ');
                word.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    flush(&mut word, &mut tokens);

    let mut list = ArgList::default();
    for (index, token) in tokens.into_iter().enumerate() {
        let value = match token.as_str() {
            "=" | "!=" | "<=" | ">=" | "<" | ">" | "&" | "|" => ArgValue::Ref(token),
            _ => parse_value(&token, literals),
        };
        list.entries.push((index.to_string(), value));
    }
    list
}
