//! Literal protection.
//!
//! Quoted strings are moved into a side table and replaced with `%!s{i}!%`
//! placeholders so the tag parser never sees quote or delimiter characters
//! inside literal text. Comments are dropped in the same pass. Source text
//! that happens to contain the placeholder delimiters themselves is
//! guard-encoded up front (`%!` -> `%!o!%`, `!%` -> `%!c!%`) and decoded as
//! the very last output step, so user content cannot collide with internal
//! placeholders.
//!
//! Nothing in this pass errors: an unterminated quote or comment is left in
//! place as ordinary text.

/// A protected string literal. `delimiter` is the quote byte that wrapped
/// the text in the source (`"`, `'` or a backtick).
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedLiteral {
    pub delimiter: u8,
    pub text: String,
}

/// Encodes raw occurrences of the placeholder delimiters.
pub fn encode_guards(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() && bytes[i + 1] == b'!' {
            out.push_str("%!o!%");
            i += 2;
        } else if bytes[i] == b'!' && i + 1 < bytes.len() && bytes[i + 1] == b'%' {
            out.push_str("%!c!%");
            i += 2;
        } else {
            let ch = src[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

/// Reverses [`encode_guards`].
pub fn decode_guards(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(pos) = rest.find("%!") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%!o!%") {
            out.push_str("%!");
            rest = &tail[5..];
        } else if tail.starts_with("%!c!%") {
            out.push_str("!%");
            rest = &tail[5..];
        } else {
            out.push_str("%!");
            rest = &tail[2..];
        }
    }
    out.push_str(rest);
    out
}

fn placeholder(index: usize) -> String {
    format!("%!s{index}!%")
}

/// Parses a `%!s{i}!%` token at the start of `text`, returning the index
/// and the token length.
pub fn parse_placeholder(text: &str) -> Option<(usize, usize)> {
    let rest = text.strip_prefix("%!s")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let after = &rest[digits.len()..];
    if !after.starts_with("!%") {
        return None;
    }
    Some((digits.parse().ok()?, 3 + digits.len() + 2))
}

/// Extracts quoted strings into the literal table and strips comments.
///
/// Expects guard-encoded input (see [`encode_guards`]). Returns the
/// placeholder-bearing text plus the table.
pub fn protect(src: &str) -> (String, Vec<ProtectedLiteral>) {
    let mut out = String::with_capacity(src.len());
    let mut literals = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    // True once anything other than whitespace has been emitted on the
    // current line; a `//` comment only counts at the start of a line.
    let mut line_has_content = false;

    while i < bytes.len() {
        let b = bytes[i];

        if b == b'"' || b == b'\'' || b == b'`' {
            match scan_quoted(src, i, b) {
                Some(end) => {
                    let inner = unescape_quotes(&src[i + 1..end]);
                    literals.push(ProtectedLiteral {
                        delimiter: b,
                        text: inner,
                    });
                    out.push_str(&placeholder(literals.len() - 1));
                    line_has_content = true;
                    i = end + 1;
                    continue;
                }
                None => {
                    // Unterminated quote: ordinary text.
                    out.push(b as char);
                    line_has_content = true;
                    i += 1;
                    continue;
                }
            }
        }

        if src[i..].starts_with("<!--") {
            if let Some(end) = src[i..].find("-->") {
                i += end + 3;
                continue;
            }
        }

        if src[i..].starts_with("/*") {
            if let Some(end) = src[i..].find("*/") {
                i += end + 2;
                continue;
            }
        }

        if src[i..].starts_with("//") && !line_has_content {
            match src[i..].find('\n') {
                Some(end) => {
                    i += end;
                    continue;
                }
                None => break,
            }
        }

        if b == b'\n' {
            line_has_content = false;
            out.push('\n');
            i += 1;
            continue;
        }

        let ch = src[i..].chars().next().unwrap();
        if !ch.is_whitespace() {
            line_has_content = true;
        }
        out.push(ch);
        i += ch.len_utf8();
    }

    (out, literals)
}

/// Finds the closing quote for the string opened at `start`, honoring
/// backslash escapes. Returns the byte index of the closing quote.
fn scan_quoted(src: &str, start: usize, quote: u8) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn unescape_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next @ ('\\' | '"' | '\'' | '`')) => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Reinserts protected literals with their original quote characters.
pub fn restore(text: &str, literals: &[ProtectedLiteral]) -> String {
    restore_with(text, literals, true)
}

/// Reinserts protected literals without quotes.
pub fn restore_bare(text: &str, literals: &[ProtectedLiteral]) -> String {
    restore_with(text, literals, false)
}

fn restore_with(text: &str, literals: &[ProtectedLiteral], quoted: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("%!s") {
        out.push_str(&rest[..pos]);
        match parse_placeholder(&rest[pos..]) {
            Some((index, len)) => {
                if let Some(lit) = literals.get(index) {
                    if quoted {
                        out.push(lit.delimiter as char);
                        out.push_str(&lit.text);
                        out.push(lit.delimiter as char);
                    } else {
                        out.push_str(&lit.text);
                    }
                }
                rest = &rest[pos + len..];
            }
            None => {
                out.push_str("%!s");
                rest = &rest[pos + 3..];
            }
        }
    }
    out.push_str(rest);
    out
}
