//! plume core crate.
//!
//! This crate intentionally separates compilation concerns into layers:
//!
//! - `literal`: quoted-string and comment protection so later stages never
//!   misparse tag delimiters inside literal text.
//! - `rawblock`: bodily extraction of `script`/`style`/`markdown`/`text`
//!   blocks and dispatch to pluggable content converters.
//! - `parser`: the tag scanner that produces a nesting-aware node tree with
//!   per-tag argument tables.
//! - `expand`: the macro expansion engine: four fixed phases per nesting
//!   level, lazy body evaluation, component merging, and the final
//!   interpolation pass.
//! - `registry` + `funcs`: the extensible tag-function registry and the
//!   built-in `if`/`each`/`json`/`lorem` family.
//! - `ctx`: context lookup with fallback paths and bracket indirection.
//!
//! The critical design rule is that expansion never evaluates a tag body
//! before the owning function decides to: conditionals and loops choose
//! whether and how many times a body runs, so an untaken branch has no
//! observable effect.

pub mod ctx;
pub mod expand;
pub mod funcs;
pub mod literal;
pub mod parser;
pub mod rawblock;
pub mod registry;

pub use ctx::{is_truthy, lookup, lookup_string};
pub use expand::{ComponentSource, Expander, NullComponents, merge_body};
pub use literal::ProtectedLiteral;
pub use parser::{ArgList, ArgValue, Document, Node, NodeId, TagKind, compile_source};
pub use rawblock::{BlockConverter, DefaultConverters, RawBlock, RawKind};
pub use registry::{Binding, Invocation, Registry, TagFn, TagOutput};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

/// Soft condition collected during compilation or expansion. Diagnostics
/// never fail a render; callers decide whether to surface them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    pub fn warn(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warn,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Escapes `&`, `<` and `>` for HTML body text.
pub fn escape_html(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for ch in src.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escapes text destined for a double-quoted HTML attribute value.
pub fn escape_attr(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for ch in src.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub(crate) fn format_f64(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_escape_attr_quotes() {
        assert_eq!(escape_attr(r#"say "hi""#), "say &quot;hi&quot;");
    }
}
