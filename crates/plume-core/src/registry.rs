//! Tag function registry.
//!
//! An explicit registry value, constructed once at startup and threaded by
//! reference through expansion. Names are normalized case-insensitively
//! with `-`/`_` stripped, so `lorem-ipsum`, `LoremIpsum` and `lorem_ipsum`
//! all address one binding. The first registration for a normalized name
//! wins; later registrations are ignored.

use crate::parser::{ArgList, Document, NodeId};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One tag-function call site, handed to the implementation unevaluated.
/// `body` is `None` for self-closing tags; when present it is the raw,
/// unexpanded child list, and the implementation decides whether and how
/// often the body runs.
pub struct Invocation<'a> {
    pub args: &'a ArgList,
    pub body: Option<&'a [NodeId]>,
    pub doc: &'a Document,
    /// Nesting level the replacement content expands at.
    pub level: usize,
}

/// What a tag function hands back to the expander.
pub enum TagOutput {
    /// Nothing; the tag contributes no output.
    None,
    /// Scalar replacement text, subject to the final interpolation pass.
    Html(String),
    /// A chosen subset of the body, expanded with the caller's context.
    Nodes(Vec<NodeId>),
    /// Body copies, each expanded with its own context overlay.
    Repeat(Vec<(Vec<NodeId>, Map<String, Value>)>),
}

impl TagOutput {
    pub fn is_none(&self) -> bool {
        matches!(self, TagOutput::None)
    }
}

pub type TagFn = fn(&Invocation, &Map<String, Value>) -> TagOutput;

/// How a registered name dispatches.
pub enum Binding {
    Direct(TagFn),
    /// One-level indirection to another registered name.
    Alias(String),
    /// Tried in order; the first non-empty output wins.
    Candidates(Vec<TagFn>),
}

pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Default)]
pub struct Registry {
    bindings: HashMap<String, Binding>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tag set: the `if`/`elif`/`else` chain, `each`, `json`
    /// and the lorem text generators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::funcs::register_builtins(&mut registry);
        registry
    }

    /// Binds `names[0]` to `binding` and every further name as an alias of
    /// the first. Returns false when the primary name was already taken.
    pub fn register(&mut self, names: &[&str], binding: Binding) -> bool {
        let Some(primary) = names.first().map(|n| normalize_name(n)) else {
            return false;
        };
        if self.bindings.contains_key(&primary) {
            return false;
        }
        self.bindings.insert(primary.clone(), binding);

        for name in &names[1..] {
            let alias = normalize_name(name);
            self.bindings
                .entry(alias)
                .or_insert_with(|| Binding::Alias(primary.clone()));
        }
        true
    }

    /// Resolves a tag name to its candidate implementations, dereferencing
    /// at most one alias level. Unknown names resolve to no candidates.
    pub fn resolve(&self, name: &str) -> Vec<TagFn> {
        let mut binding = self.bindings.get(&normalize_name(name));
        if let Some(Binding::Alias(target)) = binding {
            binding = self.bindings.get(target);
        }
        match binding {
            Some(Binding::Direct(f)) => vec![*f],
            Some(Binding::Candidates(fns)) => fns.clone(),
            Some(Binding::Alias(_)) | None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yes(_: &Invocation, _: &Map<String, Value>) -> TagOutput {
        TagOutput::Html("yes".into())
    }

    fn no(_: &Invocation, _: &Map<String, Value>) -> TagOutput {
        TagOutput::None
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_name("Lorem-Ipsum"), "loremipsum");
        assert_eq!(normalize_name("_if"), "if");
    }

    #[test]
    fn test_first_registration_wins() {
        let mut r = Registry::new();
        assert!(r.register(&["mark"], Binding::Direct(yes)));
        assert!(!r.register(&["mark"], Binding::Direct(no)));
        assert_eq!(r.resolve("mark").len(), 1);
    }

    #[test]
    fn test_alias_list_registration() {
        let mut r = Registry::new();
        r.register(&["one", "uno", "ein"], Binding::Direct(yes));
        assert_eq!(r.resolve("UNO").len(), 1);
        assert_eq!(r.resolve("ein").len(), 1);
    }

    #[test]
    fn test_string_alias_dereferences_one_level() {
        let mut r = Registry::new();
        r.register(&["base"], Binding::Direct(yes));
        r.register(&["other"], Binding::Alias("base".into()));
        assert_eq!(r.resolve("other").len(), 1);

        // A second alias hop does not resolve.
        r.register(&["far"], Binding::Alias("other".into()));
        assert!(r.resolve("far").is_empty());
    }

    #[test]
    fn test_candidates_order() {
        let mut r = Registry::new();
        r.register(&["pick"], Binding::Candidates(vec![no, yes]));
        assert_eq!(r.resolve("pick").len(), 2);
    }

    #[test]
    fn test_unknown_resolves_empty() {
        assert!(Registry::new().resolve("ghost").is_empty());
    }
}
