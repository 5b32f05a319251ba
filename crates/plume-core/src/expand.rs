//! Macro expansion engine.
//!
//! Expansion walks one nesting level of the node tree at a time. Within a
//! sibling list the phases run in a fixed order (function tags with a
//! body, component tags with a body, self-closing components, then
//! self-closing functions) while the results splice back in original
//! textual order.
//! Deeper levels are driven recursively by whatever each tag chooses to
//! expand, so an untaken branch never runs.
//!
//! After the tree has been flattened to text, the final passes run:
//! variable interpolation, literal restore, guard decoding and raw-block
//! reinsertion.

use crate::ctx;
use crate::literal::{self, ProtectedLiteral};
use crate::parser::{ArgValue, Document, Node, NodeId, TagKind};
use crate::registry::{Invocation, Registry, TagOutput};
use crate::{Diagnostic, escape_attr, escape_html};
use serde_json::{Map, Value};
use std::cell::Cell;
use std::sync::Arc;

/// Resolves component names to compiled documents. The engine backs this
/// with its cache; a missing component is not an error.
pub trait ComponentSource {
    fn load(&self, name: &str) -> Option<Arc<Document>>;
}

/// A source with no components; every lookup misses.
pub struct NullComponents;

impl ComponentSource for NullComponents {
    fn load(&self, _name: &str) -> Option<Arc<Document>> {
        None
    }
}

/// Maximum component-inside-component depth before expansion gives up on a
/// branch. Guards against self-including templates.
const MAX_COMPONENT_DEPTH: usize = 64;

pub struct Expander<'a> {
    registry: &'a Registry,
    components: &'a dyn ComponentSource,
    depth: Cell<usize>,
}

impl<'a> Expander<'a> {
    pub fn new(registry: &'a Registry, components: &'a dyn ComponentSource) -> Self {
        Self {
            registry,
            components,
            depth: Cell::new(0),
        }
    }

    /// Renders a whole document: expansion plus the final passes. The
    /// output contains no placeholders and no unresolved `{{...}}`.
    ///
    /// Interpolation happens as text is emitted, so markers inside an
    /// `each` copy see that copy's bindings; a marker is never rescanned
    /// after its value is spliced in.
    pub fn render_document(
        &self,
        doc: &Document,
        ctx: &Map<String, Value>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> String {
        diagnostics.extend(doc.diagnostics.iter().cloned());
        let html = self.expand_nodes(doc, &doc.roots, ctx, diagnostics);
        reinsert_blocks(&html, doc)
    }

    /// Renders a document that receives merged body content: components
    /// with a body, and layouts receiving the page. The body lands at the
    /// first matching insertion point: explicit slot, then the structural
    /// fallbacks, then prepending.
    pub fn render_with_body(
        &self,
        doc: &Document,
        ctx: &Map<String, Value>,
        body: Option<&str>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> String {
        let slot = find_slot(doc);
        let mut ctx = ctx.clone();
        if slot == Slot::Var {
            ctx.insert(
                "body".to_string(),
                Value::String(body.unwrap_or_default().to_string()),
            );
        }
        let html = self.render_document(doc, &ctx, diagnostics);
        match (body, slot) {
            (None, _) | (_, Slot::Var) => html,
            (Some(body), Slot::BodyTag) => replace_body_tag(&html, body),
            (Some(body), Slot::None) => merge_body(&html, body),
        }
    }

    fn expand_nodes(
        &self,
        doc: &Document,
        ids: &[NodeId],
        ctx: &Map<String, Value>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> String {
        enum Segment {
            Done(String),
            Pending(NodeId),
        }

        let mut segments: Vec<Segment> = ids.iter().map(|&id| Segment::Pending(id)).collect();

        let phases: [fn(&Node) -> bool; 4] = [
            |n| matches!(n, Node::Tag { kind: TagKind::Function, self_closing: false, .. }),
            |n| matches!(n, Node::Tag { kind: TagKind::Component, self_closing: false, .. }),
            |n| matches!(n, Node::Tag { kind: TagKind::Component, self_closing: true, .. }),
            |n| matches!(n, Node::Tag { kind: TagKind::Function, self_closing: true, .. }),
        ];

        for (index, phase) in phases.iter().enumerate() {
            for segment in segments.iter_mut() {
                let Segment::Pending(id) = *segment else {
                    continue;
                };
                if !phase(doc.node(id)) {
                    continue;
                }
                let html = if index == 0 || index == 3 {
                    self.run_function(doc, id, ctx, diagnostics)
                } else {
                    self.run_component(doc, id, ctx, diagnostics)
                };
                *segment = Segment::Done(html);
            }
        }

        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Done(html) => out.push_str(&html),
                Segment::Pending(id) => match doc.node(id) {
                    Node::Text(text) => {
                        out.push_str(&interpolate(text, ctx, &doc.literals))
                    }
                    Node::RawBlock(index) => out.push_str(&format!("%!b{index}!%")),
                    Node::Tag { .. } => {}
                },
            }
        }
        out
    }

    fn run_function(
        &self,
        doc: &Document,
        id: NodeId,
        ctx: &Map<String, Value>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> String {
        let Node::Tag {
            name,
            args,
            children,
            self_closing,
            level,
            ..
        } = doc.node(id)
        else {
            return String::new();
        };

        let plain = name.strip_prefix('_').unwrap_or(name);
        let invocation = Invocation {
            args,
            body: if *self_closing {
                None
            } else {
                Some(children.as_slice())
            },
            doc,
            level: level + 1,
        };

        // Candidate lists run in order; the first non-empty output wins.
        // Unknown names expand to nothing.
        for func in self.registry.resolve(plain) {
            let output = func(&invocation, ctx);
            if !output.is_none() {
                return self.apply_output(doc, output, ctx, diagnostics);
            }
        }
        String::new()
    }

    fn apply_html(&self, doc: &Document, html: &str, ctx: &Map<String, Value>) -> String {
        interpolate(html, ctx, &doc.literals)
    }

    fn apply_output(
        &self,
        doc: &Document,
        output: TagOutput,
        ctx: &Map<String, Value>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> String {
        match output {
            TagOutput::None => String::new(),
            TagOutput::Html(html) => self.apply_html(doc, &html, ctx),
            TagOutput::Nodes(ids) => self.expand_nodes(doc, &ids, ctx, diagnostics),
            TagOutput::Repeat(copies) => {
                let mut out = String::new();
                for (ids, overlay) in copies {
                    let mut scoped = ctx.clone();
                    for (key, value) in overlay {
                        scoped.insert(key, value);
                    }
                    out.push_str(&self.expand_nodes(doc, &ids, &scoped, diagnostics));
                }
                out
            }
        }
    }

    fn run_component(
        &self,
        doc: &Document,
        id: NodeId,
        ctx: &Map<String, Value>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> String {
        let Node::Tag {
            name,
            args,
            children,
            self_closing,
            ..
        } = doc.node(id)
        else {
            return String::new();
        };

        let Some(component) = self.components.load(name) else {
            diagnostics.push(Diagnostic::warn(
                "missing_component",
                format!("component '{}' not found", name),
            ));
            return String::new();
        };

        if self.depth.get() >= MAX_COMPONENT_DEPTH {
            diagnostics.push(Diagnostic::warn(
                "component_depth",
                format!("component '{}' nested too deeply", name),
            ));
            return String::new();
        }

        let mut scoped = ctx.clone();
        apply_component_args(&mut scoped, args.entries.as_slice(), ctx, &doc.literals);

        // The body expands first, with the caller's context.
        let body = (!self_closing)
            .then(|| self.expand_nodes(doc, children, ctx, diagnostics));

        self.depth.set(self.depth.get() + 1);
        let html = self.render_with_body(&component, &scoped, body.as_deref(), diagnostics);
        self.depth.set(self.depth.get() - 1);
        html
    }
}

/// Component attributes become context overlays for the component's own
/// expansion: `key=value` binds the key, a bare positional value becomes a
/// boolean flag, and `{{ref}}` values resolve against the caller context.
fn apply_component_args(
    scoped: &mut Map<String, Value>,
    entries: &[(String, ArgValue)],
    caller: &Map<String, Value>,
    literals: &[ProtectedLiteral],
) {
    for (key, value) in entries {
        let positional = key.parse::<usize>().is_ok();
        match value {
            ArgValue::Interp { expr, raw } => {
                if let Some((name, reference)) = expr.split_once('=') {
                    let resolved = ctx::lookup(caller, reference, literals)
                        .map(|v| interp_value(v, *raw))
                        .unwrap_or(Value::Null);
                    let name = if name.is_empty() { infer_name(reference, literals) } else { name.to_string() };
                    scoped.insert(name, resolved);
                } else {
                    let resolved = ctx::lookup_string(caller, expr, literals);
                    if positional {
                        // A bare `{{flag}}` argument names an option to switch on.
                        if let Some((k, v)) = resolved.split_once('=') {
                            scoped.insert(k.to_string(), Value::String(v.to_string()));
                        } else if !resolved.is_empty() {
                            scoped.insert(resolved, Value::Bool(true));
                        }
                    } else {
                        let resolved = if *raw {
                            resolved
                        } else {
                            escape_attr(&resolved)
                        };
                        scoped.insert(key.clone(), Value::String(resolved));
                    }
                }
            }
            _ if positional => {
                let name = value.display();
                if !name.is_empty() {
                    scoped.insert(name, Value::Bool(true));
                }
            }
            ArgValue::Str(s) => {
                scoped.insert(key.clone(), Value::String(s.clone()));
            }
            ArgValue::Num(n) => {
                let number = serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                scoped.insert(key.clone(), number);
            }
            ArgValue::Bool(b) => {
                scoped.insert(key.clone(), Value::Bool(*b));
            }
            ArgValue::Ref(s) => {
                scoped.insert(key.clone(), Value::String(s.clone()));
            }
        }
    }
}

fn interp_value(value: Value, raw: bool) -> Value {
    if raw {
        return value;
    }
    match value {
        Value::String(s) => Value::String(escape_attr(&s)),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// body/layout merging

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// `{{body}}` / `{{{body}}}` placeholder, filled through the context.
    Var,
    /// Self-closing `<body/>` placeholder, replaced textually.
    BodyTag,
    None,
}

fn find_slot(doc: &Document) -> Slot {
    for node in &doc.nodes {
        let Node::Text(text) = node else { continue };
        if has_var_slot(text) {
            return Slot::Var;
        }
        let lower = text.to_ascii_lowercase();
        if lower.contains("<body/>") || lower.contains("<body />") {
            return Slot::BodyTag;
        }
    }
    Slot::None
}

fn has_var_slot(text: &str) -> bool {
    let mut rest = text;
    while let Some(pos) = rest.find("{{") {
        let tail = &rest[pos..];
        let (open, close): (usize, &str) = if tail.starts_with("{{{") {
            (3, "}}}")
        } else {
            (2, "}}")
        };
        match tail[open..].find(close) {
            Some(end) => {
                if tail[open..open + end].trim().eq_ignore_ascii_case("body") {
                    return true;
                }
                rest = &tail[open + end + close.len()..];
            }
            None => return false,
        }
    }
    false
}

fn replace_body_tag(html: &str, body: &str) -> String {
    let lower = html.to_ascii_lowercase();
    for tag in ["<body/>", "<body />"] {
        if let Some(pos) = lower.find(tag) {
            let mut out = String::with_capacity(html.len() + body.len());
            out.push_str(&html[..pos]);
            out.push_str(body);
            out.push_str(&html[pos + tag.len()..]);
            return out;
        }
    }
    merge_body(html, body)
}

/// Inserts body content into a template that carries no explicit slot:
/// after an opening `<main>`, else after `</header>`, else before
/// `<footer`, else before `</body>`, else prepended.
pub fn merge_body(html: &str, body: &str) -> String {
    let lower = html.to_ascii_lowercase();

    if let Some(pos) = lower.find("<main") {
        if let Some(end) = lower[pos..].find('>') {
            return splice(html, pos + end + 1, body);
        }
    }
    if let Some(pos) = lower.find("</header>") {
        return splice(html, pos + "</header>".len(), body);
    }
    if let Some(pos) = lower.find("<footer") {
        return splice(html, pos, body);
    }
    if let Some(pos) = lower.find("</body>") {
        return splice(html, pos, body);
    }
    format!("{body}{html}")
}

fn splice(html: &str, at: usize, body: &str) -> String {
    let mut out = String::with_capacity(html.len() + body.len());
    out.push_str(&html[..at]);
    out.push_str(body);
    out.push_str(&html[at..]);
    out
}

// ---------------------------------------------------------------------------
// final passes

/// Resolves `{{expr}}` (escaped), `{{{expr}}}` (raw) and the
/// `{{name=expr}}` attribute re-emission form. Unresolved expressions
/// produce nothing, so re-running the pass is a no-op.
pub fn interpolate(text: &str, ctx: &Map<String, Value>, literals: &[ProtectedLiteral]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("{{") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let (open, close): (usize, &str) = if tail.starts_with("{{{") {
            (3, "}}}")
        } else {
            (2, "}}")
        };
        let raw = open == 3;
        let Some(end) = tail[open..].find(close) else {
            out.push_str(tail);
            return out;
        };
        let inner = &tail[open..open + end];
        out.push_str(&resolve_marker(inner, raw, ctx, literals));
        rest = &tail[open + end + close.len()..];
    }
    out.push_str(rest);
    out
}

fn resolve_marker(
    inner: &str,
    raw: bool,
    ctx: &Map<String, Value>,
    literals: &[ProtectedLiteral],
) -> String {
    if let Some((name, expr)) = inner.split_once('=') {
        let name = name.trim();
        let name = if name.is_empty() {
            infer_name(expr, literals)
        } else {
            name.to_string()
        };
        let value = ctx::lookup_string(ctx, expr, literals);
        if name.is_empty() || value.is_empty() {
            return String::new();
        }
        if raw {
            return format!("{name}=\"{value}\"");
        }
        return format!("{name}=\"{}\"", escape_attr(&value));
    }

    let value = ctx::lookup_string(ctx, inner, literals);
    if raw {
        value
    } else {
        escape_html(&value)
    }
}

/// Infers an attribute name from the last path segment of the first
/// fallback alternative.
fn infer_name(expr: &str, literals: &[ProtectedLiteral]) -> String {
    let first = expr.split('|').next().unwrap_or("").trim();
    let last = first.rsplit('.').next().unwrap_or("");
    let last = last.split('[').next().unwrap_or("");
    literal::restore_bare(last, literals)
}

fn reinsert_blocks(text: &str, doc: &Document) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("%!b") {
        out.push_str(&rest[..pos]);
        match crate::rawblock::parse_marker(&rest[pos..]) {
            Some((index, len)) => {
                if let Some(block) = doc.blocks.get(index) {
                    out.push_str(&block.render());
                }
                rest = &rest[pos + len..];
            }
            None => {
                out.push_str("%!b");
                rest = &rest[pos + 3..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::compile_source;
    use crate::rawblock::DefaultConverters;
    use crate::registry::Registry;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapComponents {
        docs: HashMap<String, Arc<Document>>,
    }

    impl MapComponents {
        fn new(entries: &[(&str, &str)]) -> Self {
            let docs = entries
                .iter()
                .map(|(name, src)| {
                    let doc = compile_source(src, &DefaultConverters).unwrap();
                    (name.to_string(), Arc::new(doc))
                })
                .collect();
            Self { docs }
        }
    }

    impl ComponentSource for MapComponents {
        fn load(&self, name: &str) -> Option<Arc<Document>> {
            self.docs.get(name).cloned()
        }
    }

    fn render(src: &str, ctx: Value) -> String {
        render_with(src, ctx, &NullComponents)
    }

    fn render_with(src: &str, ctx: Value, components: &dyn ComponentSource) -> String {
        let doc = compile_source(src, &DefaultConverters).unwrap();
        let registry = Registry::with_builtins();
        let expander = Expander::new(&registry, components);
        let Value::Object(map) = ctx else { panic!("object expected") };
        let mut diagnostics = Vec::new();
        expander.render_document(&doc, &map, &mut diagnostics)
    }

    #[test]
    fn test_passthrough_document_is_stable() {
        let src = "<html><body><p class=\"a\">hello</p></body></html>";
        assert_eq!(render(src, json!({})), src);
    }

    #[test]
    fn test_interpolation_escapes_by_default() {
        let out = render("<p>{{name}}</p>", json!({"name": "<b>amy</b>"}));
        assert_eq!(out, "<p>&lt;b&gt;amy&lt;/b&gt;</p>");
        let out = render("<p>{{{name}}}</p>", json!({"name": "<b>amy</b>"}));
        assert_eq!(out, "<p><b>amy</b></p>");
    }

    #[test]
    fn test_interpolation_is_idempotent() {
        let out = render("{{a}} {{{b}}} {{missing}}", json!({"a": "1", "b": "2"}));
        assert!(!out.contains("{{"));
        assert_eq!(interpolate(&out, &Map::new(), &[]), out);
    }

    #[test]
    fn test_attribute_assignment_marker() {
        let out = render("<a {{href=link}}>x</a>", json!({"link": "/y"}));
        assert_eq!(out, "<a href=\"/y\">x</a>");

        // Name inferred from the last path segment.
        let out = render("<a {{=user.href}}>x</a>", json!({"user": {"href": "/u"}}));
        assert_eq!(out, "<a href=\"/u\">x</a>");

        let out = render("<a {{href=missing}}>x</a>", json!({}));
        assert_eq!(out, "<a >x</a>");
    }

    #[test]
    fn test_each_renders_three_copies_in_order() {
        let out = render(
            "<_each list as v><i>{{v}}</i></_each>",
            json!({"list": [1, 2, 3]}),
        );
        assert_eq!(out, "<i>1</i><i>2</i><i>3</i>");
    }

    #[test]
    fn test_untaken_branch_never_expands() {
        // The unknown component inside the false branch must not be
        // reported as missing.
        let doc = compile_source("<_if x><Ghost/></_if>", &DefaultConverters).unwrap();
        let registry = Registry::with_builtins();
        let expander = Expander::new(&registry, &NullComponents);
        let mut diagnostics = Vec::new();
        let out = expander.render_document(
            &doc,
            &Map::new(),
            &mut diagnostics,
        );
        assert_eq!(out, "");
        assert!(diagnostics.iter().all(|d| d.code != "missing_component"));
    }

    #[test]
    fn test_unknown_function_and_component_are_empty() {
        assert_eq!(render("a<_nope 1 2>x</_nope>b", json!({})), "ab");
        assert_eq!(render("a<Ghost/>b", json!({})), "ab");
    }

    #[test]
    fn test_component_with_var_slot() {
        let components = MapComponents::new(&[("Card", "<div class=\"card\">{{{body}}}</div>")]);
        let out = render_with("<Card><b>hi</b></Card>", json!({}), &components);
        assert_eq!(out, "<div class=\"card\"><b>hi</b></div>");
    }

    #[test]
    fn test_component_args_become_context() {
        let components = MapComponents::new(&[("Title", "<h1>{{text}}</h1>")]);
        let out = render_with("<Title text=\"Hello\"/>", json!({}), &components);
        assert_eq!(out, "<h1>Hello</h1>");
    }

    #[test]
    fn test_component_interp_arg_resolves_from_caller() {
        let components = MapComponents::new(&[("Title", "<h1>{{text}}</h1>")]);
        let out = render_with(
            "<Title text={{{heading}}}/>",
            json!({"heading": "Big"}),
            &components,
        );
        assert_eq!(out, "<h1>Big</h1>");
    }

    #[test]
    fn test_component_structural_merge_after_main() {
        let components =
            MapComponents::new(&[("Page", "<main class=\"m\"></main><footer>f</footer>")]);
        let out = render_with("<Page>content</Page>", json!({}), &components);
        assert_eq!(out, "<main class=\"m\">content</main><footer>f</footer>");
    }

    #[test]
    fn test_component_merge_prepends_without_regions() {
        let components = MapComponents::new(&[("Bare", "<hr>")]);
        let out = render_with("<Bare>top</Bare>", json!({}), &components);
        assert_eq!(out, "top<hr>");
    }

    #[test]
    fn test_merge_body_fallback_order() {
        assert_eq!(merge_body("<header>h</header><p>t</p>", "B"), "<header>h</header>B<p>t</p>");
        assert_eq!(merge_body("<p>t</p><footer>f</footer>", "B"), "<p>t</p>B<footer>f</footer>");
        assert_eq!(merge_body("<body><p>t</p></body>", "B"), "<body><p>t</p>B</body>");
    }

    #[test]
    fn test_self_including_component_is_cut_off() {
        let components = MapComponents::new(&[("Loop", "<i>x</i><Loop/>")]);
        let out = render_with("<Loop/>", json!({}), &components);
        assert!(out.len() < 10_000);
        assert!(out.starts_with("<i>x</i>"));
    }

    #[test]
    fn test_raw_block_survives_expansion() {
        let out = render(
            "<_if x><script>let a = 1;</script></_if>",
            json!({"x": true}),
        );
        assert_eq!(out, "<script>let a = 1;</script>");
    }

    #[test]
    fn test_literals_restored_in_output() {
        let out = render("<p>say \"hi\" // not a comment</p>", json!({}));
        assert_eq!(out, "<p>say \"hi\" // not a comment</p>");
    }
}
