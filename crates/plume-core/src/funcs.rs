//! Built-in tag functions.
//!
//! `if`/`elif`/`else` chains, `each` iteration, `json` serialization and
//! the lorem filler-text family. All of them honor the lazy-body contract:
//! they receive the raw child list and return only the parts that should
//! expand.

use crate::ctx::{self, is_truthy};
use crate::parser::{ArgValue, Node, NodeId, TagKind};
use crate::registry::{Binding, Invocation, Registry, TagOutput, normalize_name};
use serde_json::{Map, Value};

pub fn register_builtins(registry: &mut Registry) {
    registry.register(&["if"], Binding::Direct(tag_if));
    registry.register(&["elif", "elseif"], Binding::Direct(tag_chain_marker));
    registry.register(&["else"], Binding::Direct(tag_chain_marker));
    registry.register(&["each"], Binding::Direct(tag_each));
    registry.register(&["json"], Binding::Direct(tag_json));
    registry.register(&["lorem", "ipsum", "lorem-ipsum", "text"], Binding::Direct(tag_lorem));
    registry.register(&["lorem-p", "p", "paragraph"], Binding::Direct(tag_lorem_p));
    registry.register(&["lorem-s", "s", "sentence"], Binding::Direct(tag_lorem_s));
    registry.register(&["lorem-w", "w", "word"], Binding::Direct(tag_lorem_w));
}

/// `_elif`/`_else` markers are consumed by the owning `_if`; one reached
/// directly contributes nothing.
fn tag_chain_marker(_: &Invocation, _: &Map<String, Value>) -> TagOutput {
    TagOutput::None
}

// ---------------------------------------------------------------------------
// if / elif / else

fn tag_if(inv: &Invocation, ctx: &Map<String, Value>) -> TagOutput {
    let Some(body) = inv.body else {
        return TagOutput::None;
    };
    let args: Vec<ArgValue> = inv.args.positional().cloned().collect();
    evaluate_chain(inv, body, &args, ctx, false)
}

fn evaluate_chain(
    inv: &Invocation,
    body: &[NodeId],
    args: &[ArgValue],
    ctx: &Map<String, Value>,
    unconditional: bool,
) -> TagOutput {
    // An argument-less `if` (and the `else` arm) takes the whole segment;
    // any markers left inside expand to nothing on their own.
    if unconditional || args.is_empty() {
        return TagOutput::Nodes(body.to_vec());
    }

    let marker = body.iter().position(|&id| chain_marker_kind(inv, id).is_some());
    let head = &body[..marker.unwrap_or(body.len())];

    if evaluate_condition(args, ctx, inv) {
        return TagOutput::Nodes(head.to_vec());
    }

    let Some(pos) = marker else {
        return TagOutput::None;
    };
    let (is_else, marker_args) = chain_marker_kind(inv, body[pos]).unwrap();
    evaluate_chain(inv, &body[pos + 1..], &marker_args, ctx, is_else)
}

/// Returns `(is_else, args)` when the node is a self-closing `_elif` or
/// `_else` marker.
fn chain_marker_kind(inv: &Invocation, id: NodeId) -> Option<(bool, Vec<ArgValue>)> {
    match inv.doc.node(id) {
        Node::Tag {
            kind: TagKind::Function,
            name,
            args,
            self_closing: true,
            ..
        } => match name.strip_prefix('_').map(normalize_name).as_deref() {
            Some("else") => Some((true, Vec::new())),
            Some("elif" | "elseif") => Some((false, args.positional().cloned().collect())),
            _ => None,
        },
        _ => None,
    }
}

fn is_comparison_op(value: &ArgValue) -> Option<&str> {
    match value {
        ArgValue::Ref(s)
            if matches!(s.as_str(), "=" | "!=" | "<=" | ">=" | "<" | ">") =>
        {
            Some(s)
        }
        _ => None,
    }
}

/// Left-to-right evaluation with short-circuiting `&`/`|`. A comparison
/// operator with no left-hand token reuses the previously evaluated
/// operand.
fn evaluate_condition(
    tokens: &[ArgValue],
    ctx: &Map<String, Value>,
    inv: &Invocation,
) -> bool {
    let mut result = false;
    let mut last_operand = Value::Null;
    let mut i = 0;

    while i < tokens.len() {
        if let ArgValue::Ref(s) = &tokens[i] {
            if s == "&" {
                if result {
                    i += 1;
                    continue;
                }
                break;
            }
            if s == "|" {
                if result {
                    break;
                }
                i += 1;
                continue;
            }
        }

        if let Some(op) = tokens.get(i + 1).and_then(is_comparison_op) {
            let lhs = resolve_operand(&tokens[i], ctx, inv);
            let rhs = tokens
                .get(i + 2)
                .map(|t| resolve_operand(t, ctx, inv))
                .unwrap_or(Value::Null);
            last_operand = lhs.clone();
            result = compare(op, &lhs, &rhs);
            i += 3;
            continue;
        }

        if let Some(op) = is_comparison_op(&tokens[i]) {
            if let Some(rhs_token) = tokens.get(i + 1) {
                let rhs = resolve_operand(rhs_token, ctx, inv);
                result = compare(op, &last_operand.clone(), &rhs);
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }

        let (value, positive) = resolve_unary(&tokens[i], ctx, inv);
        last_operand = value.clone();
        result = if positive {
            is_truthy(&value)
        } else {
            !is_truthy(&value)
        };
        i += 1;
    }

    result
}

/// Resolves a bare term, peeling `!`/`!!` negation prefixes. Returns the
/// operand value and whether truthiness is read positively.
fn resolve_unary(
    token: &ArgValue,
    ctx: &Map<String, Value>,
    inv: &Invocation,
) -> (Value, bool) {
    match token {
        ArgValue::Ref(s) => {
            let negations = s.chars().take_while(|c| *c == '!').count();
            let name = &s[negations..];
            let value = if name.is_empty() {
                Value::Null
            } else {
                resolve_operand(&ArgValue::Ref(name.to_string()), ctx, inv)
            };
            (value, negations % 2 == 0)
        }
        other => (resolve_operand(other, ctx, inv), true),
    }
}

fn resolve_operand(
    token: &ArgValue,
    ctx: &Map<String, Value>,
    inv: &Invocation,
) -> Value {
    let number = |f: f64| {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    };
    match token {
        ArgValue::Num(n) => number(*n),
        ArgValue::Bool(b) => Value::Bool(*b),
        ArgValue::Str(s) => match s.parse::<f64>() {
            Ok(n) => number(n),
            Err(_) => Value::String(s.clone()),
        },
        ArgValue::Interp { expr, .. } => {
            ctx::lookup(ctx, expr, &inv.doc.literals).unwrap_or(Value::Null)
        }
        ArgValue::Ref(s) => {
            if let Ok(n) = s.parse::<f64>() {
                return number(n);
            }
            match ctx::lookup(ctx, s, &inv.doc.literals) {
                Some(Value::String(text)) => match text.parse::<f64>() {
                    Ok(n) => number(n),
                    Err(_) => Value::String(text),
                },
                Some(v) => v,
                None => Value::Null,
            }
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

fn compare(op: &str, lhs: &Value, rhs: &Value) -> bool {
    match op {
        "=" => values_equal(lhs, rhs),
        "!=" => !values_equal(lhs, rhs),
        _ => {
            if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
                return match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    ">=" => a >= b,
                    _ => false,
                };
            }
            match (as_f64(lhs), as_f64(rhs)) {
                (Some(a), Some(b)) => match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    ">=" => a >= b,
                    _ => false,
                },
                _ => false,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// each

fn tag_each(inv: &Invocation, ctx: &Map<String, Value>) -> TagOutput {
    let Some(body) = inv.body else {
        return TagOutput::None;
    };
    let tokens: Vec<&ArgValue> = inv.args.positional().collect();
    let Some(first) = tokens.first() else {
        return TagOutput::None;
    };
    let collection_expr = first.display();

    let mut as_name: Option<String> = None;
    let mut of_name: Option<String> = None;
    let mut in_name: Option<String> = None;
    let mut pool: Vec<String> = Vec::new();
    let mut pending: Option<u8> = None;

    for token in &tokens[1..] {
        let text = token.display();
        match text.as_str() {
            "as" => pending = Some(1),
            "of" => pending = Some(2),
            "in" => pending = Some(3),
            _ => match pending.take() {
                Some(1) => as_name = Some(text),
                Some(2) => of_name = Some(text),
                Some(3) => in_name = Some(text),
                _ => pool.push(text),
            },
        }
    }
    for text in pool {
        if as_name.is_none() {
            as_name = Some(text);
        } else if of_name.is_none() {
            of_name = Some(text);
        } else if in_name.is_none() {
            in_name = Some(text);
        }
    }

    let value_key = as_name.unwrap_or_else(|| collection_expr.clone());
    let Some(collection) = ctx::lookup(ctx, &collection_expr, &inv.doc.literals) else {
        return TagOutput::None;
    };

    let mut copies: Vec<(Vec<NodeId>, Map<String, Value>)> = Vec::new();
    match collection {
        Value::Array(items) => {
            for (index, item) in items.into_iter().enumerate() {
                let mut overlay = Map::new();
                overlay.insert(value_key.clone(), item);
                if let Some(of) = &of_name {
                    overlay.insert(of.clone(), Value::from(index));
                }
                if let Some(in_key) = &in_name {
                    overlay.insert(in_key.clone(), Value::from(index));
                }
                copies.push((body.to_vec(), overlay));
            }
        }
        Value::Object(map) => {
            for (index, (key, item)) in map.into_iter().enumerate() {
                let mut overlay = Map::new();
                overlay.insert(value_key.clone(), item);
                if let Some(of) = &of_name {
                    overlay.insert(of.clone(), Value::String(key.clone()));
                }
                if let Some(in_key) = &in_name {
                    overlay.insert(in_key.clone(), Value::from(index));
                }
                copies.push((body.to_vec(), overlay));
            }
        }
        _ => return TagOutput::None,
    }

    TagOutput::Repeat(copies)
}

// ---------------------------------------------------------------------------
// json

fn tag_json(inv: &Invocation, ctx: &Map<String, Value>) -> TagOutput {
    let tokens: Vec<&ArgValue> = inv.args.positional().collect();
    let Some(first) = tokens.first() else {
        return TagOutput::None;
    };
    let Some(value) = ctx::lookup(ctx, &first.display(), &inv.doc.literals) else {
        return TagOutput::None;
    };

    let indent = tokens
        .get(1)
        .and_then(|t| match t {
            ArgValue::Num(n) if *n > 0.0 => Some(*n as usize),
            _ => None,
        })
        .unwrap_or(0);
    let compact = tokens[1..]
        .iter()
        .take(2)
        .any(|t| matches!(t, ArgValue::Bool(true)));

    let rendered = if indent > 0 {
        let pad = vec![b' '; indent];
        let formatter = serde_json::ser::PrettyFormatter::with_indent(&pad);
        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        match serde::Serialize::serialize(&value, &mut ser) {
            Ok(()) => String::from_utf8(out).unwrap_or_default(),
            Err(_) => return TagOutput::None,
        }
    } else {
        match serde_json::to_string(&value) {
            Ok(s) => s,
            Err(_) => return TagOutput::None,
        }
    };

    if compact {
        TagOutput::Html(unquote_keys(&rendered))
    } else {
        TagOutput::Html(rendered)
    }
}

/// Rewrites `"key":` as `key:` for identifier-shaped keys.
fn unquote_keys(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let bytes = json.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let Some(quote) = json[i..].find('"').map(|p| i + p) else {
            out.push_str(&json[i..]);
            break;
        };
        out.push_str(&json[i..quote]);

        let mut j = quote + 1;
        while j < bytes.len() && bytes[j] != b'"' {
            if bytes[j] == b'\\' {
                j += 1;
            }
            j += 1;
        }
        if j >= bytes.len() {
            out.push_str(&json[quote..]);
            break;
        }

        let inner = &json[quote + 1..j];
        let mut k = j + 1;
        while k < bytes.len() && bytes[k].is_ascii_whitespace() {
            k += 1;
        }
        if bytes.get(k) == Some(&b':') && is_identifier(inner) {
            out.push_str(inner);
        } else {
            out.push_str(&json[quote..=j]);
        }
        i = j + 1;
    }
    out
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !text.starts_with(|c: char| c.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// lorem

const LOREM_WORDS: [&str; 30] = [
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing",
    "elit", "sed", "do", "eiusmod", "tempor", "incididunt", "ut", "labore",
    "et", "dolore", "magna", "aliqua", "enim", "ad", "minim", "veniam",
    "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi",
    "aliquip",
];

#[derive(Clone, Copy, PartialEq)]
enum LoremMode {
    Paragraphs,
    Sentences,
    Words,
}

fn mode_token(text: &str) -> Option<LoremMode> {
    match text.to_ascii_lowercase().as_str() {
        "w" | "word" | "words" => Some(LoremMode::Words),
        "s" | "sent" | "sentence" | "sentences" => Some(LoremMode::Sentences),
        "p" | "paragraph" | "paragraphs" => Some(LoremMode::Paragraphs),
        _ => None,
    }
}

/// Count semantics: exactly zero yields empty output; anything that does
/// not resolve to a number defaults to one.
fn resolve_count(
    token: Option<&ArgValue>,
    ctx: &Map<String, Value>,
    inv: &Invocation,
) -> Option<usize> {
    let token = match token {
        Some(t) => t,
        None => return Some(1),
    };
    let n = match token {
        ArgValue::Num(n) => Some(*n),
        ArgValue::Bool(_) => None,
        ArgValue::Str(s) => s.parse::<f64>().ok(),
        ArgValue::Ref(s) | ArgValue::Interp { expr: s, .. } => match s.parse::<f64>() {
            Ok(n) => Some(n),
            Err(_) => ctx::lookup(ctx, s, &inv.doc.literals).and_then(|v| as_f64(&v)),
        },
    };
    match n {
        Some(n) if n == 0.0 => None,
        Some(n) if n > 0.0 => Some(n as usize),
        _ => Some(1),
    }
}

fn tag_lorem(inv: &Invocation, ctx: &Map<String, Value>) -> TagOutput {
    let tokens: Vec<&ArgValue> = inv.args.positional().collect();

    let mut mode = LoremMode::Paragraphs;
    let mut count_token = tokens.first().copied();
    if let Some(m) = tokens.first().and_then(|t| mode_token(&t.display())) {
        mode = m;
        count_token = tokens.get(1).copied();
    } else if let Some(m) = tokens.get(1).and_then(|t| mode_token(&t.display())) {
        mode = m;
        count_token = tokens.first().copied();
    }

    let Some(count) = resolve_count(count_token, ctx, inv) else {
        return TagOutput::Html(String::new());
    };
    TagOutput::Html(generate(mode, count))
}

fn tag_lorem_p(inv: &Invocation, ctx: &Map<String, Value>) -> TagOutput {
    lorem_fixed(inv, ctx, LoremMode::Paragraphs)
}

fn tag_lorem_s(inv: &Invocation, ctx: &Map<String, Value>) -> TagOutput {
    lorem_fixed(inv, ctx, LoremMode::Sentences)
}

fn tag_lorem_w(inv: &Invocation, ctx: &Map<String, Value>) -> TagOutput {
    lorem_fixed(inv, ctx, LoremMode::Words)
}

fn lorem_fixed(inv: &Invocation, ctx: &Map<String, Value>, mode: LoremMode) -> TagOutput {
    let tokens: Vec<&ArgValue> = inv.args.positional().collect();
    let Some(count) = resolve_count(tokens.first().copied(), ctx, inv) else {
        return TagOutput::Html(String::new());
    };
    TagOutput::Html(generate(mode, count))
}

fn generate(mode: LoremMode, count: usize) -> String {
    match mode {
        LoremMode::Words => words(0, count),
        LoremMode::Sentences => sentences(0, count),
        LoremMode::Paragraphs => (0..count)
            .map(|p| format!("<p>{}</p>", sentences(p * 4, 4)))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn words(offset: usize, count: usize) -> String {
    (0..count)
        .map(|i| LOREM_WORDS[(offset + i) % LOREM_WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

fn sentences(offset: usize, count: usize) -> String {
    (0..count)
        .map(|i| {
            let length = 6 + (offset + i) * 3 % 7;
            let body = words((offset + i) * 5, length);
            let mut chars = body.chars();
            let first = chars.next().map(|c| c.to_ascii_uppercase()).unwrap_or('L');
            format!("{}{}.", first, chars.as_str())
        })
        .collect::<Vec<_>>()
        .join(" ")
}
