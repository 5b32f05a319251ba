//! Render-context lookup.
//!
//! An expression is a `|`-separated list of fallback alternatives. Each
//! alternative is a `.`-separated key chain; a `[seg]` segment is a quoted
//! literal key, a numeric index, or an indirect lookup of the bracketed
//! name. The first alternative that resolves to a defined, non-null value
//! wins. Lookup never errors: string mode renders unresolved expressions
//! as the empty string, raw mode as `None`.

use crate::format_f64;
use crate::literal::{self, ProtectedLiteral};
use serde_json::{Map, Value};

/// `false`, `null`, `0`, the empty string, the empty array and the
/// key-less object all count as false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Scalar rendering used by interpolation and argument resolution.
/// Arrays and objects render empty in string mode.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) => format_f64(f),
            None => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => String::new(),
    }
}

/// Raw-mode lookup: the first alternative resolving to a non-null value.
pub fn lookup(
    ctx: &Map<String, Value>,
    expr: &str,
    literals: &[ProtectedLiteral],
) -> Option<Value> {
    lookup_impl(ctx, expr, literals, false)
}

/// String-mode lookup: skips `false` and non-scalar alternatives while
/// falling back, then renders the winner as a string.
pub fn lookup_string(
    ctx: &Map<String, Value>,
    expr: &str,
    literals: &[ProtectedLiteral],
) -> String {
    match lookup_impl(ctx, expr, literals, true) {
        Some(v) => display(&v),
        None => String::new(),
    }
}

fn lookup_impl(
    ctx: &Map<String, Value>,
    expr: &str,
    literals: &[ProtectedLiteral],
    string_mode: bool,
) -> Option<Value> {
    for alt in expr.split('|') {
        let alt: String = alt.chars().filter(|c| !c.is_whitespace()).collect();
        if alt.is_empty() {
            continue;
        }

        if let Some(text) = literal_text(&alt, literals) {
            return Some(coerce_literal(&text));
        }

        let Some(value) = resolve_path(ctx, &alt, literals) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if string_mode {
            match &value {
                Value::Bool(false) => continue,
                Value::Array(_) | Value::Object(_) => continue,
                _ => {}
            }
        }
        return Some(value);
    }
    None
}

/// A quoted string or a protected-literal placeholder used as a whole
/// alternative is a literal, not a context path.
fn literal_text(alt: &str, literals: &[ProtectedLiteral]) -> Option<String> {
    if let Some((index, len)) = literal::parse_placeholder(alt) {
        if len == alt.len() {
            return Some(literals.get(index).map(|l| l.text.clone()).unwrap_or_default());
        }
    }
    let bytes = alt.as_bytes();
    if alt.len() >= 2 {
        let q = bytes[0];
        if (q == b'"' || q == b'\'' || q == b'`') && bytes[alt.len() - 1] == q {
            return Some(alt[1..alt.len() - 1].to_string());
        }
    }
    None
}

fn coerce_literal(text: &str) -> Value {
    if let Ok(n) = text.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Value::Number(num);
        }
    }
    Value::String(text.to_string())
}

enum Segment {
    Key(String),
    Bracket(String),
}

fn split_segments(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                i += 1;
            }
            b'[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                match path[i..].find(']') {
                    Some(end) => {
                        segments.push(Segment::Bracket(path[i + 1..i + end].to_string()));
                        i += end + 1;
                    }
                    None => {
                        current.push('[');
                        i += 1;
                    }
                }
            }
            _ => {
                let ch = path[i..].chars().next().unwrap_or('.');
                current.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    segments
}

fn resolve_path(
    ctx: &Map<String, Value>,
    path: &str,
    literals: &[ProtectedLiteral],
) -> Option<Value> {
    let segments = split_segments(path);
    if segments.is_empty() {
        return None;
    }

    let mut current: Option<&Value> = None;
    for segment in &segments {
        let key = match segment {
            Segment::Key(k) => k.clone(),
            Segment::Bracket(inner) => match literal_text(inner, literals) {
                Some(text) => text,
                // Bracket indirection: the inner name is itself resolved
                // as a lookup unless it is a plain index.
                None if inner.parse::<usize>().is_ok() => inner.clone(),
                None => display(&lookup(ctx, inner, literals)?),
            },
        };

        current = match current {
            None => ctx.get(&key),
            Some(Value::Object(map)) => map.get(&key),
            Some(Value::Array(items)) => key
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            Some(_) => None,
        };
        current?;
    }
    current.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "name": "world",
            "count": 3,
            "flag": false,
            "user": { "name": "amy", "tags": ["a", "b"] },
            "key": "name",
            "empty": "",
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn test_simple_key() {
        assert_eq!(lookup_string(&ctx(), "name", &[]), "world");
    }

    #[test]
    fn test_dotted_chain() {
        assert_eq!(lookup_string(&ctx(), "user.name", &[]), "amy");
    }

    #[test]
    fn test_array_index() {
        assert_eq!(lookup_string(&ctx(), "user.tags.1", &[]), "b");
        assert_eq!(lookup_string(&ctx(), "user.tags[0]", &[]), "a");
    }

    #[test]
    fn test_bracket_indirection() {
        // `key` resolves to "name", so user[key] means user.name.
        assert_eq!(lookup_string(&ctx(), "user[key]", &[]), "amy");
    }

    #[test]
    fn test_bracket_quoted_key() {
        assert_eq!(lookup_string(&ctx(), "user['name']", &[]), "amy");
    }

    #[test]
    fn test_fallback_chain() {
        assert_eq!(lookup_string(&ctx(), "missing|name", &[]), "world");
        assert_eq!(lookup_string(&ctx(), "missing|'default'", &[]), "default");
    }

    #[test]
    fn test_false_skipped_in_string_mode() {
        assert_eq!(lookup_string(&ctx(), "flag|name", &[]), "world");
        assert_eq!(lookup(&ctx(), "flag|name", &[]), Some(Value::Bool(false)));
    }

    #[test]
    fn test_unresolved_is_empty_not_error() {
        assert_eq!(lookup_string(&ctx(), "nope.deep[3]", &[]), "");
        assert_eq!(lookup(&ctx(), "nope", &[]), None);
    }

    #[test]
    fn test_quoted_numeric_coerces() {
        assert_eq!(lookup(&ctx(), "'42'", &[]), Some(json!(42.0)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(1)));
    }
}
