//! `${path}` expression evaluator (§4.1).
//!
//! Never fails: unresolved references degrade to empty/unchanged rather
//! than raising an error (`EvaluationError` is deliberately unobservable
//! from outside this module — see §7).

use serde_json::Value as Json;

/// Resolve `path` (`"a.b.c"`) against a nested JSON object/array tree.
pub fn nested_get<'a>(ctx: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = ctx;
    for segment in path.split('.') {
        cur = match cur {
            Json::Object(map) => map.get(segment)?,
            Json::Array(arr) => arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Write `value` at `path`, creating intermediate objects as needed.
/// Fails silently (no-op) on a path that walks through a non-object.
pub fn nested_set(ctx: &mut Json, path: &str, value: Json) {
    if !ctx.is_object() {
        *ctx = Json::Object(Default::default());
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut cur = ctx;
    for (i, segment) in segments.iter().enumerate() {
        let is_last = i == segments.len() - 1;
        let map = match cur.as_object_mut() {
            Some(m) => m,
            None => return,
        };
        if is_last {
            map.insert(segment.to_string(), value);
            return;
        }
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Json::Object(Default::default()));
        if !entry.is_object() {
            *entry = Json::Object(Default::default());
        }
        cur = entry;
    }
}

/// Render a JSON value as the string form used in template substitution.
fn value_to_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

/// Find a single `${path}` reference spanning the whole string, if any.
fn whole_reference(expr: &str) -> Option<&str> {
    let s = expr.trim();
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") {
        None
    } else {
        Some(inner)
    }
}

/// Evaluate `expr` against `ctx` per the distilled spec's contract:
/// - `${path}` alone resolves to the referenced value (or the original
///   string if the path is absent).
/// - `${path}` interleaved with literal text substitutes each occurrence
///   with the string form of the resolved value (absent -> empty).
/// - non-string inputs pass through unchanged.
pub fn evaluate(expr: &Json, ctx: &Json) -> Json {
    let s = match expr {
        Json::String(s) => s,
        other => return other.clone(),
    };

    if let Some(path) = whole_reference(s) {
        return match nested_get(ctx, path) {
            Some(v) => v.clone(),
            None => Json::String(s.clone()),
        };
    }

    if !s.contains("${") {
        return Json::String(s.clone());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s.as_str();
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                let resolved = nested_get(ctx, path)
                    .map(value_to_string)
                    .unwrap_or_default();
                out.push_str(&resolved);
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference — emit the rest verbatim.
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Json::String(out)
}

/// Evaluate `expr` as a string, regardless of input shape.
pub fn evaluate_str(expr: &str, ctx: &Json) -> String {
    value_to_string(&evaluate(&Json::String(expr.to_string()), ctx))
}

/// Comparison operators recognized by gateway conditions. Checked longest
/// first so `==` is never mis-split on a bare `=`.
const OPERATORS: &[&str] = &["==", "!=", "<=", ">=", "<", ">"];

/// Evaluate a gateway edge condition (§4.3, §9 Open Questions): substitute
/// `${...}` references, then compare if a comparison operator is present,
/// else fall back to JSON truthiness of the substituted value.
pub fn evaluate_condition(expr: &str, ctx: &Json) -> bool {
    for op in OPERATORS {
        if let Some(idx) = expr.find(op) {
            let lhs = expr[..idx].trim();
            let rhs = expr[idx + op.len()..].trim();
            let lv = evaluate_str(lhs, ctx);
            let rv = evaluate_str(rhs, ctx);
            return compare(&lv, &rv, op);
        }
    }
    is_truthy(&evaluate(&Json::String(expr.to_string()), ctx))
}

fn compare(lv: &str, rv: &str, op: &str) -> bool {
    if let (Ok(l), Ok(r)) = (lv.parse::<f64>(), rv.parse::<f64>()) {
        return match op {
            "==" => l == r,
            "!=" => l != r,
            "<" => l < r,
            ">" => l > r,
            "<=" => l <= r,
            ">=" => l >= r,
            _ => false,
        };
    }
    if let (Ok(l), Ok(r)) = (lv.parse::<bool>(), rv.parse::<bool>()) {
        return match op {
            "==" => l == r,
            "!=" => l != r,
            _ => false,
        };
    }
    match op {
        "==" => lv == rv,
        "!=" => lv != rv,
        "<" => lv < rv,
        ">" => lv > rv,
        "<=" => lv <= rv,
        ">=" => lv >= rv,
        _ => false,
    }
}

pub fn is_truthy(v: &Json) -> bool {
    match v {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty() && s != "false",
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_path_resolves_to_value() {
        let ctx = json!({"a": {"b": 7}});
        assert_eq!(evaluate(&json!("${a.b}"), &ctx), json!(7));
    }

    #[test]
    fn absent_whole_path_returns_original_string() {
        let ctx = json!({});
        assert_eq!(evaluate(&json!("${missing}"), &ctx), json!("${missing}"));
    }

    #[test]
    fn interleaved_text_substitutes_string_form() {
        let ctx = json!({"name": "Ada"});
        assert_eq!(
            evaluate(&json!("hello ${name}!"), &ctx),
            json!("hello Ada!")
        );
    }

    #[test]
    fn absent_interleaved_reference_substitutes_empty() {
        let ctx = json!({});
        assert_eq!(evaluate(&json!("x=${missing}."), &ctx), json!("x=."));
    }

    #[test]
    fn non_string_passes_through() {
        let ctx = json!({});
        assert_eq!(evaluate(&json!(42), &ctx), json!(42));
        assert_eq!(evaluate(&json!(true), &ctx), json!(true));
    }

    #[test]
    fn condition_equality_on_resolved_value() {
        let ctx = json!({"x": 1});
        assert!(evaluate_condition("${x} == 1", &ctx));
        let ctx2 = json!({"x": 2});
        assert!(!evaluate_condition("${x} == 1", &ctx2));
    }

    #[test]
    fn condition_without_operator_is_truthy_check() {
        let ctx = json!({"flag": true});
        assert!(evaluate_condition("${flag}", &ctx));
        let ctx2 = json!({"flag": false});
        assert!(!evaluate_condition("${flag}", &ctx2));
    }

    #[test]
    fn nested_set_creates_intermediate_maps() {
        let mut v = json!({});
        nested_set(&mut v, "a.b.c", json!(1));
        assert_eq!(v, json!({"a": {"b": {"c": 1}}}));
    }
}
