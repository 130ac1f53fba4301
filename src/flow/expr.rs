//! A small sandboxed `${...}` expression grammar (§9 "Dynamic expression
//! evaluation"): literals and dotted property access over
//! `{input, messages, contextMessages, vars}`, not a general interpreter.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CoreError, Result};

/// Looks up a dotted path (`a.b.c`) inside a JSON value, returning `None`
/// on any missing segment.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Sets a dotted path inside a JSON object, creating intermediate objects
/// as needed.
pub fn set_path(root: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    set_path_segments(root, &segments, value);
}

fn set_path_segments(root: &mut serde_json::Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            root.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = root.entry((*head).to_string()).or_insert_with(|| Value::Object(Default::default()));
            if !entry.is_object() {
                *entry = Value::Object(Default::default());
            }
            set_path_segments(entry.as_object_mut().expect("just ensured object"), rest, value);
        }
    }
}

/// Evaluation scope exposed to `${...}` templates.
pub struct Scope<'a> {
    pub input: &'a Value,
    pub vars: &'a Value,
    pub messages: &'a Value,
    pub context_messages: &'a Value,
}

impl<'a> Scope<'a> {
    fn resolve(&self, path: &str) -> Option<Value> {
        let (root_name, rest) = path.split_once('.').unwrap_or((path, ""));
        let root = match root_name {
            "input" => self.input,
            "vars" => self.vars,
            "messages" => self.messages,
            "contextMessages" => self.context_messages,
            _ => return None,
        };
        if rest.is_empty() {
            Some(root.clone())
        } else {
            get_path(root, rest).cloned()
        }
    }
}

fn value_to_template_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluates every `${expr}` occurrence in `template`, substituting the
/// resolved value (stringified) or an empty string if unresolved.
pub fn evaluate_template(template: &str, scope: &Scope) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find("${") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                let end = after.find('}').ok_or_else(|| CoreError::Validation("unterminated ${...} expression".to_string()))?;
                let expr = after[..end].trim();
                let resolved = scope.resolve(expr).map(|v| value_to_template_string(&v)).unwrap_or_default();
                out.push_str(&resolved);
                rest = &after[end + 1..];
            }
        }
    }
    Ok(out)
}

/// Memoizes evaluated templates against a scope snapshot; callers must
/// invalidate after every `vars` mutation.
#[derive(Default)]
pub struct EvaluatorCache {
    memo: Mutex<HashMap<String, String>>,
}

impl EvaluatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, template: &str, scope: &Scope) -> Result<String> {
        if let Some(cached) = self.memo.lock().expect("evaluator cache poisoned").get(template) {
            return Ok(cached.clone());
        }
        let result = evaluate_template(template, scope)?;
        self.memo.lock().expect("evaluator cache poisoned").insert(template.to_string(), result.clone());
        Ok(result)
    }

    pub fn invalidate(&self) {
        self.memo.lock().expect("evaluator cache poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_path_resolves_nested_object() {
        let root = json!({"a": {"b": {"c": 42}}});
        assert_eq!(get_path(&root, "a.b.c"), Some(&json!(42)));
        assert_eq!(get_path(&root, "a.missing"), None);
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut root = serde_json::Map::new();
        set_path(&mut root, "a.b.c", json!(1));
        assert_eq!(root["a"]["b"]["c"], json!(1));
    }

    #[test]
    fn evaluate_template_substitutes_vars_path() {
        let input = json!("hello");
        let vars = json!({"name": "world"});
        let messages = json!([]);
        let context_messages = json!([]);
        let scope = Scope { input: &input, vars: &vars, messages: &messages, context_messages: &context_messages };
        let result = evaluate_template("Hi ${vars.name}, input was ${input}", &scope).unwrap();
        assert_eq!(result, "Hi world, input was hello");
    }

    #[test]
    fn evaluator_cache_invalidate_clears_memo() {
        let cache = EvaluatorCache::new();
        let input = json!(null);
        let vars = json!({"x": 1});
        let messages = json!([]);
        let context_messages = json!([]);
        let scope = Scope { input: &input, vars: &vars, messages: &messages, context_messages: &context_messages };
        assert_eq!(cache.evaluate("${vars.x}", &scope).unwrap(), "1");
        cache.invalidate();
        assert!(cache.memo.lock().unwrap().is_empty());
    }
}
