//! Built-in tools available to a Completion node's tool-calling loop
//! (§4.J): `coin_flip`, `dice_roll`, and `global_state`.

use rand::Rng;
use serde_json::{json, Value};

use crate::error::{CoreError, Result};
use crate::flow::expr::set_path;
use crate::llm::provider::ToolDefinition;

pub const COIN_FLIP_TOOL: &str = "coin_flip";
pub const DICE_ROLL_TOOL: &str = "dice_roll";
pub const GLOBAL_STATE_TOOL: &str = "global_state";

pub fn coin_flip_definition() -> ToolDefinition {
    ToolDefinition {
        name: COIN_FLIP_TOOL.to_string(),
        description: "Flips a coin and returns heads or tails.".to_string(),
        parameters: json!({ "type": "object", "properties": {} }),
    }
}

pub fn dice_roll_definition() -> ToolDefinition {
    ToolDefinition {
        name: DICE_ROLL_TOOL.to_string(),
        description: "Rolls an N-sided die (default 6) and returns the result.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": { "sides": { "type": "integer", "minimum": 2 } }
        }),
    }
}

pub fn global_state_definition() -> ToolDefinition {
    ToolDefinition {
        name: GLOBAL_STATE_TOOL.to_string(),
        description: "Gets or sets a value in the run's shared variable store by dotted path.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["get", "set"] },
                "path": { "type": "string" },
                "value": {}
            },
            "required": ["action", "path"]
        }),
    }
}

/// Deterministic-signature, non-deterministic-outcome coin flip.
pub fn flip_coin() -> &'static str {
    if rand::rng().random_bool(0.5) {
        "heads"
    } else {
        "tails"
    }
}

/// Rolls a die with `sides` faces (default 6), returning a value in
/// `[1, sides]`.
pub fn roll_dice(sides: u32) -> u32 {
    let sides = sides.max(1);
    rand::rng().random_range(1..=sides)
}

/// Executes the `global_state` tool against `vars`, mutating it in place
/// for `set` and returning the looked-up value for `get`. Callers must
/// invalidate the expression evaluator's memo after any `set`.
pub fn execute_global_state(vars: &mut serde_json::Map<String, Value>, arguments: &Value) -> Result<Value> {
    let action = arguments.get("action").and_then(Value::as_str).ok_or_else(|| CoreError::Validation("global_state requires an action".to_string()))?;
    let path = arguments.get("path").and_then(Value::as_str).ok_or_else(|| CoreError::Validation("global_state requires a path".to_string()))?;

    match action {
        "get" => Ok(crate::flow::expr::get_path(&Value::Object(vars.clone()), path).cloned().unwrap_or(Value::Null)),
        "set" => {
            let value = arguments.get("value").cloned().unwrap_or(Value::Null);
            set_path(vars, path, value.clone());
            Ok(json!({ "ok": true, "path": path, "value": value }))
        }
        other => Err(CoreError::Validation(format!("unknown global_state action '{other}'"))),
    }
}

/// Parses a tool call's raw JSON arguments, wrapping non-JSON payloads as
/// `{"__raw": "..."}` per §4.J step 5.
pub fn parse_tool_arguments(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "__raw": raw }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_dice_stays_within_bounds() {
        for _ in 0..50 {
            let roll = roll_dice(20);
            assert!((1..=20).contains(&roll));
        }
    }

    #[test]
    fn global_state_set_then_get_round_trips() {
        let mut vars = serde_json::Map::new();
        execute_global_state(&mut vars, &json!({"action": "set", "path": "a.b", "value": 42})).unwrap();
        let got = execute_global_state(&mut vars, &json!({"action": "get", "path": "a.b"})).unwrap();
        assert_eq!(got, json!(42));
    }

    #[test]
    fn global_state_get_missing_path_returns_null() {
        let mut vars = serde_json::Map::new();
        let got = execute_global_state(&mut vars, &json!({"action": "get", "path": "missing"})).unwrap();
        assert_eq!(got, Value::Null);
    }

    #[test]
    fn parse_tool_arguments_wraps_non_json_as_raw() {
        let parsed = parse_tool_arguments("not json");
        assert_eq!(parsed, json!({"__raw": "not json"}));
    }

    #[test]
    fn parse_tool_arguments_parses_valid_json() {
        let parsed = parse_tool_arguments(r#"{"sides": 20}"#);
        assert_eq!(parsed, json!({"sides": 20}));
    }
}
