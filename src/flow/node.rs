//! Tagged node variants and the mutable state threaded through a flow run
//! (§4.J, §9 "dynamic node payloads").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::provider::{Message, Role};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartData {
    #[serde(default)]
    pub preferred_edge_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionData {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub tools_enabled: bool,
    #[serde(default)]
    pub forced_tool_choice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageData {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardrailCategory {
    HarmToOthers,
    HarmToSelf,
    HarmToSystem,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailsData {
    #[serde(default)]
    pub categories: Vec<GuardrailCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RagData {
    #[serde(default)]
    pub store_id: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub query_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReadDocumentData {
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolData {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_tool_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub handler_key: Option<String>,
}

fn default_tool_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoinFlipData {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiceRollData {
    #[serde(default = "default_sides")]
    pub sides: u32,
}

impl Default for DiceRollData {
    fn default() -> Self {
        Self { sides: default_sides() }
    }
}

fn default_sides() -> u32 {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SetVariableData {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndData {}

/// One tagged node variant, dispatched on by the executor registry
/// (§9: "Executors are looked up in a registry keyed by tag").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Node {
    Start(StartData),
    Completion(CompletionData),
    Message(MessageData),
    Guardrails(GuardrailsData),
    Rag(RagData),
    ReadDocument(ReadDocumentData),
    Tool(ToolData),
    CoinFlip(CoinFlipData),
    DiceRoll(DiceRollData),
    SetVariable(SetVariableData),
    End(EndData),
}

impl Node {
    pub fn tag(&self) -> &'static str {
        match self {
            Node::Start(_) => "start",
            Node::Completion(_) => "completion",
            Node::Message(_) => "message",
            Node::Guardrails(_) => "guardrails",
            Node::Rag(_) => "rag",
            Node::ReadDocument(_) => "readDocument",
            Node::Tool(_) => "tool",
            Node::CoinFlip(_) => "coinFlip",
            Node::DiceRoll(_) => "diceRoll",
            Node::SetVariable(_) => "setVariable",
            Node::End(_) => "end",
        }
    }
}

/// A system-role snippet contributed to downstream LLM prompts (§4.J
/// Message node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
    pub priority: i32,
    pub source_node_id: String,
}

/// The mutable state threaded through one flow run. `node_outputs` is
/// transient and excluded from persisted step-log snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionState {
    pub payload: Value,
    #[serde(default)]
    pub context_messages: Vec<ContextMessage>,
    #[serde(default)]
    pub vars: serde_json::Map<String, Value>,
    #[serde(default)]
    pub conversation: Vec<Message>,
    #[serde(skip)]
    pub node_outputs: HashMap<String, Value>,
}

impl ExecutionState {
    pub fn seed(user_message: Option<String>, initial_vars: Option<serde_json::Map<String, Value>>) -> Self {
        Self {
            payload: user_message.clone().map(Value::String).unwrap_or(Value::Null),
            context_messages: Vec::new(),
            vars: initial_vars.unwrap_or_default(),
            conversation: user_message.map(|m| vec![Message::user(m)]).unwrap_or_default(),
            node_outputs: HashMap::new(),
        }
    }

    /// Context messages contributed by distinct source nodes, most recent
    /// contribution per source winning, ordered by `priority` descending
    /// (§4.J "deduplicated by source node id").
    pub fn scoped_context_messages(&self) -> Vec<&ContextMessage> {
        let mut by_source: HashMap<&str, &ContextMessage> = HashMap::new();
        for msg in &self.context_messages {
            by_source.insert(msg.source_node_id.as_str(), msg);
        }
        let mut messages: Vec<&ContextMessage> = by_source.into_values().collect();
        messages.sort_by(|a, b| b.priority.cmp(&a.priority));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_tag_matches_serde_type_name() {
        assert_eq!(Node::CoinFlip(CoinFlipData {}).tag(), "coinFlip");
        assert_eq!(Node::SetVariable(SetVariableData::default()).tag(), "setVariable");
    }

    #[test]
    fn scoped_context_messages_dedupes_by_source_and_sorts_by_priority() {
        let mut state = ExecutionState::default();
        state.context_messages.push(ContextMessage { role: Role::System, content: "old".into(), priority: 1, source_node_id: "a".into() });
        state.context_messages.push(ContextMessage { role: Role::System, content: "new".into(), priority: 5, source_node_id: "a".into() });
        state.context_messages.push(ContextMessage { role: Role::System, content: "b".into(), priority: 2, source_node_id: "b".into() });

        let scoped = state.scoped_context_messages();
        assert_eq!(scoped.len(), 2);
        assert_eq!(scoped[0].content, "new");
    }

    #[test]
    fn dice_roll_data_defaults_to_six_sides() {
        assert_eq!(DiceRollData::default().sides, 6);
    }
}
