//! OpenRouter-compatible provider (§9a): a concrete HTTP client against an
//! OpenAI-Chat-Completions-shaped API, with real SSE streaming.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CoreError, ProviderError, Result};
use crate::llm::http_client::{HttpProviderClient, OpenAICompatible};
use crate::llm::provider::{
    EmbeddingResponse, GenerationRequest, GenerationResponse, GenerationStream, LlmProvider, Message, Role,
    StreamDelta, ToolCall, ToolChoice, ToolDefinition, Usage,
};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    kind: String,
    function: WireFunctionCall,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

fn role_to_wire(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn wire_role(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn message_to_wire(message: &Message) -> WireMessage {
    WireMessage {
        role: role_to_wire(message.role).to_string(),
        content: message.content.clone(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|tc| WireToolCall {
                id: tc.id.clone(),
                kind: "function".to_string(),
                function: WireFunctionCall {
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> WireTool {
    WireTool {
        kind: "function",
        function: WireFunctionDef {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        },
    }
}

fn tool_choice_to_wire(choice: ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Required => Value::String("required".to_string()),
        ToolChoice::Function(name) => serde_json::json!({ "type": "function", "function": { "name": name } }),
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    total_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponseData {
    data: Vec<EmbeddingDatum>,
    model: String,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelDatum>,
}

#[derive(Debug, Deserialize)]
struct ModelDatum {
    id: String,
}

pub struct OpenRouterProvider {
    base_url: String,
    api_key: Option<String>,
    http: HttpProviderClient,
    model: String,
}

impl OpenAICompatible for OpenRouterProvider {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

impl OpenRouterProvider {
    pub fn new(base_url: String, api_key: Option<String>, model: String, timeout_secs: u64) -> Self {
        Self {
            base_url,
            api_key,
            http: HttpProviderClient::new(timeout_secs),
            model,
        }
    }

    fn headers(&self) -> Vec<(&str, String)> {
        let mut headers = self.auth_headers();
        headers.push(("Content-Type", "application/json".to_string()));
        headers
    }

    fn request_body(&self, request: &GenerationRequest<'_>, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(message_to_wire).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: request.tools.iter().map(tool_to_wire).collect(),
            tool_choice: request.tool_choice.clone().map(tool_choice_to_wire),
            stream,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn generate(&self, request: GenerationRequest<'_>) -> Result<GenerationResponse> {
        let body = self.request_body(&request, false);
        let url = self.build_url("chat/completions");
        let response: ChatCompletionResponse = self.http.post_json(&url, &body, self.headers()).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Provider(ProviderError::InvalidResponse("no choices in response".into())))?;

        info!(model = %response.model, "generated completion");

        Ok(GenerationResponse {
            text: choice.message.content,
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect(),
            finish_reason: choice.finish_reason,
            model: response.model,
            usage: response.usage.map(Usage::from),
        })
    }

    async fn generate_stream(&self, request: GenerationRequest<'_>) -> Result<GenerationStream> {
        let body = self.request_body(&request, true);
        let url = self.build_url("chat/completions");
        let response = self.http.post_stream(&url, &body, self.headers()).await?;
        Ok(Box::pin(parse_sse_stream(response)))
    }

    async fn embed(&self, model: &str, text: &str) -> Result<EmbeddingResponse> {
        let body = EmbeddingRequest {
            model: model.to_string(),
            input: text.to_string(),
        };
        let url = self.build_url("embeddings");
        let response: EmbeddingResponseData = self.http.post_json(&url, &body, self.headers()).await?;

        let datum = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Provider(ProviderError::EmbeddingFailed("no embeddings in response".into())))?;

        debug!(dimension = datum.embedding.len(), "generated embedding");
        Ok(EmbeddingResponse {
            embedding: datum.embedding,
            model: response.model,
            usage: response.usage.map(Usage::from),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = self.build_url("models");
        let response: ModelsResponse = self.http.get(&url, self.headers()).await?;
        Ok(response.data.into_iter().map(|m| m.id).collect())
    }
}

/// Parses a `text/event-stream` response body into a stream of
/// [`StreamDelta`]s, accumulating fragmented tool-call arguments by index
/// and carrying forward the last `usage` object seen (§9a).
fn parse_sse_stream(response: reqwest::Response) -> impl Stream<Item = Result<StreamDelta>> {
    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut fragments: BTreeMap<usize, (Option<String>, Option<String>, String)> = BTreeMap::new();

    async_stream::stream! {
        loop {
            match byte_stream.next().await {
                None => break,
                Some(Err(e)) => {
                    yield Err(CoreError::Provider(ProviderError::ConnectionFailed(e.to_string())));
                    break;
                }
                Some(Ok(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim_end_matches('\r').to_string();
                        buffer.drain(..=pos);

                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            return;
                        }
                        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                            Ok(c) => c,
                            Err(_) => continue,
                        };

                        let mut delta = StreamDelta::default();
                        if let Some(choice) = chunk.choices.into_iter().next() {
                            delta.content = choice.delta.content;
                            delta.finish_reason = choice.finish_reason;
                            for tc in choice.delta.tool_calls {
                                let entry = fragments.entry(tc.index).or_insert_with(|| (None, None, String::new()));
                                if let Some(id) = tc.id {
                                    entry.0 = Some(id);
                                }
                                if let Some(function) = tc.function {
                                    if let Some(name) = function.name {
                                        entry.1 = Some(name);
                                    }
                                    if let Some(args) = function.arguments {
                                        entry.2.push_str(&args);
                                    }
                                }
                                delta.tool_call_fragment = Some((
                                    tc.index,
                                    fragments[&tc.index].0.clone(),
                                    fragments[&tc.index].1.clone(),
                                    Some(fragments[&tc.index].2.clone()),
                                ));
                            }
                        }
                        if let Some(usage) = chunk.usage {
                            delta.usage = Some(usage.into());
                        }
                        yield Ok(delta);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::Message;

    #[test]
    fn message_to_wire_round_trips_role_and_content() {
        let message = Message::user("hello");
        let wire = message_to_wire(&message);
        assert_eq!(wire.role, "user");
        assert_eq!(wire.content, "hello");
    }

    #[test]
    fn wire_role_maps_unknown_to_user() {
        assert_eq!(wire_role("weird"), Role::User);
        assert_eq!(wire_role("assistant"), Role::Assistant);
    }

    #[test]
    fn tool_choice_maps_to_wire_strings() {
        assert_eq!(tool_choice_to_wire(ToolChoice::Auto), Value::String("auto".to_string()));
        assert_eq!(tool_choice_to_wire(ToolChoice::Required), Value::String("required".to_string()));
        assert_eq!(
            tool_choice_to_wire(ToolChoice::Function("set_results".to_string())),
            serde_json::json!({ "type": "function", "function": { "name": "set_results" } })
        );
    }

    #[tokio::test]
    async fn sse_stream_accumulates_fragmented_tool_call_arguments() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"coin_flip\",\"arguments\":\"{\\\"si\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"des\\\":1}\"}}]}}],\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let provider = OpenRouterProvider::new(server.uri(), Some("key".into()), "gpt-4o-mini".into(), 30);
        let messages = vec![Message::user("flip a coin")];
        let stream = provider
            .generate_stream(GenerationRequest {
                messages: &messages,
                ..Default::default()
            })
            .await
            .unwrap();

        let deltas: Vec<_> = stream.collect().await;
        let mut last_args = None;
        let mut saw_usage = false;
        for delta in deltas {
            let delta = delta.unwrap();
            if let Some((_, _, _, Some(args))) = delta.tool_call_fragment {
                last_args = Some(args);
            }
            if delta.usage.is_some() {
                saw_usage = true;
            }
        }
        assert_eq!(last_args.as_deref(), Some("{\"sides\":1}"));
        assert!(saw_usage);
    }
}
