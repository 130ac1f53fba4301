//! LLM/embedding provider abstraction (§9a): a single OpenAI-compatible
//! HTTP client plumbed through an OpenRouter-shaped concrete provider.

pub mod http_client;
pub mod openrouter;
pub mod provider;

pub use openrouter::OpenRouterProvider;
pub use provider::{
    EmbeddingResponse, GenerationRequest, GenerationResponse, GenerationStream, LlmProvider, Message, Role,
    StreamDelta, ToolCall, ToolChoice, ToolDefinition, Usage,
};
