//! Provider-agnostic request/response types and the core client trait.

use wl_domain::tool::{ChatMessage, ToolCall, ToolDefinition};
use wl_domain::Result;

/// One generation request: the rebuilt conversation plus the tools the
/// model may invoke this step.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Response token cap. `None` lets the provider choose.
    pub max_output_tokens: Option<u32>,
    /// Model identifier override. `None` uses the provider default.
    pub model: Option<String>,
}

/// A completed generation: assistant text and/or tool calls.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![ToolCall {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments,
            }],
        }
    }
}

/// Trait every LLM adapter must implement.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one generation request and wait for the full response.
    async fn generate(&self, req: GenerateRequest) -> Result<LlmResponse>;

    /// A unique identifier for this client instance.
    fn provider_id(&self) -> &str;
}
