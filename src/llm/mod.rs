//! Inference client: chat-completion types and the `LlmClient` seam.
//!
//! The wire format is the OpenAI-compatible chat-completions contract served by
//! Groq and most hosted providers. `OpenAiClient` speaks it over HTTP and
//! `RetryingClient` wraps any client with timeouts and bounded retries.

mod error;
mod openai;
mod retry;

pub use error::LlmError;
pub use openai::OpenAiClient;
pub use retry::{RetryConfig, RetryingClient};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Function result turn
    Tool,
}

/// One transcript turn in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant turn requesting one or more function calls.
    pub fn assistant_calls(thought: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: thought,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Function result turn answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Function calls carried by this turn, if any.
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

/// A function call request from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,

    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

fn function_kind() -> String {
    "function".to_string()
}

/// Function name plus its JSON-encoded argument object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,

    #[serde(default, deserialize_with = "arguments_as_string")]
    pub arguments: String,
}

/// Some providers send `arguments` as an object rather than an encoded string.
fn arguments_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Function declaration advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Model sampling options sent with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            model: "llama3-70b-8192".to_string(),
            temperature: 0.4,
            max_tokens: 1024,
            top_p: 0.9,
            stop: vec!["<|eot_id|>".to_string()],
        }
    }
}

impl ModelOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model name must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            ));
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be greater than zero".to_string());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(format!("top_p must be within (0.0, 1.0], got {}", self.top_p));
        }
        Ok(())
    }
}

/// A decoded chat-completion response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// True when the model produced neither text nor a function call.
    pub fn is_empty(&self) -> bool {
        let no_text = self
            .content
            .as_deref()
            .map(|c| c.trim().is_empty())
            .unwrap_or(true);
        let no_calls = self.tool_calls.as_ref().map(Vec::is_empty).unwrap_or(true);
        no_text && no_calls
    }

    /// Classify the response as a final answer or a function-call turn.
    ///
    /// Only the structured `tool_calls` field decides the tag; any text that
    /// accompanies a call is passed through as opaque `thought`.
    pub fn into_turn(self) -> Result<AssistantTurn, LlmError> {
        let thought = self.content.filter(|c| !c.trim().is_empty());
        match self.tool_calls {
            Some(calls) if !calls.is_empty() => Ok(AssistantTurn::Call { thought, calls }),
            _ => thought
                .map(|content| AssistantTurn::Final { content })
                .ok_or_else(|| LlmError::Parse("model returned an empty message".to_string())),
        }
    }
}

/// One assistant turn, tagged by what the loop must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantTurn {
    Final {
        content: String,
    },
    Call {
        thought: Option<String>,
        calls: Vec<ToolCall>,
    },
}

/// Trait for chat-completion backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the transcript and return the model's next turn.
    async fn chat_completion(
        &self,
        options: &ModelOptions,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatResponse, LlmError>;
}

/// A transcript must carry at least one user turn, and nothing but an optional
/// system prompt may precede the first one.
pub fn check_transcript(messages: &[ChatMessage]) -> Result<(), LlmError> {
    match messages.iter().find(|m| m.role != Role::System) {
        Some(first) if first.role == Role::User => Ok(()),
        Some(first) => Err(LlmError::InvalidRequest(format!(
            "transcript must start with a user turn, found {:?}",
            first.role
        ))),
        None => Err(LlmError::InvalidRequest(
            "transcript has no user turn".to_string(),
        )),
    }
}
