//! OpenAI-compatible chat-completions client (Groq, OpenRouter, local servers).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    check_transcript, ChatMessage, ChatResponse, FunctionCall, LlmClient, LlmError, ModelOptions,
    ToolCall, ToolSchema, Usage,
};

/// HTTP client for a `/chat/completions` endpoint.
pub struct OpenAiClient {
    http: Client,
    api_base: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Result<Self, LlmError> {
        let http = Client::builder()
            .user_agent(concat!("scrape-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.into(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSchema]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
    /// Legacy single-call field.
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(
        &self,
        options: &ModelOptions,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatResponse, LlmError> {
        check_transcript(messages)?;

        let tools = tools.filter(|t| !t.is_empty());
        let body = CompletionRequest {
            model: &options.model,
            messages,
            tools,
            tool_choice: tools.map(|_| "auto"),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: (!options.stop.is_empty()).then_some(options.stop.as_slice()),
            stream: false,
        };

        tracing::debug!(
            model = %options.model,
            messages = messages.len(),
            "sending chat completion"
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::from_reqwest)?;

        if !status.is_success() {
            return Err(LlmError::from_status(
                status.as_u16(),
                error_message(&text),
            ));
        }

        parse_completion(&text)
    }
}

fn parse_completion(text: &str) -> Result<ChatResponse, LlmError> {
    let parsed: CompletionResponse =
        serde_json::from_str(text).map_err(|e| LlmError::Parse(e.to_string()))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Parse("response contained no choices".to_string()))?;

    let mut tool_calls = choice.message.tool_calls.filter(|calls| !calls.is_empty());
    if tool_calls.is_none() {
        tool_calls = choice
            .message
            .function_call
            .map(|function| vec![ToolCall {
                id: String::new(),
                kind: "function".to_string(),
                function,
            }]);
    }
    if let Some(calls) = tool_calls.as_mut() {
        for call in calls.iter_mut().filter(|c| c.id.is_empty()) {
            call.id = format!("call_{}", Uuid::new_v4().simple());
        }
    }

    let response = ChatResponse {
        content: choice.message.content,
        tool_calls,
        finish_reason: choice.finish_reason,
        usage: parsed.usage,
    };
    if response.is_empty() {
        return Err(LlmError::Parse("model returned an empty message".to_string()));
    }
    Ok(response)
}

/// Pull `error.message` out of a provider error body, else return the body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            match trimmed.char_indices().nth(500) {
                Some((idx, _)) => format!("{}...", &trimmed[..idx]),
                None => trimmed.to_string(),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn transcript() -> Vec<ChatMessage> {
        vec![ChatMessage::system("sys"), ChatMessage::user("what is 2+2")]
    }

    fn calculator_schema() -> Vec<ToolSchema> {
        vec![ToolSchema {
            kind: "function",
            function: super::super::FunctionSchema {
                name: "calculator".to_string(),
                description: "Evaluate arithmetic".to_string(),
                parameters: json!({"type": "object", "properties": {"expr": {"type": "string"}}}),
            },
        }]
    }

    #[tokio::test]
    async fn parses_tool_call_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .body_contains("\"tool_choice\":\"auto\"")
                    .body_contains("\"stream\":false");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "choices": [{
                            "message": {
                                "role": "assistant",
                                "content": null,
                                "tool_calls": [{
                                    "id": "call_1",
                                    "type": "function",
                                    "function": {"name": "calculator", "arguments": "{\"expr\":\"2+2\"}"}
                                }]
                            },
                            "finish_reason": "tool_calls"
                        }],
                        "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
                    }));
            })
            .await;

        let client = OpenAiClient::new(server.base_url(), "test-key").unwrap();
        let response = client
            .chat_completion(&ModelOptions::default(), &transcript(), Some(&calculator_schema()))
            .await
            .unwrap();

        mock.assert_async().await;
        let calls = response.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, r#"{"expr":"2+2"}"#);
        assert_eq!(response.usage.unwrap().total_tokens, 17);
    }

    #[tokio::test]
    async fn omits_tools_when_none_registered() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .matches(|req| {
                        let body = req.body.clone().unwrap_or_default();
                        let text = String::from_utf8_lossy(&body);
                        !text.contains("\"tools\"") && !text.contains("tool_choice")
                    });
                then.status(200).json_body(json!({
                    "choices": [{"message": {"role": "assistant", "content": "4"}, "finish_reason": "stop"}]
                }));
            })
            .await;

        let client = OpenAiClient::new(server.base_url(), "k").unwrap();
        let response = client
            .chat_completion(&ModelOptions::default(), &transcript(), Some(&[]))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(401)
                    .json_body(json!({"error": {"message": "Invalid API Key"}}));
            })
            .await;

        let client = OpenAiClient::new(server.base_url(), "bad").unwrap();
        let err = client
            .chat_completion(&ModelOptions::default(), &transcript(), None)
            .await
            .unwrap_err();

        match err {
            LlmError::Auth { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API Key");
            }
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(503).body("upstream unavailable");
            })
            .await;

        let client = OpenAiClient::new(server.base_url(), "k").unwrap();
        let err = client
            .chat_completion(&ModelOptions::default(), &transcript(), None)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).body("not valid json");
            })
            .await;

        let client = OpenAiClient::new(server.base_url(), "k").unwrap();
        let err = client
            .chat_completion(&ModelOptions::default(), &transcript(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[tokio::test]
    async fn rejects_transcript_without_user_turn() {
        let client = OpenAiClient::new("http://127.0.0.1:9", "k").unwrap();
        let err = client
            .chat_completion(&ModelOptions::default(), &[ChatMessage::system("s")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[test]
    fn legacy_function_call_is_normalised() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "function_call": {"name": "fetch_page", "arguments": "{\"url\":\"https://example.com\"}"}
                }
            }]
        })
        .to_string();

        let response = parse_completion(&body).unwrap();
        let calls = response.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "fetch_page");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let err = parse_completion(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[test]
    fn error_message_falls_back_to_body() {
        assert_eq!(error_message("plain failure"), "plain failure");
        assert_eq!(
            error_message(r#"{"error":{"message":"rate limited"}}"#),
            "rate limited"
        );
    }
}
