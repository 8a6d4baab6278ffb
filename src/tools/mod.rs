//! Function registry: the fixed set of actions the model may request.
//!
//! Each tool declares typed parameters. The registry checks a call against
//! those declarations before any handler runs, so unknown names and malformed
//! arguments never reach a side effect.

mod browser;
mod content;
mod extract;
pub mod html;
mod web;

pub use browser::{BrowserBackend, ChromiumBackend, RenderPage};
pub use content::{ContentStore, PageSource, StoredPage};
pub use extract::ExtractField;
pub use web::{FetchPage, WebSearch};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::ToolsConfig;
use crate::llm::{FunctionSchema, ToolCall, ToolSchema};

/// JSON type of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// A declared function parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: false,
        }
    }
}

/// Per-session state handed to every tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Pages fetched or rendered during this session
    pub content: ContentStore,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Trait for locally executable functions.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model uses to call this function.
    fn name(&self) -> &str;

    /// One-paragraph description shown to the model.
    fn description(&self) -> &str;

    /// Declared parameters. Arguments are checked against these before `execute`.
    fn parameters(&self) -> Vec<ParamSpec>;

    /// Run the function with already-validated arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

/// Name and description of a registered tool, for prompts and listings.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("unknown function `{name}`; available functions: {}", .available.join(", "))]
    UnknownFunction { name: String, available: Vec<String> },

    #[error("invalid arguments for `{name}`: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("`{name}` failed: {message}")]
    Execution { name: String, message: String },
}

/// Outcome of one function invocation, paired with the call it answers.
#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub call_id: String,
    pub name: String,
    pub outcome: Result<String, RegistryError>,
}

impl FunctionResult {
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Content of the `tool` turn sent back to the model.
    pub fn to_content(&self) -> String {
        match &self.outcome {
            Ok(output) => output.clone(),
            Err(e) => format!("Error: {}", e),
        }
    }
}

/// Registry of available tools, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in page tools.
    pub fn with_defaults(config: &ToolsConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(FetchPage::new(config)?));
        registry.register(Arc::new(RenderPage::new(
            Arc::new(ChromiumBackend::new(
                config.browser_command.clone(),
                config.render_timeout,
            )),
            config.max_content_chars,
        )));
        registry.register(Arc::new(ExtractField));
        registry.register(Arc::new(WebSearch::new(config)?));
        Ok(registry)
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List registered tools in name order.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }

    /// Function declarations for the inference request.
    pub fn get_tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|t| ToolSchema {
                kind: "function",
                function: FunctionSchema {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: parameters_schema(&t.parameters()),
                },
            })
            .collect()
    }

    /// Validate and run `name` with `args`.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<String, RegistryError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| RegistryError::UnknownFunction {
                name: name.to_string(),
                available: self.tools.keys().cloned().collect(),
            })?;

        check_arguments(name, &tool.parameters(), &args)?;

        tool.execute(args, ctx)
            .await
            .map_err(|e| RegistryError::Execution {
                name: name.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Decode a model call's argument string and invoke it.
    pub async fn invoke_call(&self, call: &ToolCall, ctx: &ToolContext) -> FunctionResult {
        let name = call.function.name.clone();
        let outcome = match parse_arguments(&call.function.arguments) {
            Ok(args) => self.invoke(&name, args, ctx).await,
            Err(reason) if self.contains(&name) => {
                Err(RegistryError::InvalidArguments { name: name.clone(), reason })
            }
            Err(_) => self.invoke(&name, Value::Null, ctx).await,
        };

        FunctionResult {
            call_id: call.id.clone(),
            name,
            outcome,
        }
    }
}

/// An empty argument string means "no arguments".
fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| format!("arguments are not valid JSON: {}", e))
}

fn check_arguments(name: &str, params: &[ParamSpec], args: &Value) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidArguments {
        name: name.to_string(),
        reason,
    };

    let obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;

    for param in params {
        match obj.get(param.name) {
            None | Some(Value::Null) if param.required => {
                return Err(invalid(format!("missing required argument '{}'", param.name)));
            }
            Some(value) if !value.is_null() && !param.kind.matches(value) => {
                return Err(invalid(format!(
                    "argument '{}' must be of type {}",
                    param.name,
                    param.kind.as_str()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn parameters_schema(params: &[ParamSpec]) -> Value {
    let properties: Map<String, Value> = params
        .iter()
        .map(|p| {
            (
                p.name.to_string(),
                json!({"type": p.kind.as_str(), "description": p.description}),
            )
        })
        .collect();
    let required: Vec<&str> = params.iter().filter(|p| p.required).map(|p| p.name).collect();

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Truncate `s` to at most `max_chars` characters.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> (&str, bool) {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => (&s[..idx], true),
        None => (s, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text back"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::required("text", ParamKind::String, "Text to echo"),
                ParamSpec::optional("times", ParamKind::Integer, "Repeat count"),
            ]
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let text = args["text"].as_str().unwrap_or_default();
            let times = args["times"].as_u64().unwrap_or(1) as usize;
            if text == "boom" {
                anyhow::bail!("exploded");
            }
            Ok(text.repeat(times))
        }
    }

    fn registry() -> (ToolRegistry, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo { runs: runs.clone() }));
        (registry, runs)
    }

    #[tokio::test]
    async fn unknown_function_never_executes() {
        let (registry, runs) = registry();
        let err = registry
            .invoke("send_email", json!({"to": "a@b.c"}), &ToolContext::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::UnknownFunction { ref name, .. } if name == "send_email"
        ));
        assert!(err.to_string().contains("available functions: echo"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_function_with_garbage_arguments_is_still_unknown() {
        let (registry, runs) = registry();
        let result = registry
            .invoke_call(&ToolCall::new("c1", "send_email", "{not json"), &ToolContext::new())
            .await;

        assert!(matches!(result.outcome, Err(RegistryError::UnknownFunction { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected() {
        let (registry, runs) = registry();
        let err = registry
            .invoke("echo", json!({"times": 2}), &ToolContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::InvalidArguments { .. }));
        assert!(err.to_string().contains("'text'"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_type_is_rejected() {
        let (registry, _) = registry();
        let err = registry
            .invoke("echo", json!({"text": "hi", "times": "two"}), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be of type integer"));

        let err = registry
            .invoke("echo", json!(["hi"]), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[tokio::test]
    async fn invalid_json_arguments_are_reported() {
        let (registry, _) = registry();
        let result = registry
            .invoke_call(&ToolCall::new("c1", "echo", "{\"text\": "), &ToolContext::new())
            .await;

        assert_eq!(result.call_id, "c1");
        assert!(result.to_content().starts_with("Error: invalid arguments for `echo`"));
    }

    #[tokio::test]
    async fn valid_call_executes() {
        let (registry, runs) = registry();
        let result = registry
            .invoke_call(
                &ToolCall::new("c2", "echo", r#"{"text": "ab", "times": 2}"#),
                &ToolContext::new(),
            )
            .await;

        assert!(!result.is_error());
        assert_eq!(result.to_content(), "abab");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_errors_become_execution_errors() {
        let (registry, _) = registry();
        let err = registry
            .invoke("echo", json!({"text": "boom"}), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Execution { ref message, .. } if message == "exploded"
        ));
    }

    #[test]
    fn schemas_are_generated_from_params() {
        let (registry, _) = registry();
        let schemas = registry.get_tool_schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(
            schemas[0].function.parameters,
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string", "description": "Text to echo"},
                    "times": {"type": "integer", "description": "Repeat count"}
                },
                "required": ["text"]
            })
        );
    }

    #[test]
    fn default_registry_lists_builtin_tools() {
        let registry = ToolRegistry::with_defaults(&ToolsConfig::default()).unwrap();
        let names: Vec<String> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["extract_field", "fetch_page", "render_page", "web_search"]
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), ("hé", true));
        assert_eq!(truncate_chars("abc", 5), ("abc", false));
    }
}
