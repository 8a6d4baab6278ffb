//! Core agent loop implementation.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentLimits, Config};
use crate::llm::{
    AssistantTurn, ChatMessage, LlmClient, LlmError, ModelOptions, OpenAiClient, RetryingClient,
    Usage,
};
use crate::tools::{FunctionResult, RegistryError, ToolContext, ToolRegistry};
use crate::validate::{OutputSchema, StructuredResult, ValidationError};

use super::format::Formatter;
use super::log::{truncate_for_log, LogEntryType, SessionLog, SessionLogEntry};
use super::prompt::build_system_prompt;
use super::transcript::Transcript;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    AwaitingModel,
    Dispatching,
    Done,
    Failed,
}

/// Why a session ended without an answer.
#[derive(Debug, Clone, Error)]
pub enum FailureReason {
    #[error("inference failed: {0}")]
    Inference(LlmError),

    #[error("{count} consecutive function calls failed; last error: {last_error}")]
    RepeatedToolFailures { count: u32, last_error: String },

    #[error("no final answer after {0} model turns")]
    MaxIterations(usize),

    #[error("session cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// The model answered and the answer has the declared shape
    Done(StructuredResult),
    /// The model answered but the answer failed validation
    Rejected(ValidationError),
    Failed(FailureReason),
}

/// Everything a finished session produced.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub query: String,
    pub outcome: SessionOutcome,
    pub final_state: AgentState,
    /// Model turns requested
    pub iterations: usize,
    pub usage: Usage,
    pub log: Vec<SessionLogEntry>,
    pub transcript: Vec<ChatMessage>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Done(_))
    }

    pub fn to_json(&self) -> Value {
        let (status, detail) = match &self.outcome {
            SessionOutcome::Done(result) => (
                "done",
                json!({"result": serde_json::to_value(result).unwrap_or(Value::Null)}),
            ),
            SessionOutcome::Rejected(err) => (
                "rejected",
                json!({"validation_error": serde_json::to_value(err).unwrap_or(Value::Null)}),
            ),
            SessionOutcome::Failed(reason) => ("failed", json!({"error": reason.to_string()})),
        };

        let mut report = json!({
            "query": self.query,
            "status": status,
            "final_state": self.final_state,
            "iterations": self.iterations,
            "usage": self.usage,
            "log": self.log,
            "transcript": self.transcript,
        });
        if let (Some(report), Some(detail)) = (report.as_object_mut(), detail.as_object()) {
            report.extend(detail.clone());
        }
        report
    }
}

/// Per-run settings of an [`Agent`].
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub model: ModelOptions,
    pub limits: AgentLimits,
    pub output: OutputSchema,
    /// Run the formatting pass over successful results
    pub format_output: bool,
}

impl AgentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            limits: config.limits.clone(),
            output: OutputSchema::new(config.output_fields.clone()),
            format_output: config.format_output,
        }
    }
}

/// Mutable state of one run. Never shared between runs.
struct Session {
    transcript: Transcript,
    log: SessionLog,
    usage: Usage,
    iterations: usize,
    state: AgentState,
}

/// The scraping agent.
///
/// Holds only immutable, shared parts, so one `Agent` can serve concurrent
/// runs.
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    options: AgentOptions,
}

impl Agent {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>, options: AgentOptions) -> Self {
        Self {
            llm,
            tools,
            options,
        }
    }

    /// Wire the HTTP client, retry policy and built-in tools from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = OpenAiClient::new(&config.api_base, &config.api_key)?;
        let llm = Arc::new(RetryingClient::new(Arc::new(client), config.retry.clone()));
        let tools = ToolRegistry::with_defaults(&config.tools)?;
        Ok(Self::new(
            llm,
            Arc::new(tools),
            AgentOptions::from_config(config),
        ))
    }

    /// Run one query to completion, failure or cancellation.
    pub async fn run(&self, query: &str, cancel: &CancellationToken) -> SessionReport {
        let system_prompt = build_system_prompt(&self.tools, &self.options.output);
        let mut session = Session {
            transcript: Transcript::new(system_prompt, query),
            log: SessionLog::new(),
            usage: Usage::default(),
            iterations: 0,
            state: AgentState::AwaitingModel,
        };
        let ctx = ToolContext::new();

        let outcome = match self.drive(&mut session, &ctx, cancel).await {
            Ok(answer) => self.finish(query, answer, &mut session, cancel).await,
            Err(reason) => {
                session.state = AgentState::Failed;
                session.log.push(LogEntryType::Error, reason.to_string());
                SessionOutcome::Failed(reason)
            }
        };

        tracing::info!(
            state = ?session.state,
            iterations = session.iterations,
            total_tokens = session.usage.total_tokens,
            "session finished"
        );

        SessionReport {
            query: query.to_string(),
            outcome,
            final_state: session.state,
            iterations: session.iterations,
            usage: session.usage,
            log: session.log.into_entries(),
            transcript: session.transcript.into_messages(),
        }
    }

    /// Alternate between the model and the registry until a final answer.
    async fn drive(
        &self,
        session: &mut Session,
        ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> Result<String, FailureReason> {
        let schemas = self.tools.get_tool_schemas();
        let tools = (!schemas.is_empty()).then_some(schemas.as_slice());
        let limits = &self.options.limits;
        let mut consecutive_failures = 0u32;

        for iteration in 0..limits.max_iterations {
            if cancel.is_cancelled() {
                return Err(FailureReason::Cancelled);
            }
            session.state = AgentState::AwaitingModel;
            session.iterations = iteration + 1;
            tracing::debug!("Agent iteration {}", iteration + 1);

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FailureReason::Cancelled),
                response = self.llm.chat_completion(
                    &self.options.model,
                    session.transcript.messages(),
                    tools,
                ) => response.map_err(FailureReason::Inference)?,
            };
            if let Some(usage) = &response.usage {
                session.usage.add(usage);
            }

            let (thought, calls) = match response.into_turn().map_err(FailureReason::Inference)? {
                AssistantTurn::Final { content } => {
                    session
                        .log
                        .push(LogEntryType::Response, truncate_for_log(&content, 2000));
                    session.transcript.push_final(content.clone());
                    session.state = AgentState::Done;
                    return Ok(content);
                }
                AssistantTurn::Call { thought, calls } => (thought, calls),
            };

            if let Some(thought) = &thought {
                session
                    .log
                    .push(LogEntryType::Thinking, truncate_for_log(thought, 1000));
            }
            session.state = AgentState::Dispatching;

            let mut results: Vec<FunctionResult> = Vec::with_capacity(calls.len());
            let mut abort = None;
            for call in &calls {
                if abort.is_some() {
                    results.push(FunctionResult {
                        call_id: call.id.clone(),
                        name: call.function.name.clone(),
                        outcome: Err(RegistryError::Execution {
                            name: call.function.name.clone(),
                            message: "not executed: session aborted after repeated failures"
                                .to_string(),
                        }),
                    });
                    continue;
                }

                session.log.push(
                    LogEntryType::ToolCall,
                    format!(
                        "Calling function: {} with args: {}",
                        call.function.name,
                        truncate_for_log(&call.function.arguments, 500)
                    ),
                );

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FailureReason::Cancelled),
                    result = self.tools.invoke_call(call, ctx) => result,
                };

                let content = result.to_content();
                if result.is_error() {
                    consecutive_failures += 1;
                    session
                        .log
                        .push(LogEntryType::Error, truncate_for_log(&content, 1000));
                    if consecutive_failures >= limits.max_consecutive_tool_failures {
                        abort = Some(FailureReason::RepeatedToolFailures {
                            count: consecutive_failures,
                            last_error: content,
                        });
                    }
                } else {
                    consecutive_failures = 0;
                    session
                        .log
                        .push(LogEntryType::ToolResult, truncate_for_log(&content, 1000));
                }
                results.push(result);
            }

            session.transcript.push_exchange(thought, calls, &results);
            if let Some(reason) = abort {
                return Err(reason);
            }
        }

        Err(FailureReason::MaxIterations(limits.max_iterations))
    }

    /// Validate the final answer and run the optional formatting pass.
    async fn finish(
        &self,
        query: &str,
        answer: String,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let mut result = match self.options.output.validate(&answer) {
            Ok(result) => result,
            Err(err) => {
                session.log.push(LogEntryType::Error, err.to_string());
                return SessionOutcome::Rejected(err);
            }
        };

        if self.options.format_output {
            let formatter = Formatter::new(self.llm.clone(), self.options.model.clone());
            let formatted = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                formatted = formatter.format(query, &result) => Some(formatted),
            };
            match formatted {
                Some(Ok((markdown, usage))) => {
                    if let Some(usage) = &usage {
                        session.usage.add(usage);
                    }
                    result.formatted = Some(markdown);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "formatting failed, keeping structured result")
                }
                None => tracing::warn!("formatting skipped: session cancelled"),
            }
        }

        SessionOutcome::Done(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::llm::testing::{call, text, Scripted, ScriptedClient};
    use crate::llm::{ChatResponse, RetryConfig, Role, ToolCall};
    use crate::tools::{ParamKind, ParamSpec, Tool};
    use crate::validate::{FieldSpec, FieldType};

    use super::super::transcript::is_balanced as balanced;

    struct Calculator;

    #[async_trait]
    impl Tool for Calculator {
        fn name(&self) -> &str {
            "calculator"
        }

        fn description(&self) -> &str {
            "Evaluate `a+b` or `a*b`"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            vec![ParamSpec::required("expr", ParamKind::String, "Expression")]
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            let expr = args["expr"].as_str().unwrap_or_default().replace(' ', "");
            let (op, (a, b)) = if let Some(parts) = expr.split_once('+') {
                ('+', parts)
            } else if let Some(parts) = expr.split_once('*') {
                ('*', parts)
            } else {
                anyhow::bail!("unsupported expression '{}'", expr);
            };
            let (a, b): (i64, i64) = (a.parse()?, b.parse()?);
            Ok(match op {
                '+' => a + b,
                _ => a * b,
            }
            .to_string())
        }
    }

    struct Flaky;

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            Vec::new()
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct Slow {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Takes a long time"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            Vec::new()
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("finished".to_string())
        }
    }

    fn registry() -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
        let started = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Calculator));
        registry.register(Arc::new(Flaky));
        registry.register(Arc::new(Slow {
            started: started.clone(),
        }));
        (Arc::new(registry), started)
    }

    fn agent_with(llm: Arc<dyn LlmClient>, options: AgentOptions) -> Agent {
        Agent::new(llm, registry().0, options)
    }

    fn agent(llm: Arc<dyn LlmClient>) -> Agent {
        agent_with(llm, AgentOptions::default())
    }

    fn calculator_script() -> Vec<ChatResponse> {
        vec![
            call("c1", "calculator", json!({"expr": "2+2"})),
            call("c2", "calculator", json!({"expr": "4*2"})),
            text("8"),
        ]
    }

    fn failure(report: &SessionReport) -> &FailureReason {
        match &report.outcome {
            SessionOutcome::Failed(reason) => reason,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    fn result(report: &SessionReport) -> &StructuredResult {
        match &report.outcome {
            SessionOutcome::Done(result) => result,
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_sequential_calls_then_answer() {
        let llm = Arc::new(ScriptedClient::replies(calculator_script()));
        let report = agent(llm.clone())
            .run("what is 2+2 and then double it", &CancellationToken::new())
            .await;

        assert_eq!(result(&report).data, json!(8));
        assert_eq!(report.final_state, AgentState::Done);
        assert_eq!(report.iterations, 3);
        assert!(balanced(&report.transcript));

        let requests = llm.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].len(), 2);
        let second = &requests[1];
        assert_eq!(second[2].calls()[0].id, "c1");
        assert_eq!(second[3].role, Role::Tool);
        assert_eq!(second[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(second[3].content.as_deref(), Some("4"));
        assert_eq!(requests[2][5].content.as_deref(), Some("8"));
        for request in &requests {
            assert!(balanced(request));
        }
    }

    #[tokio::test]
    async fn unknown_function_is_reported_and_model_recovers() {
        let llm = Arc::new(ScriptedClient::replies(vec![
            call("c1", "send_email", json!({"to": "boss@example.com"})),
            text("I can't send email, but here is the draft."),
        ]));
        let report = agent(llm.clone())
            .run("email my boss", &CancellationToken::new())
            .await;

        assert!(report.is_success());
        let second = &llm.requests()[1];
        let reply = second.last().unwrap();
        assert_eq!(reply.tool_call_id.as_deref(), Some("c1"));
        assert!(reply
            .content
            .as_deref()
            .unwrap()
            .starts_with("Error: unknown function `send_email`"));
    }

    #[tokio::test]
    async fn timeout_then_retry_gives_same_result() {
        let baseline = agent(Arc::new(ScriptedClient::replies(calculator_script())))
            .run("what is 2+2 and then double it", &CancellationToken::new())
            .await;

        let mut script = vec![Scripted::Delayed(
            Duration::from_millis(500),
            Ok(call("c1", "calculator", json!({"expr": "2+2"}))),
        )];
        script.extend(calculator_script().into_iter().map(|r| Scripted::Reply(Ok(r))));
        let inner = Arc::new(ScriptedClient::new(script));
        let retrying = Arc::new(RetryingClient::new(
            inner.clone(),
            RetryConfig {
                base_delay: Duration::from_millis(1),
                request_timeout: Duration::from_millis(100),
                ..RetryConfig::default()
            },
        ));

        let report = agent(retrying)
            .run("what is 2+2 and then double it", &CancellationToken::new())
            .await;

        assert_eq!(result(&report).data, result(&baseline).data);
        assert_eq!(report.iterations, baseline.iterations);
        assert_eq!(inner.request_count(), 4);
    }

    #[tokio::test]
    async fn three_consecutive_failures_end_session() {
        let llm = Arc::new(ScriptedClient::replies(vec![
            call("c1", "flaky", json!({})),
            call("c2", "flaky", json!({})),
            call("c3", "flaky", json!({})),
            text("never requested"),
        ]));
        let report = agent(llm.clone()).run("q", &CancellationToken::new()).await;

        match failure(&report) {
            FailureReason::RepeatedToolFailures { count, last_error } => {
                assert_eq!(*count, 3);
                assert!(last_error.contains("upstream unavailable"));
            }
            other => panic!("unexpected failure {other:?}"),
        }
        assert_eq!(report.final_state, AgentState::Failed);
        assert_eq!(llm.request_count(), 3);
        assert!(balanced(&report.transcript));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let llm = Arc::new(ScriptedClient::replies(vec![
            call("c1", "flaky", json!({})),
            call("c2", "flaky", json!({})),
            call("c3", "calculator", json!({"expr": "1+1"})),
            call("c4", "flaky", json!({})),
            call("c5", "flaky", json!({})),
            text("2"),
        ]));
        let report = agent(llm).run("q", &CancellationToken::new()).await;
        assert_eq!(result(&report).data, json!(2));
    }

    #[tokio::test]
    async fn failure_cap_mid_turn_still_answers_every_call() {
        let calls: Vec<ToolCall> = (1..=4)
            .map(|i| ToolCall::new(format!("c{i}"), "flaky", "{}"))
            .collect();
        let llm = Arc::new(ScriptedClient::replies(vec![ChatResponse {
            tool_calls: Some(calls),
            ..Default::default()
        }]));
        let report = agent(llm).run("q", &CancellationToken::new()).await;

        assert!(matches!(
            failure(&report),
            FailureReason::RepeatedToolFailures { count: 3, .. }
        ));
        assert!(balanced(&report.transcript));
        let last = report.transcript.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("c4"));
        assert!(last.content.as_deref().unwrap().contains("not executed"));
    }

    #[tokio::test]
    async fn iteration_cap_fails_session() {
        let llm = Arc::new(ScriptedClient::replies(calculator_script()));
        let options = AgentOptions {
            limits: AgentLimits {
                max_iterations: 2,
                ..AgentLimits::default()
            },
            ..AgentOptions::default()
        };
        let report = agent_with(llm.clone(), options)
            .run("q", &CancellationToken::new())
            .await;

        assert!(matches!(failure(&report), FailureReason::MaxIterations(2)));
        assert_eq!(report.iterations, 2);
        assert_eq!(llm.request_count(), 2);
    }

    #[tokio::test]
    async fn auth_error_fails_without_retry() {
        let inner = Arc::new(ScriptedClient::new(vec![Scripted::Reply(Err(LlmError::Auth {
            status: 401,
            message: "Invalid API Key".to_string(),
        }))]));
        let retrying = Arc::new(RetryingClient::new(inner.clone(), RetryConfig::default()));
        let report = agent(retrying).run("q", &CancellationToken::new()).await;

        assert!(matches!(
            failure(&report),
            FailureReason::Inference(LlmError::Auth { status: 401, .. })
        ));
        assert_eq!(inner.request_count(), 1);
    }

    #[tokio::test]
    async fn cancel_mid_dispatch_commits_nothing() {
        let (tools, started) = registry();
        let llm = Arc::new(ScriptedClient::replies(vec![
            call("c1", "calculator", json!({"expr": "1+1"})),
            call("c2", "slow", json!({})),
        ]));
        let agent = Agent::new(llm, tools, AgentOptions::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watcher = started.clone();
        tokio::spawn(async move {
            while watcher.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), agent.run("q", &cancel))
            .await
            .expect("cancellation should interrupt the slow tool");

        assert!(matches!(failure(&report), FailureReason::Cancelled));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        // system, user, and the first completed exchange only
        assert_eq!(report.transcript.len(), 4);
        assert!(balanced(&report.transcript));
    }

    #[tokio::test]
    async fn cancel_during_inference() {
        let llm = Arc::new(ScriptedClient::new(vec![Scripted::Delayed(
            Duration::from_secs(30),
            Ok(text("too late")),
        )]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = agent(llm).run("q", &cancel).await;
        assert!(matches!(failure(&report), FailureReason::Cancelled));
        assert_eq!(report.transcript.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_sends_nothing() {
        let llm = Arc::new(ScriptedClient::replies(vec![text("hi")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = agent(llm.clone()).run("q", &cancel).await;
        assert!(matches!(failure(&report), FailureReason::Cancelled));
        assert_eq!(llm.request_count(), 0);
    }

    fn with_fields(format_output: bool) -> AgentOptions {
        AgentOptions {
            output: OutputSchema::new(vec![FieldSpec::required("title", FieldType::String)]),
            format_output,
            ..AgentOptions::default()
        }
    }

    #[tokio::test]
    async fn answer_matching_fields_is_done() {
        let llm = Arc::new(ScriptedClient::replies(vec![text(r#"{"title": "Zone 2"}"#)]));
        let report = agent_with(llm, with_fields(false))
            .run("q", &CancellationToken::new())
            .await;
        assert_eq!(result(&report).data["title"], "Zone 2");
    }

    #[tokio::test]
    async fn answer_missing_fields_is_rejected_with_raw() {
        let llm = Arc::new(ScriptedClient::replies(vec![text("Sorry, nothing found.")]));
        let report = agent_with(llm, with_fields(false))
            .run("q", &CancellationToken::new())
            .await;

        match &report.outcome {
            SessionOutcome::Rejected(err) => assert_eq!(err.raw, "Sorry, nothing found."),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(report.final_state, AgentState::Done);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn formatter_output_is_attached() {
        let llm = Arc::new(ScriptedClient::replies(vec![
            text(r#"{"title": "Zone 2"}"#),
            text("## Zone 2"),
        ]));
        let report = agent_with(llm, with_fields(true))
            .run("q", &CancellationToken::new())
            .await;
        assert_eq!(result(&report).formatted.as_deref(), Some("## Zone 2"));
    }

    #[tokio::test]
    async fn formatter_failure_keeps_result() {
        // second request finds the script exhausted
        let llm = Arc::new(ScriptedClient::replies(vec![text(r#"{"title": "Zone 2"}"#)]));
        let report = agent_with(llm, with_fields(true))
            .run("q", &CancellationToken::new())
            .await;

        let result = result(&report);
        assert_eq!(result.data["title"], "Zone 2");
        assert!(result.formatted.is_none());
    }

    #[tokio::test]
    async fn report_serializes_status_and_log() {
        let llm = Arc::new(ScriptedClient::replies(calculator_script()));
        let report = agent(llm).run("q", &CancellationToken::new()).await;
        let value = report.to_json();

        assert_eq!(value["status"], "done");
        assert_eq!(value["final_state"], "done");
        assert_eq!(value["result"]["data"], json!(8));
        assert_eq!(value["log"][0]["entry_type"], "tool_call");
        assert_eq!(value["transcript"][0]["role"], "system");
    }
}
