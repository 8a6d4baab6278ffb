use crate::llm::{ChatMessage, Role, ToolCall};
use crate::tools::FunctionResult;

/// Conversation history for one session.
///
/// Append-only. Function exchanges go in as a unit, so the history never holds
/// a call without its result.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new(system_prompt: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt), ChatMessage::user(query)],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push_final(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Commit an assistant call turn together with one result per call.
    ///
    /// `results` must answer `calls` one-to-one and in order.
    pub fn push_exchange(
        &mut self,
        thought: Option<String>,
        calls: Vec<ToolCall>,
        results: &[FunctionResult],
    ) {
        debug_assert_eq!(calls.len(), results.len());
        debug_assert!(calls.iter().zip(results).all(|(c, r)| c.id == r.call_id));

        self.messages.push(ChatMessage::assistant_calls(thought, calls));
        self.messages.extend(
            results
                .iter()
                .map(|r| ChatMessage::tool_result(r.call_id.clone(), r.to_content())),
        );
    }

    pub fn is_balanced(&self) -> bool {
        is_balanced(&self.messages)
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }
}

/// Every call turn is followed by exactly its results, in order, and no result
/// appears anywhere else.
pub fn is_balanced(messages: &[ChatMessage]) -> bool {
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.role == Role::Tool {
            return false;
        }
        i += 1;
        for call in msg.calls() {
            let answered = messages.get(i).is_some_and(|r| {
                r.role == Role::Tool && r.tool_call_id.as_deref() == Some(call.id.as_str())
            });
            if !answered {
                return false;
            }
            i += 1;
        }
    }
    true
}
