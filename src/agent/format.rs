//! Optional second pass that turns a validated result into readable Markdown.

use std::sync::Arc;

use crate::llm::{ChatMessage, LlmClient, LlmError, ModelOptions, Usage};
use crate::validate::StructuredResult;

const FORMATTING_SYSTEM_PROMPT: &str = r#"You are a data formatter. You turn raw scraped data into clean, readable Markdown for the person who asked for it.

**Formatting Rules:**
1. Start with a short title that matches the content
2. Use Markdown headers and bullet or numbered lists
3. Put key numbers and statistics in **bold**
4. Keep every value exactly as given; never add data that is not in the input
5. Relate the output to the original request
6. Mention the source and how fresh the data is when the input says so

Reply with the formatted Markdown only."#;

pub struct Formatter {
    llm: Arc<dyn LlmClient>,
    options: ModelOptions,
}

impl Formatter {
    pub fn new(llm: Arc<dyn LlmClient>, options: ModelOptions) -> Self {
        Self { llm, options }
    }

    /// Format `result` for `query`. Returns the Markdown and the tokens spent.
    pub async fn format(
        &self,
        query: &str,
        result: &StructuredResult,
    ) -> Result<(String, Option<Usage>), LlmError> {
        let data = match &result.data {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| result.raw.clone()),
        };

        let messages = [
            ChatMessage::system(FORMATTING_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Original user request: {}\n\nRaw scraped data:\n{}",
                query, data
            )),
        ];

        let response = self.llm.chat_completion(&self.options, &messages, None).await?;
        let usage = response.usage;
        response
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .map(|c| (c, usage))
            .ok_or_else(|| LlmError::Parse("formatter returned no text".to_string()))
    }
}
