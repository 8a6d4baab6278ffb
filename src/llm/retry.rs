//! Timeout and bounded-retry wrapper around any `LlmClient`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::{ChatMessage, ChatResponse, LlmClient, LlmError, ModelOptions, ToolSchema};

/// Retry and timeout policy for inference calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries for network, timeout, 429 and 5xx failures.
    pub max_retries: u32,
    /// Retries for malformed responses.
    pub max_parse_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum backoff cap.
    pub max_delay: Duration,
    /// Multiplier per consecutive retry (typically 2.0).
    pub multiplier: f64,
    /// Upper bound on a single attempt.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_parse_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff plus up to 25% random jitter.
    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff_for(retry);
        let jitter_ms = (base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Applies a per-attempt timeout and bounded retries to an inner client.
///
/// The transcript is only borrowed, so a retried attempt sends exactly the same
/// request as the failed one.
pub struct RetryingClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn chat_completion(
        &self,
        options: &ModelOptions,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatResponse, LlmError> {
        let mut retries = 0u32;
        let mut parse_retries = 0u32;

        loop {
            let attempt = tokio::time::timeout(
                self.config.request_timeout,
                self.inner.chat_completion(options, messages, tools),
            )
            .await
            .unwrap_or_else(|_| {
                Err(LlmError::Timeout(format!(
                    "no response within {:?}",
                    self.config.request_timeout
                )))
            });

            let err = match attempt {
                Ok(response) if response.is_empty() => {
                    LlmError::Parse("model returned an empty message".to_string())
                }
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let may_retry = if matches!(err, LlmError::Parse(_)) {
                parse_retries < self.config.max_parse_retries
            } else {
                err.is_retryable() && retries < self.config.max_retries
            };
            if !may_retry {
                return Err(err);
            }

            let delay = self.config.delay_for(retries + parse_retries);
            if matches!(err, LlmError::Parse(_)) {
                parse_retries += 1;
            } else {
                retries += 1;
            }
            tracing::warn!(
                error = %err,
                retries,
                parse_retries,
                delay_ms = delay.as_millis() as u64,
                "inference attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
