//! Headless-browser rendering for pages that build their content with scripts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::html::{clean_html, Document, Selector};
use super::web::{page_summary, parse_page_url};
use super::{PageSource, ParamKind, ParamSpec, StoredPage, Tool, ToolContext};

/// Produces the post-script DOM of a page.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn render(&self, url: &str) -> anyhow::Result<String>;
}

/// Runs a Chromium-compatible binary with `--dump-dom`.
pub struct ChromiumBackend {
    command: String,
    timeout: Duration,
}

impl ChromiumBackend {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn render(&self, url: &str) -> anyhow::Result<String> {
        // Leave part of the budget for process startup and DOM serialisation.
        let budget_ms = (self.timeout.as_millis() / 2).max(1000);

        let child = Command::new(&self.command)
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--no-first-run")
            .arg(format!("--virtual-time-budget={}", budget_ms))
            .arg("--dump-dom")
            .arg(url)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => anyhow::bail!("failed to launch browser '{}': {}", self.command, e),
            Err(_) => anyhow::bail!("browser render timed out after {:?}", self.timeout),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            anyhow::bail!("browser exited with {}: {}", output.status, tail);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Render a page in a headless browser, then behave like `fetch_page`.
pub struct RenderPage {
    backend: Arc<dyn BrowserBackend>,
    max_chars: usize,
}

impl RenderPage {
    pub fn new(backend: Arc<dyn BrowserBackend>, max_chars: usize) -> Self {
        Self { backend, max_chars }
    }
}

#[async_trait]
impl Tool for RenderPage {
    fn name(&self) -> &str {
        "render_page"
    }

    fn description(&self) -> &str {
        "Load a page in a headless browser so client-side scripts run, then return its readable text and a content_id for extract_field. Slower than fetch_page; use it when fetch_page returns little or no content."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("url", ParamKind::String, "Absolute http(s) URL to render"),
            ParamSpec::optional(
                "wait_for",
                ParamKind::String,
                "CSS selector that must be present in the rendered page",
            ),
        ]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let raw_url = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;
        let url = parse_page_url(raw_url)?;
        let wait_for = args["wait_for"]
            .as_str()
            .map(|s| {
                s.parse::<Selector>()
                    .map_err(|e| anyhow::anyhow!("invalid wait_for selector '{}': {}", s, e))
            })
            .transpose()?;

        let html = self.backend.render(url.as_str()).await?;

        if let (Some(selector), Some(raw)) = (&wait_for, args["wait_for"].as_str()) {
            if Document::parse(&html).select(selector).is_empty() {
                anyhow::bail!("selector '{}' matched nothing in the rendered page", raw);
            }
        }

        tracing::debug!(url = %url, bytes = html.len(), "rendered page");

        let text = clean_html(&html);
        let id = ctx
            .content
            .insert(StoredPage {
                url: url.to_string(),
                html,
                source: PageSource::Rendered,
            })
            .await;

        Ok(page_summary(
            &id,
            url.as_str(),
            PageSource::Rendered,
            None,
            &text,
            self.max_chars,
        ))
    }
}
