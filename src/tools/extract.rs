use async_trait::async_trait;
use serde_json::{json, Value};

use super::html::{Document, Selector};
use super::{ParamKind, ParamSpec, Tool, ToolContext};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

/// Run a CSS selector over a previously fetched or rendered page.
pub struct ExtractField;

#[async_trait]
impl Tool for ExtractField {
    fn name(&self) -> &str {
        "extract_field"
    }

    fn description(&self) -> &str {
        "Select elements from a page returned by fetch_page or render_page using a CSS selector (type, .class, #id, [attr], [attr=value], descendant and '>' child combinators, comma groups). Returns the text of each match, or the named attribute when 'attribute' is given."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required(
                "content_id",
                ParamKind::String,
                "content_id returned by fetch_page or render_page",
            ),
            ParamSpec::required("selector", ParamKind::String, "CSS selector"),
            ParamSpec::optional(
                "attribute",
                ParamKind::String,
                "Attribute to read from each match instead of its text (e.g. href)",
            ),
            ParamSpec::optional(
                "limit",
                ParamKind::Integer,
                "Maximum number of values to return (default: 50)",
            ),
        ]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let content_id = args["content_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'content_id' argument"))?;
        let raw_selector = args["selector"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'selector' argument"))?;
        let attribute = args["attribute"].as_str().filter(|a| !a.trim().is_empty());
        let limit = args["limit"]
            .as_u64()
            .map_or(DEFAULT_LIMIT, |n| (n as usize).clamp(1, MAX_LIMIT));

        let selector: Selector = raw_selector
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid selector '{}': {}", raw_selector, e))?;

        let page = ctx.content.get(content_id).await.ok_or_else(|| {
            anyhow::anyhow!(
                "unknown content_id '{}'; fetch or render the page first",
                content_id
            )
        })?;

        let doc = Document::parse(&page.html);
        let matched = doc.select(&selector);
        let values: Vec<String> = matched
            .iter()
            .filter_map(|el| match attribute {
                Some(name) => el.attr(name.trim()).map(str::to_string),
                None => Some(el.text()),
            })
            .filter(|v| !v.is_empty())
            .take(limit)
            .collect();

        tracing::debug!(
            selector = raw_selector,
            matches = matched.len(),
            returned = values.len(),
            "extracted field"
        );

        Ok(json!({
            "content_id": content_id.trim(),
            "url": page.url,
            "selector": raw_selector,
            "matches": matched.len(),
            "values": values,
        })
        .to_string())
    }
}
