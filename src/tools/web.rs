//! Web access tools: search and fetch pages.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::html::{clean_html, decode_entities};
use super::{truncate_chars, PageSource, ParamKind, ParamSpec, StoredPage, Tool, ToolContext};
use crate::config::ToolsConfig;

const DUCKDUCKGO_HTML: &str = "https://html.duckduckgo.com/html/";
const MAX_SEARCH_RESULTS: usize = 10;

fn http_client(config: &ToolsConfig) -> anyhow::Result<Client> {
    Ok(Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(config.fetch_timeout)
        .build()?)
}

/// Accept only absolute http(s) URLs.
pub(crate) fn parse_page_url(raw: &str) -> anyhow::Result<url::Url> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => anyhow::bail!("unsupported URL scheme '{}', expected http or https", other),
    }
}

/// Format a stored page for the model: header lines, then the cleaned text.
pub(crate) fn page_summary(
    id: &uuid::Uuid,
    url: &str,
    source: PageSource,
    status: Option<u16>,
    text: &str,
    max_chars: usize,
) -> String {
    let mut out = format!("content_id: {}\nurl: {}\nsource: {}\n", id, url, source);
    if let Some(status) = status {
        out.push_str(&format!("status: {}\n", status));
    }
    out.push('\n');

    let (shown, truncated) = truncate_chars(text, max_chars);
    if shown.is_empty() {
        out.push_str("[page has no readable text]");
    } else {
        out.push_str(shown);
    }
    if truncated {
        out.push_str(&format!(
            "\n... [content truncated at {} characters; use extract_field with this content_id to read specific elements]",
            max_chars
        ));
    }
    out
}

/// Fetch a page over plain HTTP, without running scripts.
pub struct FetchPage {
    client: Client,
    max_chars: usize,
}

impl FetchPage {
    pub fn new(config: &ToolsConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            max_chars: config.max_content_chars,
        })
    }
}

#[async_trait]
impl Tool for FetchPage {
    fn name(&self) -> &str {
        "fetch_page"
    }

    fn description(&self) -> &str {
        "Fetch a web page over HTTP and return its readable text along with a content_id. Pass the content_id to extract_field to pull specific elements out of the full page. Does not run JavaScript; use render_page for pages that build their content client-side."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("url", ParamKind::String, "Absolute http(s) URL to fetch"),
            ParamSpec::optional(
                "max_chars",
                ParamKind::Integer,
                "Maximum characters of page text to return",
            ),
        ]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let raw_url = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;
        let url = parse_page_url(raw_url)?;
        let max_chars = args["max_chars"]
            .as_u64()
            .map_or(self.max_chars, |n| (n as usize).min(self.max_chars).max(1));

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();

        if !status.is_success() {
            anyhow::bail!("HTTP error: {}", status);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        let body = response.text().await?;

        let is_html = content_type.is_empty() || content_type.contains("html");
        let text = if is_html { clean_html(&body) } else { body.clone() };

        tracing::debug!(url = %final_url, bytes = body.len(), "fetched page");

        let id = ctx
            .content
            .insert(StoredPage {
                url: final_url.clone(),
                html: body,
                source: PageSource::Fetched,
            })
            .await;

        Ok(page_summary(
            &id,
            &final_url,
            PageSource::Fetched,
            Some(status.as_u16()),
            &text,
            max_chars,
        ))
    }
}

/// Search the web through DuckDuckGo's HTML endpoint.
pub struct WebSearch {
    client: Client,
    endpoint: String,
}

impl WebSearch {
    pub fn new(config: &ToolsConfig) -> anyhow::Result<Self> {
        Self::with_endpoint(config, DUCKDUCKGO_HTML)
    }

    pub fn with_endpoint(
        config: &ToolsConfig,
        endpoint: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns result titles, snippets and URLs. Use it to find pages to fetch when the query does not name a site."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("query", ParamKind::String, "The search query"),
            ParamSpec::optional(
                "num_results",
                ParamKind::Integer,
                "Maximum number of results to return (default: 5, max: 10)",
            ),
        ]
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' argument"))?;
        let num_results = args["num_results"]
            .as_u64()
            .map_or(5, |n| (n as usize).clamp(1, MAX_SEARCH_RESULTS));

        let url = format!("{}?q={}", self.endpoint, urlencoding::encode(query));
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("search request failed: HTTP {}", status);
        }
        let html = response.text().await?;

        let results = extract_ddg_results(&html, num_results);
        if results.is_empty() {
            Ok(format!("No results found for: {}", query))
        } else {
            Ok(results.join("\n\n"))
        }
    }
}

/// Text of the element that follows `marker`, up to `close`.
fn element_after<'a>(chunk: &'a str, marker: &str, close: &str) -> Option<&'a str> {
    let rest = chunk.split(marker).nth(1)?;
    let start = rest.find('>')? + 1;
    let rest = &rest[start..];
    Some(rest.find(close).map_or(rest, |end| &rest[..end]))
}

/// Target of a result link. DuckDuckGo wraps it in a `/l/?uddg=` redirect.
fn result_href(chunk: &str) -> Option<String> {
    let rest = chunk.split("class=\"result__a\"").nth(1)?;
    let href = rest.split("href=\"").nth(1)?.split('"').next()?;
    let href = decode_entities(href);

    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href
    };
    let parsed = url::Url::parse(&absolute).ok()?;
    let target = parsed
        .query_pairs()
        .find(|(k, _)| k == "uddg")
        .map(|(_, v)| v.into_owned());
    Some(target.unwrap_or(absolute))
}

fn extract_ddg_results(html: &str, limit: usize) -> Vec<String> {
    let mut results = Vec::new();

    for chunk in html.split("result__body\"").skip(1) {
        if results.len() >= limit {
            break;
        }

        let title = element_after(chunk, "class=\"result__a\"", "</a>")
            .map(clean_html)
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }
        let snippet = element_after(chunk, "class=\"result__snippet\"", "</a>")
            .map(clean_html)
            .unwrap_or_default();
        let url = result_href(chunk)
            .or_else(|| {
                element_after(chunk, "class=\"result__url\"", "</a>")
                    .map(|s| decode_entities(s.trim()))
            })
            .unwrap_or_default();

        results.push(format!(
            "{}. **{}**\n{}\nURL: {}",
            results.len() + 1,
            title,
            snippet,
            url
        ));
    }

    results
}
