//! Configuration management for scrape-agent.
//!
//! Values are layered: built-in defaults, then an optional config file
//! (`.yaml`/`.yml` or `.json`), then environment variables. The binary applies
//! CLI flags last and calls [`Config::validate`].
//!
//! Environment variables:
//! - `GROQ_API_KEY` - Required unless `LLM_API_KEY` or `api_key` in the config file is set.
//! - `LLM_API_BASE` - Optional. Defaults to `https://api.groq.com/openai/v1`.
//! - `LLM_MODEL` - Optional. Defaults to `llama3-70b-8192`.
//! - `MAX_ITERATIONS` - Optional. Maximum model turns per query. Defaults to `10`.
//! - `REQUEST_TIMEOUT_SECS` - Optional. Per-attempt inference timeout. Defaults to `60`.
//! - `MAX_RETRIES` - Optional. Retries for network/timeout failures. Defaults to `3`.
//! - `BROWSER_COMMAND` - Optional. Headless browser binary for `render_page`. Defaults to `chromium`.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::llm::{ModelOptions, RetryConfig};
use crate::validate::FieldSpec;

pub const DEFAULT_API_BASE: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing API key: set GROQ_API_KEY (or LLM_API_KEY) or `api_key` in the config file")]
    MissingApiKey,

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },
}

/// Bounds on a single agent session.
#[derive(Debug, Clone)]
pub struct AgentLimits {
    /// Maximum number of model turns before the session fails
    pub max_iterations: usize,

    /// Consecutive failed function invocations that abort the session
    pub max_consecutive_tool_failures: u32,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_consecutive_tool_failures: 3,
        }
    }
}

/// Settings for the built-in page tools.
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Cleaned page text handed back to the model is cut to this many chars
    pub max_content_chars: usize,

    /// Timeout for static page fetches and searches
    pub fetch_timeout: Duration,

    /// Timeout for a headless browser render
    pub render_timeout: Duration,

    /// Headless browser binary used by `render_page`
    pub browser_command: String,

    /// User agent for outbound page requests
    pub user_agent: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 6000,
            fetch_timeout: Duration::from_secs(15),
            render_timeout: Duration::from_secs(30),
            browser_command: "chromium".to_string(),
            user_agent: "Mozilla/5.0 (compatible; scrape-agent/0.1)".to_string(),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inference API key
    pub api_key: String,

    /// Base URL of the OpenAI-compatible inference API
    pub api_base: String,

    /// Model name and sampling options
    pub model: ModelOptions,

    /// Session bounds
    pub limits: AgentLimits,

    /// Inference retry and timeout policy
    pub retry: RetryConfig,

    /// Page tool settings
    pub tools: ToolsConfig,

    /// Expected fields of the final answer (empty accepts any answer)
    pub output_fields: Vec<FieldSpec>,

    /// Run the formatting pass over successful results
    pub format_output: bool,
}

/// On-disk config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_key: Option<String>,
    api_base: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    stop: Option<Vec<String>>,
    max_iterations: Option<usize>,
    max_consecutive_tool_failures: Option<u32>,
    request_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    max_content_chars: Option<usize>,
    fetch_timeout_secs: Option<u64>,
    render_timeout_secs: Option<u64>,
    browser_command: Option<String>,
    user_agent: Option<String>,
    output_fields: Vec<FieldSpec>,
    format_output: Option<bool>,
}

impl Config {
    /// Load configuration from an optional file and the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingApiKey` if no API key is configured anywhere.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from an optional file and an environment lookup.
    ///
    /// Cross-field checks are left to [`Config::validate`], which callers run
    /// once every override has been applied.
    pub fn from_sources<F>(file: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match file {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };

        let api_key = env("GROQ_API_KEY")
            .or_else(|| env("LLM_API_KEY"))
            .or(file.api_key)
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let api_base = env("LLM_API_BASE")
            .or(file.api_base)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let mut model = ModelOptions::default();
        if let Some(name) = env("LLM_MODEL").or(file.model) {
            model.model = name;
        }
        if let Some(t) = file.temperature {
            model.temperature = t;
        }
        if let Some(m) = file.max_tokens {
            model.max_tokens = m;
        }
        if let Some(p) = file.top_p {
            model.top_p = p;
        }
        if let Some(stop) = file.stop {
            model.stop = stop;
        }

        let mut limits = AgentLimits::default();
        if let Some(n) = parse_env(&env, "MAX_ITERATIONS")?.or(file.max_iterations) {
            limits.max_iterations = n;
        }
        if let Some(n) = file.max_consecutive_tool_failures {
            limits.max_consecutive_tool_failures = n;
        }

        let mut retry = RetryConfig::default();
        if let Some(secs) = parse_env(&env, "REQUEST_TIMEOUT_SECS")?.or(file.request_timeout_secs) {
            retry.request_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env(&env, "MAX_RETRIES")?.or(file.max_retries) {
            retry.max_retries = n;
        }

        let mut tools = ToolsConfig::default();
        if let Some(n) = file.max_content_chars {
            tools.max_content_chars = n;
        }
        if let Some(secs) = file.fetch_timeout_secs {
            tools.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.render_timeout_secs {
            tools.render_timeout = Duration::from_secs(secs);
        }
        if let Some(cmd) = env("BROWSER_COMMAND").or(file.browser_command) {
            tools.browser_command = cmd;
        }
        if let Some(ua) = file.user_agent {
            tools.user_agent = ua;
        }

        Ok(Self {
            api_key,
            api_base,
            model,
            limits,
            retry,
            tools,
            output_fields: file.output_fields,
            format_output: file.format_output.unwrap_or(false),
        })
    }

    /// Create a config with default settings (useful for testing).
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: ModelOptions::default(),
            limits: AgentLimits::default(),
            retry: RetryConfig::default(),
            tools: ToolsConfig::default(),
            output_fields: Vec::new(),
            format_output: false,
        }
    }

    /// Check cross-field constraints. Run after CLI overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        url::Url::parse(&self.api_base)
            .map_err(|e| ConfigError::InvalidValue("api_base".to_string(), e.to_string()))?;
        self.model
            .validate()
            .map_err(|reason| ConfigError::InvalidValue("model".to_string(), reason))?;
        if self.limits.max_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "max_iterations".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.limits.max_consecutive_tool_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "max_consecutive_tool_failures".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let timeouts = [
            ("request_timeout_secs", self.retry.request_timeout),
            ("fetch_timeout_secs", self.tools.fetch_timeout),
            ("render_timeout_secs", self.tools.render_timeout),
        ];
        for (key, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidValue(
                    key.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }
        if self.tools.max_content_chars == 0 {
            return Err(ConfigError::InvalidValue(
                "max_content_chars".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string())),
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&contents).map_err(|e| parse_err(e.to_string()))
        }
        other => Err(parse_err(format!(
            "unsupported extension {:?}, expected .yaml, .yml or .json",
            other.unwrap_or("")
        ))),
    }
}

fn parse_env<F, T>(env: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    env(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
        })
        .transpose()
}
