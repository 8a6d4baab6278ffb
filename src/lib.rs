//! # scrape-agent
//!
//! An LLM-driven web data extraction agent.
//!
//! This library provides:
//! - A chat-completions client for OpenAI-compatible endpoints (Groq by default)
//!   with timeouts and bounded retries
//! - A registry of page tools: fetch, headless render, CSS extraction and search
//! - The agent loop that alternates between the model and the registry
//! - Validation of the final answer against declared output fields
//!
//! ## Architecture
//!
//! The agent follows the "tools in a loop" pattern:
//! 1. Build context with the system prompt and the user query
//! 2. Call the model with the registered function declarations
//! 3. Run any requested calls and feed the results back
//! 4. Repeat until the model answers, then validate the answer
//!
//! ## Example
//!
//! ```rust,ignore
//! use scrape_agent::{agent::Agent, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::load(None)?;
//! config.validate()?;
//! let agent = Agent::from_config(&config)?;
//! let report = agent
//!     .run("Top 5 posts on r/health right now", &CancellationToken::new())
//!     .await;
//! ```

pub mod agent;
pub mod config;
pub mod llm;
pub mod tools;
pub mod validate;

pub use config::Config;
