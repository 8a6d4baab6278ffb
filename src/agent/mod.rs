//! Agent module - the scraping agent's control loop.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Build context with the system prompt and the user query
//! 2. Call the model with the registered functions
//! 3. If the model requests calls, run them and feed the results back
//! 4. Repeat until the model answers, a limit is hit, or the run is cancelled
//! 5. Validate the answer and optionally format it

mod agent_loop;
mod format;
mod log;
mod prompt;
mod transcript;

pub use agent_loop::{
    Agent, AgentOptions, AgentState, FailureReason, SessionOutcome, SessionReport,
};
pub use format::Formatter;
pub use log::{truncate_for_log, LogEntryType, SessionLogEntry};
pub use prompt::build_system_prompt;
pub use transcript::Transcript;
