//! scrape-agent - command line entry point.
//!
//! Runs one query through the agent and prints the result to stdout. Logs go
//! to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use scrape_agent::agent::{Agent, SessionOutcome, SessionReport};
use scrape_agent::llm::Role;
use scrape_agent::validate::FieldSpec;
use scrape_agent::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "scrape-agent",
    version,
    about = "Answer questions by scraping the web with an LLM agent"
)]
struct Cli {
    /// What to find, in plain language
    #[arg(required = true, num_args = 1..)]
    query: Vec<String>,

    /// Config file (.yaml, .yml or .json)
    #[arg(short, long, env = "SCRAPE_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Model name
    #[arg(short, long)]
    model: Option<String>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Maximum tokens per model reply
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Maximum model turns before giving up
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Expected answer field, repeatable. A trailing `?` marks it optional.
    #[arg(short = 'f', long = "field", value_name = "NAME:TYPE[?]")]
    fields: Vec<FieldSpec>,

    /// Rewrite the result as readable Markdown with a second model pass
    #[arg(long)]
    format: bool,

    /// Print the whole session report as JSON
    #[arg(long)]
    json: bool,

    /// Print the conversation transcript to stderr
    #[arg(long)]
    show_transcript: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "scrape_agent=debug"
    } else {
        "scrape_agent=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.model.model = model;
    }
    if let Some(t) = cli.temperature {
        config.model.temperature = t;
    }
    if let Some(m) = cli.max_tokens {
        config.model.max_tokens = m;
    }
    if let Some(n) = cli.max_iterations {
        config.limits.max_iterations = n;
    }
    if !cli.fields.is_empty() {
        config.output_fields = cli.fields;
    }
    config.format_output |= cli.format;
    config.validate()?;

    info!(
        "Loaded configuration: model={}, api_base={}",
        config.model.model, config.api_base
    );

    let agent = Agent::from_config(&config)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling session");
            trigger.cancel();
        }
    });

    let query = cli.query.join(" ");
    let report = agent.run(&query, &cancel).await;

    if cli.show_transcript {
        print_transcript(&report);
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    }

    match &report.outcome {
        SessionOutcome::Done(result) => {
            if !cli.json {
                match (&result.formatted, &result.data) {
                    (Some(markdown), _) => println!("{}", markdown),
                    (None, serde_json::Value::String(text)) => println!("{}", text),
                    (None, data) => println!("{}", serde_json::to_string_pretty(data)?),
                }
            }
        }
        SessionOutcome::Rejected(err) => {
            eprintln!("Answer did not match the expected fields:");
            for problem in &err.problems {
                eprintln!("  - {}", problem);
            }
            eprintln!("Raw answer:\n{}", err.raw);
        }
        SessionOutcome::Failed(reason) => {
            eprintln!("Error: {}", reason);
        }
    }
    Ok(ExitCode::from(exit_status(&report.outcome)))
}

const EXIT_DONE: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_REJECTED: u8 = 2;

/// Process exit status for a finished session.
fn exit_status(outcome: &SessionOutcome) -> u8 {
    match outcome {
        SessionOutcome::Done(_) => EXIT_DONE,
        SessionOutcome::Failed(_) => EXIT_FAILED,
        SessionOutcome::Rejected(_) => EXIT_REJECTED,
    }
}

fn print_transcript(report: &SessionReport) {
    for message in &report.transcript {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        if message.role == Role::System {
            eprintln!("[system] ({} chars)", message.content.as_deref().unwrap_or("").len());
            continue;
        }
        if let Some(content) = &message.content {
            match &message.tool_call_id {
                Some(id) => eprintln!("[{} {}] {}", role, id, content),
                None => eprintln!("[{}] {}", role, content),
            }
        }
        for call in message.calls() {
            eprintln!(
                "[{} -> {}] {}({})",
                role, call.id, call.function.name, call.function.arguments
            );
        }
    }
    eprintln!(
        "-- {} model turns, {} tokens",
        report.iterations, report.usage.total_tokens
    );
}
