//! Hearthmind CLI - drive the conversation agent from a terminal.
//!
//! The library is the product; this binary exists to exercise a
//! configured endpoint: one-shot turns, a small REPL, and config
//! inspection. The local action layer is an external collaborator, so
//! the CLI substitutes a handler that logs what would have been executed
//! and reports success.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hearthmind::agent::{ConversationAgent, LogNotifier, TurnOutcome};
use hearthmind::client::ChatClient;
use hearthmind::config::Config;
use hearthmind::tools::{ActionHandler, ActionOutcome, CapabilitySnapshot, ParsedAction};

#[derive(Parser)]
#[command(name = "hearthmind", version, about = "Conversation agent for a voice assistant")]
struct Cli {
    /// Path to the config file (defaults to ~/.hearthmind/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a JSON capability inventory
    #[arg(long, global = true)]
    capabilities: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one user turn and print the reply
    Chat {
        /// The user's text
        text: String,
        /// Conversation id (turns with the same id share a window)
        #[arg(long, default_value = "cli")]
        conversation_id: String,
    },
    /// Interactive conversation loop
    Repl {
        #[arg(long, default_value = "repl")]
        conversation_id: String,
    },
    /// Print the config file path
    ConfigPath,
}

/// Stand-in action layer: logs the call and reports success.
struct EchoActionHandler;

#[async_trait]
impl ActionHandler for EchoActionHandler {
    async fn execute(&self, action: &ParsedAction) -> hearthmind::Result<ActionOutcome> {
        info!(
            domain = %action.domain,
            action = %action.action,
            targets = ?action.targets,
            "Would execute local action"
        );
        Ok(ActionOutcome::success(format!(
            "{}.{} acknowledged",
            action.domain, action.action
        )))
    }
}

/// Load a capability inventory from JSON:
/// `{"light": {"actions": {"turn_on": "Turn a light on"}, "targets": ["light.kitchen"]}}`
fn load_capabilities(path: &PathBuf) -> anyhow::Result<CapabilitySnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading capabilities from {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    let object = value
        .as_object()
        .context("capability inventory must be a JSON object keyed by domain")?;

    let mut snapshot = CapabilitySnapshot::new();
    for (domain, entry) in object {
        if let Some(actions) = entry.get("actions").and_then(|a| a.as_object()) {
            for (action, description) in actions {
                snapshot = snapshot.with_action(
                    domain,
                    action,
                    description.as_str().unwrap_or_default(),
                );
            }
        }
        if let Some(targets) = entry.get("targets").and_then(|t| t.as_array()) {
            for target in targets.iter().filter_map(|t| t.as_str()) {
                snapshot = snapshot.with_target(domain, target);
            }
        }
    }
    Ok(snapshot)
}

fn print_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Answer { speech } => println!("{}", speech),
        TurnOutcome::Interim { text, continuation } => {
            println!("{}", text);
            println!("(continuation token: {})", continuation);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Command::ConfigPath = cli.command {
        println!("{}", Config::path().display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let capabilities = match &cli.capabilities {
        Some(path) => load_capabilities(path)?,
        None => CapabilitySnapshot::new(),
    };

    let backend = Arc::new(ChatClient::new(config.endpoint.clone()));
    let agent = ConversationAgent::new(
        config,
        backend,
        Arc::new(EchoActionHandler),
        Arc::new(LogNotifier),
    )?;

    match cli.command {
        Command::Chat {
            text,
            conversation_id,
        } => {
            let outcome = agent
                .process_turn(&conversation_id, &text, &capabilities)
                .await?;
            print_outcome(&outcome);
        }
        Command::Repl { conversation_id } => {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                line.clear();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }
                if text == "/reset" {
                    agent.reset(&conversation_id).await;
                    println!("(conversation reset)");
                    continue;
                }
                match agent
                    .process_turn(&conversation_id, text, &capabilities)
                    .await
                {
                    Ok(outcome) => print_outcome(&outcome),
                    Err(err) => eprintln!("error: {}", err),
                }
            }
            agent.metrics().emit_usage("repl exit");
        }
        Command::ConfigPath => unreachable!(),
    }

    Ok(())
}
