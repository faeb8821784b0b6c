#![deny(unsafe_code)]

//! Colloquy CLI — interactive chat against the configured provider.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use colloquy_config::AppConfig;
use colloquy_core::{
    ClientCache, Conversation, ConversationId, GenerationCoordinator, MemoryStore, Message,
    MessageId, Model, StaticProviderStore, UserMessage,
};

/// Colloquy — a multi-provider LLM chat client.
#[derive(Parser)]
#[command(name = "colloquy", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "colloquy.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session.
    Chat,

    /// List the models the active provider offers.
    Models,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    // CLI verbosity overrides the configured level.
    let filter = match cli.verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Chat => cmd_chat(config).await?,
        Commands::Models => cmd_models(config).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path).await?)
    } else {
        info!(path = %path.display(), "config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

/// Resolve the active provider's model catalog, falling back to the
/// configured model when the listing is unavailable (offline, or a server
/// that does not implement it).
async fn resolve_catalog(config: &AppConfig) -> Result<Vec<Model>> {
    let provider_config = config.active_provider_config()?;
    let client = ClientCache::create_uncached(&provider_config);

    let configured = Model::new(&config.chat.model, config.chat.provider);
    match client.models.list_models().await {
        Ok(mut models) => {
            if !models.iter().any(|m| m.id == config.chat.model) {
                models.push(configured);
            }
            Ok(models)
        }
        Err(err) => {
            warn!(error = %err, "model listing failed, using configured model only");
            Ok(vec![configured])
        }
    }
}

async fn cmd_models(config: AppConfig) -> Result<()> {
    let models = resolve_catalog(&config).await?;
    for model in models {
        let marker = if model.id == config.chat.model { "*" } else { " " };
        println!("{marker} {:40} {}", model.id, model.name);
    }
    Ok(())
}

async fn cmd_chat(config: AppConfig) -> Result<()> {
    let provider_config = config.active_provider_config()?;
    let catalog = resolve_catalog(&config).await?;

    let providers = Arc::new(StaticProviderStore::new());
    providers.register(provider_config, catalog).await;

    let store = Arc::new(MemoryStore::new());
    let coordinator = GenerationCoordinator::new(store, providers);

    let conversation = Conversation {
        id: ConversationId::new("cli"),
        title: "Interactive session".to_string(),
        provider: config.chat.provider,
        model_id: config.chat.model.clone(),
    };

    println!(
        "Chatting with {} via {} (ctrl-d to exit)",
        conversation.model_id, conversation.provider
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        run_turn(&coordinator, &conversation, line).await?;
    }

    coordinator.cancel(None);
    Ok(())
}

/// Submit one user turn and print the streamed answer as it lands in the
/// store.
async fn run_turn(
    coordinator: &GenerationCoordinator,
    conversation: &Conversation,
    line: &str,
) -> Result<()> {
    let mut messages_rx = coordinator.observe_messages(&conversation.id).await;
    let mut generating_rx = coordinator.observe_generating(&conversation.id);
    let mut errors_rx = coordinator.observe_errors(&conversation.id);

    let previous_answer = last_assistant_id(&messages_rx.borrow());
    coordinator.generate(
        UserMessage::text(MessageId::generate(), line),
        conversation,
    );

    let mut printed = 0usize;
    loop {
        tokio::select! {
            changed = messages_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                printed += print_delta(&messages_rx.borrow(), previous_answer.as_ref(), printed)?;
            }
            idle = generating_rx.wait_for(|generating| !generating) => {
                if idle.is_ok() {
                    // Flush whatever landed between the last change and idle.
                    printed += print_delta(&messages_rx.borrow(), previous_answer.as_ref(), printed)?;
                }
                break;
            }
            Some(kind) = errors_rx.recv() => {
                eprintln!("error: {kind}");
                break;
            }
        }
    }

    if printed > 0 {
        println!();
    }
    Ok(())
}

fn last_assistant_id(messages: &[Message]) -> Option<MessageId> {
    messages
        .iter()
        .rev()
        .find_map(Message::as_assistant)
        .map(|m| m.id.clone())
}

/// Print the part of the current answer that has not been printed yet.
/// Returns how many bytes were written.
fn print_delta(
    messages: &[Message],
    previous_answer: Option<&MessageId>,
    printed: usize,
) -> Result<usize> {
    let Some(answer) = messages
        .iter()
        .rev()
        .find_map(Message::as_assistant)
        .filter(|m| Some(&m.id) != previous_answer)
    else {
        return Ok(0);
    };
    let text = answer.content.as_text();
    if text.len() <= printed {
        return Ok(0);
    }
    let delta = &text[printed..];
    print!("{delta}");
    std::io::stdout().flush()?;
    Ok(delta.len())
}

fn cmd_config(path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::message::MessageContent;
    use colloquy_core::{AssistantMessage, FinishReason};
    use pretty_assertions::assert_eq;

    fn assistant(id: &str, text: &str) -> Message {
        Message::Assistant(AssistantMessage {
            id: MessageId::new(id),
            content: MessageContent::text(text),
            attachments: Vec::new(),
            finish_reason: Some(FinishReason::Stop),
            error: None,
        })
    }

    #[test]
    fn test_last_assistant_id() {
        let messages = vec![
            Message::User(UserMessage::text(MessageId::new("u1"), "q")),
            assistant("a1", "one"),
            Message::User(UserMessage::text(MessageId::new("u2"), "q2")),
            assistant("a2", "two"),
        ];
        assert_eq!(last_assistant_id(&messages).unwrap().as_str(), "a2");
        assert_eq!(last_assistant_id(&[]), None);
    }

    #[test]
    fn test_print_delta_skips_previous_answer() {
        let previous = MessageId::new("a1");
        let messages = vec![assistant("a1", "old answer")];
        // Only the previous turn's answer exists: nothing to print.
        let written = print_delta(&messages, Some(&previous), 0).unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn test_print_delta_tracks_progress() {
        let messages = vec![assistant("a2", "Hello World")];
        let written = print_delta(&messages, None, 6).unwrap();
        assert_eq!(written, 5); // "World"
        let written = print_delta(&messages, None, 11).unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn test_built_config_resolves_local_provider() {
        let config = colloquy_test_utils::config::TestConfigBuilder::new()
            .active(colloquy_config::ProviderKind::Ollama, "llama3")
            .build();
        let resolved = config.active_provider_config().unwrap();
        assert_eq!(resolved.api_url(), "http://localhost:11434/v1");
        assert!(resolved.api_key().is_none());
    }
}
