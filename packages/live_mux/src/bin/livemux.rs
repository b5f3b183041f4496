use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

use agent_events::{EventKind, TimelineItem};
use live_mux::config::{FileConfig, MuxConfig, load_config};
use live_mux::history::HistoryClient;
use live_mux::registry::UpdateMux;

#[derive(Parser)]
#[command(name = "livemux")]
#[command(about = "Live-update multiplexer client for agent conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to ~/.livemux)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations known to the backend
    List,

    /// Send a message to a conversation
    Send {
        conversation_id: String,
        message: String,
    },

    /// Follow live updates for a conversation; prints the merged timeline on exit
    Watch { conversation_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "live_mux=debug,agent_events=debug,info"
    } else {
        "live_mux=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not find home directory")?
            .join(".livemux"),
    };
    let file_config: FileConfig = load_config(&config_dir)
        .extract()
        .context("invalid configuration")?;
    let config = MuxConfig::from_file(&file_config);

    match cli.command {
        Commands::List => list_command(&config).await,
        Commands::Send {
            conversation_id,
            message,
        } => send_command(&config, &conversation_id, &message).await,
        Commands::Watch { conversation_id } => watch_command(&config, &conversation_id).await,
    }
}

async fn list_command(config: &MuxConfig) -> Result<()> {
    let history = HistoryClient::new(config);
    let conversations = history
        .fetch_conversations()
        .await
        .context("failed to fetch conversations")?;

    if conversations.is_empty() {
        println!("No conversations.");
        return Ok(());
    }
    for conversation in conversations {
        let title = if conversation.title.is_empty() {
            &conversation.id
        } else {
            &conversation.title
        };
        println!(
            "{}  {} ({} messages, {} actions)",
            conversation.id,
            title,
            conversation.messages.len(),
            conversation.actions.len(),
        );
    }
    Ok(())
}

async fn send_command(config: &MuxConfig, conversation_id: &str, message: &str) -> Result<()> {
    let history = HistoryClient::new(config);
    let response = history
        .send_message(conversation_id, message)
        .await
        .context("failed to send message")?;
    println!("{response}");
    Ok(())
}

async fn watch_command(config: &MuxConfig, conversation_id: &str) -> Result<()> {
    let mux = Arc::new(UpdateMux::new(config));
    let history = HistoryClient::new(config);

    // Seed from persisted history so the timeline starts complete.
    match history.fetch_conversation(conversation_id).await {
        Ok(Some(conversation)) => {
            mux.seed_from_history(conversation_id, conversation.messages, &conversation.actions);
        }
        Ok(None) => eprintln!("conversation {conversation_id} not known to the backend yet"),
        Err(e) => eprintln!("warning: could not fetch history: {e}"),
    }

    let _guard = mux.subscribe(conversation_id, |envelope| {
        let tool = envelope.tool.as_deref().unwrap_or("?");
        let line = match envelope.kind {
            EventKind::ToolStart => format!("tool {tool} started"),
            EventKind::ProgressUpdate => format!(
                "  {tool} {:>3.0}% {}",
                envelope.progress.unwrap_or(0.0) * 100.0,
                envelope.message.as_deref().unwrap_or(""),
            ),
            EventKind::ToolResult => match &envelope.error {
                Some(error) => format!("tool {tool} failed: {error}"),
                None => format!("tool {tool} finished"),
            },
            EventKind::Thinking => {
                format!("thinking: {}", envelope.message.as_deref().unwrap_or("..."))
            }
            EventKind::SubscriptionAck => "subscribed".to_string(),
            EventKind::Unknown => return,
        };
        println!("{line}");
    });

    // Live events emitted while disconnected are gone for good, so reconcile
    // every reconnect by re-fetching history and re-seeding.
    {
        let hook_mux = mux.clone();
        let hook_history = history.clone();
        let hook_conversation = conversation_id.to_string();
        mux.on_reconnect(move || {
            let mux = hook_mux.clone();
            let history = hook_history.clone();
            let conversation_id = hook_conversation.clone();
            tokio::spawn(async move {
                match history.fetch_conversation(&conversation_id).await {
                    Ok(Some(conversation)) => {
                        mux.seed_from_history(
                            &conversation_id,
                            conversation.messages,
                            &conversation.actions,
                        );
                        eprintln!("[reconnected; history re-synced]");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "post-reconnect history fetch failed");
                    }
                }
            });
        });
    }

    eprintln!("watching {conversation_id} -- Ctrl-C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    // Final render: history merged with everything that arrived live.
    println!();
    for item in mux.get_timeline(conversation_id) {
        match item {
            TimelineItem::Message { at, message } => {
                println!(
                    "[{}] {:?}: {}",
                    at.format("%H:%M:%S"),
                    message.role,
                    message.content,
                );
            }
            TimelineItem::Invocation { at, invocation } => {
                println!(
                    "[{}] tool {} [{:?}]{}",
                    at.format("%H:%M:%S"),
                    invocation.tool.as_deref().unwrap_or(&invocation.invocation_id),
                    invocation.state,
                    invocation
                        .latest_message
                        .as_deref()
                        .map(|m| format!(" {m}"))
                        .unwrap_or_default(),
                );
            }
        }
    }
    Ok(())
}
