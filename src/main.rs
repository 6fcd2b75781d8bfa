//! Famulus binary entry point
//!
//! Builds every collaborator explicitly (config, backend, tool registry,
//! brain, bus, transport, scheduler, cycles) and supervises the scheduler
//! and cycle runner until one of them fails fatally.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use famulus::agent::Brain;
use famulus::backend::create_backend;
use famulus::bus::{InboundMessage, MessageBus};
use famulus::chat::{ChatClient, ConsoleChatClient};
use famulus::config::Config;
use famulus::cycles::CycleRunner;
use famulus::scheduler::MessageScheduler;
use famulus::tools::{EchoTool, ToolRegistry};

#[derive(Parser)]
#[command(name = "famulus", about = "Personal chat-room AI agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent with the console transport
    Start,
    /// Print the resolved configuration
    Config,
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
    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start().await,
        Command::Config => show_config(),
    }
}

fn show_config() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    println!("config file: {}", Config::path().display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn start() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    std::fs::create_dir_all(config.workspace_path()).context("creating workspace")?;
    info!(data_dir = %config.data_dir.display(), backend = %config.backend, "Starting");

    let backend = create_backend(&config).context("creating inference backend")?;

    // The deployment assembles the tool catalogue; the core only ships the
    // echo tool for smoke runs.
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    let registry = Arc::new(registry);

    let brain = Arc::new(Brain::new(config.clone(), backend, registry));
    let bus = Arc::new(MessageBus::new());
    let client: Arc<dyn ChatClient> = Arc::new(ConsoleChatClient::new("famulus", bus.clone()));
    brain.set_agent_username(client.username()).await;

    spawn_console_reader(bus.clone());
    spawn_console_printer(bus.clone());

    let scheduler = MessageScheduler::new(bus, client, brain.clone());
    let cycles = CycleRunner::new(brain, &config);

    info!("Listening for messages...");
    tokio::select! {
        result = scheduler.run() => result.context("scheduler halted"),
        result = cycles.run() => result.context("cycle runner halted"),
    }
}

/// Feed stdin lines into the bus as console-room messages.
fn spawn_console_reader(bus: Arc<MessageBus>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    let msg = InboundMessage::new(
                        &Uuid::new_v4().simple().to_string(),
                        "operator",
                        "console",
                        line.trim(),
                    );
                    if bus.publish_inbound(msg).await.is_err() {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
}

/// Print outbound replies from the bus.
fn spawn_console_printer(bus: Arc<MessageBus>) {
    tokio::spawn(async move {
        while let Some(out) = bus.consume_outbound().await {
            println!("[{}] {}", out.room_id, out.text);
        }
    });
}
