//! csm - drive Claude Code from the command line
//!
//! # Usage
//!
//! ```bash
//! # One prompt, print the final answer
//! csm query "summarize src/lib.rs"
//!
//! # One prompt, print every stream-json event
//! csm query --json "list the tests"
//!
//! # Conversation over one session, one turn per stdin line
//! csm chat --model sonnet
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use csm_engine::{Client, EngineConfig, SessionManager, SessionOptions};
use csm_protocol::{EventPayload, EventType};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// csm - Claude Code session manager
#[derive(Parser, Debug)]
#[command(name = "csm", version, about)]
struct Args {
    /// Config file (default: <config dir>/csm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent binary to launch instead of the configured one
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one prompt to completion
    Query {
        prompt: String,

        #[arg(long)]
        model: Option<String>,

        /// Working directory for the agent
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Print raw stream-json events instead of the final text
        #[arg(long)]
        json: bool,
    },
    /// Interactive conversation, one turn per line of stdin
    Chat {
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        cwd: Option<PathBuf>,
    },
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let path = args.config.clone().or_else(EngineConfig::default_path);
    let mut config = match &path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(binary) = &args.binary {
        config.binary = binary.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn options(model: Option<String>, cwd: Option<PathBuf>) -> SessionOptions {
    SessionOptions {
        model,
        cwd,
        ..SessionOptions::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("csm=info,csm_engine=info,csm_protocol=info,csm_core=info")
            }),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Error waiting for Ctrl+C");
            return;
        }
        info!("Interrupted, cancelling");
        shutdown.cancel();
    });

    match args.command {
        Command::Query {
            prompt,
            model,
            cwd,
            json,
        } => run_query(config, &cancel, &prompt, options(model, cwd), json).await,
        Command::Chat { model, cwd } => run_chat(config, &cancel, options(model, cwd)).await,
    }
}

async fn run_query(
    config: EngineConfig,
    cancel: &CancellationToken,
    prompt: &str,
    opts: SessionOptions,
    json: bool,
) -> Result<()> {
    let client = Client::from_config(config).context("Failed to create client")?;

    if !json {
        let response = client
            .query(cancel, prompt, opts)
            .await
            .context("Query failed")?;
        println!("{}", response.text);
        if let Some(err) = response.error {
            bail!("Agent reported an error: {err}");
        }
        info!(
            cost = %response.cost,
            turns = response.num_turns,
            duration_ms = response.duration_ms,
            "Query finished"
        );
        return Ok(());
    }

    let mut stream = client
        .stream(cancel, prompt, opts)
        .context("Failed to start agent")?;
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.events.recv().await {
        if event.raw.is_empty() {
            // Engine-side events have no wire form.
            if let EventPayload::Error(err) = &event.payload {
                eprintln!("error: {}", err.message);
            }
            continue;
        }
        stdout.write_all(&event.raw).context("Failed to write event")?;
        stdout.write_all(b"\n").context("Failed to write event")?;
    }
    stdout.flush().context("Failed to flush stdout")?;

    stream.result.wait(cancel).await.context("Query failed")?;
    Ok(())
}

async fn run_chat(
    config: EngineConfig,
    cancel: &CancellationToken,
    opts: SessionOptions,
) -> Result<()> {
    let manager = SessionManager::from_config(config).context("Failed to create session manager")?;
    let session = manager
        .create(cancel, opts.wait_for_init(true))
        .await
        .context("Failed to start session")?;
    let mut events = session
        .events()
        .await
        .context("Session event stream already taken")?;
    info!(session_id = %session.id(), "Chat session ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome: Result<()> = async {
        loop {
            eprint!("> ");
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line.context("Failed to read stdin")?,
            };
            let Some(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let turn = session.send(cancel, line).await.context("Failed to send turn")?;
            while let Some(event) = events.recv().await {
                match &event.payload {
                    EventPayload::Assistant(msg) if !msg.text.is_empty() => {
                        println!("{}", msg.text);
                    }
                    EventPayload::Error(err) => eprintln!("error: {}", err.message),
                    _ => {}
                }
                if matches!(event.event_type(), EventType::Result | EventType::Error) {
                    break;
                }
            }
            let result = turn.wait(cancel).await.context("Turn failed")?;
            info!(cost = %result.total_cost_usd, "Turn finished");
        }
        Ok(())
    }
    .await;

    let closed = manager.shutdown().await;
    info!(closed, "Chat ended");
    outcome
}
