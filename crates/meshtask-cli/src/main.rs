//! Meshtask CLI
//!
//! Runs the signaling relay, runs an interactive mesh peer, or lists a
//! peer's stored tasks offline.
//!
//! ## Usage
//!
//! ```bash
//! # Start the relay (PORT env var or --port, default 3000)
//! meshtask relay --port 3000
//!
//! # Join the mesh as an interactive peer
//! meshtask peer --relay 127.0.0.1:3000
//!
//! # Join with a fixed identifier and per-peer JSONL logs
//! meshtask peer --peer-id peer-alice --log-dir ./logs
//!
//! # List stored tasks without going online
//! meshtask tasks
//!
//! # Merged timeline of every peer's JSONL log
//! meshtask logs ./logs
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshtask_core::config::{default_data_dir, DEFAULT_RELAY_PORT};
use meshtask_core::logging::{
    entries_for_peer, read_all_entries, write_session_metadata, LoggingBuilder, SessionMetadata,
};
use meshtask_core::{
    MeshConfig, MeshEvent, MeshNode, NodeHandle, Record, RecordStore, RelayClient, RelayServer,
    Storage, TcpConnector,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Meshtask - serverless task sharing over a peer mesh
#[derive(Parser)]
#[command(name = "meshtask")]
#[command(version = "0.1.0")]
#[command(about = "Meshtask - serverless task sharing over a peer mesh")]
#[command(
    long_about = "Every peer keeps its own task store and floods changes to every other peer over direct links. A small relay only introduces peers to each other."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.meshtask/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Interface to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on (falls back to the PORT env var, then 3000)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Join the mesh as an interactive peer
    Peer(PeerArgs),

    /// List stored tasks without connecting
    Tasks {
        /// Include completed tasks
        #[arg(short, long)]
        all: bool,
    },

    /// Print JSONL logs written with --log-dir as one timeline
    Logs {
        /// Directory passed to `peer --log-dir`
        dir: PathBuf,

        /// Only entries written by this peer
        #[arg(long)]
        peer: Option<String>,
    },
}

#[derive(Args)]
struct PeerArgs {
    /// Relay address (host:port)
    #[arg(short, long)]
    relay: Option<String>,

    /// Fixed peer identifier (default: stored or generated)
    #[arg(long)]
    peer_id: Option<String>,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write JSONL logs under this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Host to bind link listeners to
    #[arg(long)]
    listen_host: Option<String>,
}

fn filter_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn setup_logging(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter_for(verbosity))),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Relay { host, port } => {
            setup_logging(cli.verbose);
            run_relay(&host, resolve_port(port)).await
        }
        Commands::Peer(args) => run_peer(cli.verbose, cli.data_dir, args).await,
        Commands::Tasks { all } => {
            setup_logging(cli.verbose);
            let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
            list_stored_tasks(&data_dir, all)
        }
        Commands::Logs { dir, peer } => show_logs(&dir, peer.as_deref()),
    }
}

fn resolve_port(flag: Option<u16>) -> u16 {
    flag.or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_RELAY_PORT)
}

// ═══════════════════════════════════════════════════════════════════════════
// Relay
// ═══════════════════════════════════════════════════════════════════════════

async fn run_relay(host: &str, port: u16) -> Result<()> {
    let server = RelayServer::bind((host, port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", host, port))?;
    println!("Relay listening on {}", server.local_addr()?);
    println!("Press Ctrl+C to stop.");

    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    println!("Relay stopped.");
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Offline inspection
// ═══════════════════════════════════════════════════════════════════════════

fn list_stored_tasks(data_dir: &Path, all: bool) -> Result<()> {
    let config = MeshConfig {
        data_dir: data_dir.to_path_buf(),
        ..MeshConfig::default()
    };
    let storage = Storage::new(config.db_path())?;

    let mut tasks: Vec<Record> = storage
        .list()?
        .into_iter()
        .filter(|r| !r.deleted && (all || !r.is_done()))
        .collect();
    tasks.sort_by_key(|r| r.created_at);

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!("Tasks ({}):", tasks.len());
    for task in &tasks {
        print_task(task);
    }
    Ok(())
}

fn print_task(task: &Record) {
    let mark = if task.is_done() { "✓" } else { "○" };
    println!("  {} {}  {}", mark, task.id, task.text);
}

fn show_logs(dir: &Path, peer: Option<&str>) -> Result<()> {
    let entries = match peer {
        Some(peer) => entries_for_peer(dir, peer),
        None => read_all_entries(dir),
    }
    .with_context(|| format!("cannot read logs under {}", dir.display()))?;

    if entries.is_empty() {
        println!("No log entries.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{} {:<5} {} {}: {}",
            entry.ts,
            entry.level.to_uppercase(),
            entry.peer,
            entry.target,
            entry.msg
        );
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Interactive peer
// ═══════════════════════════════════════════════════════════════════════════

async fn run_peer(verbosity: u8, data_dir: Option<PathBuf>, args: PeerArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::load(path)?,
        None => MeshConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if let Some(relay) = args.relay {
        config.relay_addr = relay;
    }
    if let Some(host) = args.listen_host {
        config.listen_host = host;
    }
    if args.peer_id.is_some() {
        config.peer_id = args.peer_id;
    }

    let storage = Storage::new(config.db_path())?;
    let local = match config.fixed_peer_id() {
        Some(id) => {
            storage.save_peer_id(&id)?;
            id
        }
        None => storage.load_or_create_peer_id()?,
    };
    config.peer_id = Some(local.to_string());
    config.validate()?;

    match &args.log_dir {
        Some(log_dir) => {
            let path = LoggingBuilder::new(log_dir, local.as_str())
                .with_filter(filter_for(verbosity.max(1)))
                .no_console()
                .init()?;
            let session = SessionMetadata::new(vec![local.author_tag()])
                .with_relay(config.relay_addr.clone());
            write_session_metadata(log_dir, &session)?;
            println!("Logging to {}", path.display());
        }
        None => setup_logging(verbosity),
    }

    info!(peer = %local, relay = %config.relay_addr, "Starting peer");
    let relay = RelayClient::connect(config.relay_addr.as_str()).await?;
    let connector = Arc::new(TcpConnector::new(config.listen_host.clone()));
    let node = MeshNode::spawn(&config, storage, connector, relay)?;

    println!("Peer: {}", local);
    println!("Relay: {}", config.relay_addr);
    println!("Data directory: {}", config.data_dir.display());
    println!("Type 'help' for commands.");
    println!();

    tokio::spawn(print_events(node.subscribe()));

    let startup = node.clone();
    tokio::spawn(async move {
        let _ = startup.sync_now().await;
    });

    interactive_loop(&node).await?;

    println!("Shutting down...");
    node.shutdown().await?;
    println!("Goodbye.");
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<MeshEvent>) {
    loop {
        match events.recv().await {
            Ok(MeshEvent::Notice { level, message }) => println!("[{}] {}", level, message),
            Ok(MeshEvent::LinkStateChanged { peer, state }) => {
                println!("[link] {} {}", peer, state)
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

const HELP: &str = "\
Commands:
  add <text>    create a task
  done <id>     complete a task (unique id prefix is enough)
  rm <id>       delete a task
  ls            list pending and done tasks
  sync          handshake with every connected peer
  push          overwrite every connected peer with local state
  clear         wipe every peer's store
  peers         show links
  done-all      complete every pending task
  rm-pending    delete every pending task
  rm-done       delete every done task
  quit          exit";

async fn interactive_loop(node: &NodeHandle) -> Result<()> {
    let stdin = tokio::io::stdin();
    let reader = tokio::io::BufReader::new(stdin);
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match run_command(node, line).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("Read error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }
    Ok(())
}

/// Run one input line; returns `false` when the user asked to quit
async fn run_command(node: &NodeHandle, line: &str) -> Result<bool> {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "add" => match node.create_task(rest).await? {
            Some(task) => println!("Added {}", task.id),
            None => println!("Nothing to add."),
        },
        "done" => {
            let id = resolve_id(node, rest).await?;
            node.complete_task(id).await?;
        }
        "rm" => {
            let id = resolve_id(node, rest).await?;
            node.delete_task(id).await?;
        }
        "ls" => {
            let tasks = node.list_tasks().await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            let (done, pending): (Vec<&Record>, Vec<&Record>) =
                tasks.iter().partition(|t| t.is_done());
            for task in pending.into_iter().chain(done) {
                print_task(task);
            }
        }
        "sync" => {
            node.sync_now().await?;
        }
        "push" => {
            node.force_push().await?;
        }
        "clear" => node.clear_all().await?,
        "peers" => {
            let peers = node.peers().await?;
            if peers.is_empty() {
                println!("No peers.");
            }
            for info in peers {
                let role = if info.initiator { "initiator" } else { "responder" };
                println!("  {}  {}  ({})", info.peer, info.state, role);
            }
        }
        "done-all" => node.complete_all_pending().await?,
        "rm-pending" => node.delete_all_pending().await?,
        "rm-done" => node.delete_all_done().await?,
        "help" => println!("{}", HELP),
        "quit" | "exit" => return Ok(false),
        other => println!("Unknown command: {} (try 'help')", other),
    }
    Ok(true)
}

/// Expand a unique id prefix against the live listing
async fn resolve_id(node: &NodeHandle, input: &str) -> Result<String> {
    anyhow::ensure!(!input.is_empty(), "missing task id");
    let tasks = node.list_tasks().await?;
    let matches: Vec<&Record> = tasks.iter().filter(|t| t.id.starts_with(input)).collect();
    Ok(match matches.as_slice() {
        [only] => only.id.clone(),
        _ => input.to_string(),
    })
}
