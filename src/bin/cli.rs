//! Grapevine CLI application

use grapevine::{command, GrapevineNode, NodeConfig, Result};
use clap::{Parser, Subcommand};
use std::process;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "grapevine")]
#[command(about = "Serverless peer-to-peer messaging with proof-of-work spam protection")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Port to announce; messages are exchanged on port + 2
    #[arg(short, long, default_value_t = grapevine::DEFAULT_PORT)]
    port: u16,

    /// Bootstrap peer address (host:port), may be repeated
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Seconds between peer requests
    #[arg(long, default_value_t = grapevine::DEFAULT_REFRESH_INTERVAL_SECS)]
    refresh_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a Grapevine node
    Start,
    /// Print the rendezvous room identifier
    Room,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Start) | None => {
            let config = NodeConfig {
                port: cli.port,
                refresh_interval: Duration::from_secs(cli.refresh_secs),
                bootstrap_peers: cli.peers,
                ..NodeConfig::default()
            };
            let node = GrapevineNode::builder().with_config(config).build().await?;
            info!("Room {}", node.room());

            let shutdown = node.shutdown_token();
            tokio::spawn(async move {
                if let Err(e) = wait_for_termination().await {
                    error!("Failed to listen for termination signals: {}", e);
                    return;
                }
                shutdown.cancel();
            });

            let (commands_tx, commands_rx) = mpsc::channel(command::COMMAND_QUEUE_CAPACITY);
            tokio::spawn(async move {
                let stdin = BufReader::new(tokio::io::stdin());
                if let Err(e) = command::read_commands(stdin, tokio::io::stdout(), "> ", commands_tx).await {
                    error!("Command input failed: {}", e);
                }
            });

            if let Err(e) = node.run(commands_rx).await {
                error!("Node failed: {}", e);
                process::exit(1);
            }
            // The stdin reader blocks a runtime thread; exit instead of
            // waiting for it
            process::exit(0);
        },
        Some(Commands::Room) => {
            println!("{}", grapevine::crypto::room_id(grapevine::ROOM_NAME));
        },
        Some(Commands::Version) => {
            println!("Grapevine v{}", grapevine::VERSION);
        },
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix)
async fn wait_for_termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
