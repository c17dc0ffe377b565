//! Hive Mind CLI
//!
//! Thin wrapper around hivemind-core for running a sync node from a shell.
//!
//! ## Usage
//!
//! ```bash
//! # Write a config with a fresh encryption key and peer ID
//! hivemind init
//!
//! # Print a new encryption key to share with the mesh
//! hivemind keygen
//!
//! # Show the public key and endpoint ID to give to peers
//! hivemind identity
//!
//! # List the documents of a vault that would be shared
//! hivemind shared --vault ~/notes
//!
//! # Run a node
//! hivemind serve --vault ~/notes
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hivemind_core::sync::{format_peer_addr, load_or_generate_secret_key};
use hivemind_core::{
    generate_encryption_key, DocumentStore, FsStore, HiveConfig, IrohTransport, Keypair,
    SyncEngine, SyncEvent,
};
use tracing::info;

/// Hive Mind - encrypted peer-to-peer document sync
#[derive(Parser)]
#[command(name = "hivemind")]
#[command(version = "0.1.0")]
#[command(about = "Hive Mind - encrypted peer-to-peer document sync")]
#[command(
    long_about = "Keeps a folder of text documents in sync with a small mesh of trusted peers, without a server."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: <data-dir>/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (default: ~/.hivemind)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new config file for this node's endpoint
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Print a fresh encryption key
    Keygen,

    /// Show this node's public key and endpoint ID
    Identity,

    /// List shared documents in a vault
    Shared {
        /// Vault directory
        #[arg(long)]
        vault: PathBuf,
    },

    /// Run a sync node
    Serve {
        /// Vault directory
        #[arg(long)]
        vault: PathBuf,

        /// Extra peers to dial (ENDPOINT_ID or ENDPOINT_ID@ADDR,ADDR)
        #[arg(long = "connect")]
        connect: Vec<String>,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.hivemind)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hivemind")
}

fn load_config(path: &Path) -> Result<HiveConfig> {
    let config = HiveConfig::load(path)
        .with_context(|| format!("run `hivemind init` to create {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config_path = cli.config.unwrap_or_else(|| data_dir.join("config.json"));
    let identity_path = data_dir.join("identity.key");
    let endpoint_key_path = data_dir.join("endpoint.key");

    match cli.command {
        Commands::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }

            let secret_key = load_or_generate_secret_key(&endpoint_key_path)?;
            let config = HiveConfig {
                peer_id: secret_key.public().to_string(),
                ..HiveConfig::generate()
            };
            config.save(&config_path)?;

            println!("Config written:");
            println!("  Path: {}", config_path.display());
            println!("  Peer ID: {}", config.peer_id);
            println!();
            println!("Share the encryptionKey with every peer in the mesh,");
            println!("add their public keys to trustedPeers and their endpoints to peers.");
        }

        Commands::Keygen => {
            println!("{}", generate_encryption_key());
        }

        Commands::Identity => {
            let keypair = Keypair::load_or_generate(&identity_path)?;
            let secret_key = load_or_generate_secret_key(&endpoint_key_path)?;

            println!("Identity:");
            println!("  Public key: {}", keypair.public_key_base64());
            println!("  Endpoint ID: {}", secret_key.public());
            println!("  Key file: {}", identity_path.display());
        }

        Commands::Shared { vault } => {
            let config = load_config(&config_path)?;
            let store = FsStore::open(&vault)?;

            let shared: Vec<String> = store
                .list_all()
                .await?
                .into_iter()
                .filter(|path| config.is_shared(path))
                .collect();

            if shared.is_empty() {
                println!("No shared documents in {}", vault.display());
            } else {
                println!("Shared documents ({}):", shared.len());
                for path in shared {
                    println!("  {}", path);
                }
            }
        }

        Commands::Serve { vault, connect } => {
            println!("Starting Hive Mind...");
            println!();

            let mut config = load_config(&config_path)?;
            config.peers.extend(connect);
            info!(config = %config_path.display(), peers = config.peers.len(), "Loaded config");
            let keypair = Keypair::load_or_generate(&identity_path)?;
            let secret_key = load_or_generate_secret_key(&endpoint_key_path)?;

            let transport = IrohTransport::bind(secret_key).await?;
            let peers = transport.register_peers(&config.peers)?;
            info!(peers = peers.len(), "Registered configured peers");
            let address = format_peer_addr(&transport.endpoint_addr());
            let store = Arc::new(FsStore::open(&vault)?);
            let engine = SyncEngine::new(config, keypair, transport, store)?;
            let mut events = engine.subscribe();
            engine.start()?;

            println!("Identity:");
            println!("  Public key: {}", engine.public_key_base64());
            println!("  Endpoint ID: {}", engine.local_id());
            println!("  Address: {}", address);
            println!();
            println!("Vault: {}", vault.display());
            println!("Shared documents: {}", engine.shared_documents().await?.len());
            println!("Trusted peers: {}", engine.config().trusted_peers.len());
            println!();
            println!("Press Ctrl+C to stop");

            let status_interval = Duration::from_secs(30);
            let mut last_status = std::time::Instant::now();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(SyncEvent::PeerAuthenticated { peer, .. }) => {
                            println!("[Peer] {} connected", peer.short());
                        }
                        Ok(SyncEvent::PeerDisconnected { peer }) => {
                            println!("[Peer] {} disconnected", peer.short());
                        }
                        Ok(SyncEvent::AuthenticationFailed { peer, reason }) => {
                            println!("[Peer] {} rejected: {}", peer.short(), reason);
                        }
                        Ok(SyncEvent::DocumentApplied { path, action }) => {
                            println!("[Sync] {} ({})", path, action);
                        }
                        Ok(SyncEvent::SnapshotRejected { path, message }) => {
                            println!("[Sync] {} failed: {}", path, message);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if last_status.elapsed() >= status_interval {
                            last_status = std::time::Instant::now();
                            println!(
                                "[Status] {} peer(s) connected",
                                engine.connected_peers().len()
                            );
                        }
                    }
                }
            }

            engine.shutdown();
            engine.connections().transport().shutdown().await;
            println!("Stopped.");
        }
    }

    Ok(())
}
