//! Light ledger client
//!
//! Follows the chain through a set of peers without downloading it: a
//! consensus tracker infers the settled height from peer agreement, and a
//! transaction queue broadcasts signed wallet transactions to the peers that
//! agree. Queue state and known peers are persisted under the data directory.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use light_consensus::{HttpTransport, PeerTransport};
use light_queue::{AccountView, Ed25519Signer, PasswordKeyStore, SigningKey, SledStore, Store};
use light_types::TransactionKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod node;

use config::ClientConfig;
use node::LightNode;

/// Light ledger client
#[derive(Parser, Debug)]
#[command(name = "light-client")]
#[command(about = "Tracks peer consensus and broadcasts wallet transactions", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Genesis digest of the chain to follow
    #[arg(long)]
    genesis: Option<String>,

    /// Seed peer URL (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Account to operate on
    #[arg(long)]
    account: Option<String>,

    /// Data directory for persistent state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Service loop period in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track consensus and broadcast queued transactions until Ctrl+C
    Run,
    /// Generate a signing key sealed with a password
    Keygen {
        #[arg(long, env = "LIGHT_CLIENT_PASSWORD")]
        password: String,
    },
    /// Stage and sign a transfer; `run` broadcasts it
    Submit {
        recipient: String,
        amount: u64,
        #[arg(long, default_value = "0")]
        gratuity: u64,
        #[arg(long, env = "LIGHT_CLIENT_PASSWORD")]
        password: String,
    },
    /// Print the saved checkpoint, account and queue
    Status,
    /// Drop a rejected transaction so blocked ones can be signed again
    ClearError,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::load(self.config.as_deref())?;
        if let Some(genesis) = &self.genesis {
            config.genesis = genesis.clone();
        }
        config.seeds.extend(self.seeds.iter().cloned());
        if let Some(account) = &self.account {
            config.account_id = account.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(tick_ms) = self.tick_ms {
            config.tick_ms = tick_ms;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.client_config()?;

    match args.command {
        Command::Keygen { password } => keygen(&config, &password),
        Command::Run => run(config).await,
        Command::Submit {
            recipient,
            amount,
            gratuity,
            password,
        } => submit(config, recipient, amount, gratuity, &password).await,
        Command::Status => status(config),
        Command::ClearError => clear_error(config),
    }
}

fn open_node(config: &ClientConfig) -> Result<LightNode> {
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir)?;

    let store: Arc<dyn Store> = Arc::new(
        SledStore::open(config.store_path()).context("opening store")?,
    );
    let transport: Arc<dyn PeerTransport> =
        Arc::new(HttpTransport::new(config.tracker_config().timeout)?);
    LightNode::open(config, transport, store)
}

fn keygen(config: &ClientConfig, password: &str) -> Result<()> {
    if config.key_file.exists() {
        return Err(anyhow!("{:?} already exists", config.key_file));
    }
    if let Some(parent) = config.key_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let signer = Ed25519Signer::generate();
    let sealed = PasswordKeyStore::new().seal(password, &signer.seed())?;
    std::fs::write(&config.key_file, sealed)?;
    tracing::info!("Sealed key written to {:?}", config.key_file);
    println!("public key: {}", signer.public_key_base64());
    Ok(())
}

/// Run the service loop
async fn run(config: ClientConfig) -> Result<()> {
    tracing::info!("Starting light client");
    tracing::info!("  Genesis: {}", config.genesis);
    tracing::info!("  Account: {}", config.account_id);
    tracing::info!("  Seeds: {}", config.seeds.len());
    tracing::info!("  Tick: {}ms", config.tick_ms);
    tracing::info!("  Data directory: {:?}", config.data_dir);

    let node = open_node(&config)?;

    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match node.service_tick().await {
                    Ok(report) => {
                        let stats = node.tracker.stats();
                        tracing::debug!(
                            "Height {} ({} of {} peers current), queue: {:?}",
                            stats.height,
                            stats.current_peers,
                            stats.tracked_peers,
                            report.outcome
                        );
                    }
                    Err(e) => tracing::error!("Service tick failed: {:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    if let Err(e) = node.save() {
        tracing::error!("Failed to save state: {:#}", e);
    }
    tracing::info!("Light client stopped");
    Ok(())
}

async fn submit(
    config: ClientConfig,
    recipient: String,
    amount: u64,
    gratuity: u64,
    password: &str,
) -> Result<()> {
    let node = open_node(&config)?;

    let base_nonce = match node.queue.next_nonce() {
        Some(nonce) => nonce,
        None => {
            let stats = node.sync(10).await;
            tracing::info!(
                "Synced to height {} with {} current peers",
                stats.height,
                stats.current_peers
            );
            node.queue.refresh_account().await?;
            node.queue
                .next_nonce()
                .ok_or_else(|| anyhow!("account nonce unknown; peers did not agree"))?
        }
    };

    let body = node
        .queue
        .new_body(TransactionKind::Transfer { recipient, amount })
        .with_gratuity(gratuity);
    let uuid = node.queue.stage(body)?;
    if let Err(e) = node.queue.submit(password, base_nonce) {
        node.queue.remove_staged(uuid)?;
        return Err(e.into());
    }
    node.queue.flush()?;

    println!("{} signed with nonce {}", uuid, base_nonce);
    Ok(())
}

fn status(config: ClientConfig) -> Result<()> {
    let node = open_node(&config)?;

    match node.checkpoint()? {
        Some(checkpoint) => println!(
            "height {} digest {} current {} saved {}",
            checkpoint.height,
            checkpoint.digest,
            checkpoint.is_current,
            chrono::DateTime::<chrono::Utc>::from_timestamp(checkpoint.saved_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        ),
        None => println!("no checkpoint saved yet"),
    }

    let account = node.account.state();
    println!(
        "account {} nonce {:?} reserved {} consumed {}",
        config.account_id,
        account.nonce,
        account.reserved.len(),
        account.consumed.len()
    );
    if let Some(error) = node.account.transaction_error() {
        println!("blocked by {}: {}", error.uuid, error.message);
    }

    println!("{}", serde_json::to_string_pretty(&node.queue.stats())?);
    for tx in node.queue.transactions() {
        println!(
            "{} {:>8} nonce {:?}",
            tx.uuid,
            tx.status.to_string(),
            tx.nonce()
        );
    }
    Ok(())
}

fn clear_error(config: ClientConfig) -> Result<()> {
    let node = open_node(&config)?;
    let restaged = node.queue.clear_transaction_error()?;
    node.queue.flush()?;
    println!("{} transactions returned to staging", restaged);
    Ok(())
}
