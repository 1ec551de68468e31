//! Autodoc CLI
//!
//! Thin wrapper around autodoc-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Generate a key pair
//! autodoc keygen --format base58
//!
//! # Canonical document ids
//! autodoc doc-id dm did:plc:bob did:plc:alice
//! autodoc doc-id catalog did:plc:alice
//!
//! # List what a fast-tier store holds
//! autodoc inspect ./alice.redb --doc catalog/did:plc:alice
//!
//! # Two peers exchanging a direct message over an in-process relay
//! autodoc demo --message "hello"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autodoc_core::catalog::post_message;
use autodoc_core::logging::init_logging;
use autodoc_core::{
    Channel, Document, DocumentId, EngineConfig, Identity, KeyDirectory, KeyPair, LocalRelay,
    MemoryRemote, PeerConfig, RedbStorage, Session, StorageAdapter, StorageBackends, StorageKey,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

/// Autodoc - encrypted multi-document sync
#[derive(Parser)]
#[command(name = "autodoc")]
#[command(version)]
#[command(about = "Autodoc - encrypted, peer-managed document sync")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Engine configuration file (default: ~/.autodoc/config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an Ed25519 key pair
    Keygen {
        /// Output encoding
        #[arg(long, value_enum, default_value_t = KeyFormat::Hex)]
        format: KeyFormat,
    },

    /// Print canonical document ids
    DocId {
        #[command(subcommand)]
        kind: DocIdKind,
    },

    /// List the keys stored in a redb fast-tier file
    Inspect {
        /// Path to the redb file
        path: PathBuf,

        /// Only keys of this document
        #[arg(long)]
        doc: Option<String>,
    },

    /// Run two peers that discover each other through their catalogs and exchange a message
    Demo {
        /// First identity
        #[arg(long, default_value = "did:plc:alice")]
        alice: String,

        /// Second identity
        #[arg(long, default_value = "did:plc:bob")]
        bob: String,

        /// Directory for the fast-tier files (default: a temporary directory)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Message the first identity sends
        #[arg(long, default_value = "hello from autodoc")]
        message: String,
    },
}

#[derive(Subcommand)]
enum DocIdKind {
    /// Direct-message channel between two identities
    Dm { a: String, b: String },

    /// Conversation catalog of an identity
    Catalog { owner: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum KeyFormat {
    Hex,
    Base58,
}

impl KeyFormat {
    fn encode(self, bytes: &[u8]) -> String {
        match self {
            KeyFormat::Hex => hex::encode(bytes),
            KeyFormat::Base58 => bs58::encode(bytes).into_string(),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".autodoc").join("config.toml"))
        .filter(|path| path.exists())
}

fn load_settings(explicit: Option<&Path>) -> Result<EngineConfig> {
    match explicit.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn setup_logging(settings: &mut EngineConfig, verbosity: u8, explicit_config: bool) -> Result<()> {
    if verbosity > 0 || !explicit_config {
        settings.logging.filter = match verbosity {
            0 => "warn",
            1 => "autodoc_core=info,autodoc=info",
            2 => "autodoc_core=debug,autodoc=debug",
            _ => "trace",
        }
        .to_string();
    }
    init_logging(&settings.logging)?;
    Ok(())
}

fn parse_identity(s: &str) -> Result<Identity> {
    Identity::parse(s).map_err(|e| anyhow::anyhow!("Invalid identity '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    setup_logging(&mut settings, cli.verbose, cli.config.is_some())?;

    match cli.command {
        Commands::Keygen { format } => {
            let keypair = KeyPair::generate();
            println!("Public key:  {}", format.encode(&keypair.public_key().to_bytes()));
            println!("Secret seed: {}", format.encode(&keypair.to_seed()));
        }

        Commands::DocId { kind } => {
            let id = match kind {
                DocIdKind::Dm { a, b } => {
                    let (a, b) = (parse_identity(&a)?, parse_identity(&b)?);
                    if a == b {
                        anyhow::bail!("A dm needs two distinct identities");
                    }
                    DocumentId::dm(&a, &b)
                }
                DocIdKind::Catalog { owner } => DocumentId::catalog(&parse_identity(&owner)?),
            };
            println!("{}", id);
        }

        Commands::Inspect { path, doc } => inspect(&path, doc.as_deref()).await?,

        Commands::Demo {
            alice,
            bob,
            data_dir,
            message,
        } => {
            let (alice, bob) = (parse_identity(&alice)?, parse_identity(&bob)?);
            if alice == bob {
                anyhow::bail!("The demo needs two distinct identities");
            }
            let temp;
            let dir = match data_dir {
                Some(dir) => dir,
                None => {
                    temp = tempfile::tempdir()?;
                    temp.path().to_path_buf()
                }
            };
            run_demo(settings, &dir, &alice, &bob, &message).await?;
        }
    }

    Ok(())
}

async fn inspect(path: &Path, doc: Option<&str>) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("No store at {}", path.display());
    }
    let store = RedbStorage::open(path)?;
    let prefix = match doc {
        Some(doc) => StorageKey::new([DocumentId::parse(doc)?.to_string()]),
        None => StorageKey::root(),
    };

    let keys = store.list_keys(&prefix).await?;
    for key in &keys {
        let size = store.get(key).await?.map_or(0, |v| v.len());
        println!("{}  ({} bytes)", key, size);
    }
    println!("{} keys", keys.len());
    Ok(())
}

async fn wait_for_message(doc: &Document<Channel>, body: &str) -> Result<Channel> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(view) = doc.view() {
                if view.messages.iter().any(|m| m.body == body) {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("message was not delivered")
}

async fn run_demo(
    settings: EngineConfig,
    dir: &Path,
    alice: &Identity,
    bob: &Identity,
    message: &str,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let relay = LocalRelay::new(settings.router_url.clone());
    let remote = Arc::new(MemoryRemote::new());
    let directory = Arc::new(KeyDirectory::new());

    let config_for = |identity: &Identity| -> Result<PeerConfig> {
        let keypair = KeyPair::generate();
        directory.insert(identity.clone(), keypair.public_key());
        let path = dir.join(format!("{}.redb", identity.short()));
        Ok(PeerConfig {
            identity: identity.clone(),
            keypair,
            auth: Arc::new(relay.clone()),
            router: Arc::new(relay.clone()),
            backends: StorageBackends {
                local: Arc::new(RedbStorage::open(&path)?),
                remote: remote.clone(),
                key_resolver: directory.clone(),
            },
            settings: settings.clone(),
        })
    };

    let alice_session = Session::start(config_for(alice)?).await?;
    let bob_session = Session::start(config_for(bob)?).await?;
    let (a, b) = (alice_session.context(), bob_session.context());
    info!(alice = %alice, bob = %bob, "Both sessions started");

    a.start_conversation(bob, None).await?;
    b.start_conversation(alice, None).await?;
    let a_dm = a
        .wait_for_dm(bob, Duration::from_secs(10))
        .await
        .context("alice never opened the dm")?;
    let b_dm = b
        .wait_for_dm(alice, Duration::from_secs(10))
        .await
        .context("bob never opened the dm")?;
    println!("Channel: {}", a_dm.id());

    let sent = post_message(&a_dm, alice, message).await?;
    println!("{} -> {}: {}", alice, bob, sent.body);

    let view = wait_for_message(&b_dm, message).await?;
    for m in &view.messages {
        println!("{} sees [{}] {}", bob, m.author, m.body);
    }

    a_dm.flush().await?;
    b_dm.flush().await?;
    for owner in remote.owners() {
        println!("Remote repository {}: {} records", owner, remote.repo(&owner).len());
    }
    println!("Fast tiers in {}", dir.display());

    alice_session.shutdown().await;
    bob_session.shutdown().await;
    Ok(())
}
