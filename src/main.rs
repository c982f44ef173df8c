//! Fundamentalnode operator binary.
//!
//! Offline tooling around a fundamentalnode data directory: key generation,
//! inspection of the directory cache and of the configured entries, and a
//! self-contained protocol demo.
//!
//! Usage:
//!   fundamentalnode genkey                    # new operational key
//!   fundamentalnode list --mode full          # list the cached directory
//!   fundamentalnode count                     # count cached nodes
//!   fundamentalnode list-conf                 # show configured entries
//!   fundamentalnode demo                      # run protocol demo

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fundamentalnode::chain::{ChainView, OutPoint, TxInfo};
use fundamentalnode::config::FundamentalnodeConfig;
use fundamentalnode::crypto::keys::SecretKey;
use fundamentalnode::registry::Registry;
use fundamentalnode::report::{self, ListMode};
use fundamentalnode::storage::PersistentStore;
use fundamentalnode::Hash;
use tracing_subscriber::EnvFilter;

/// Fundamentalnode registry and consensus tooling.
#[derive(Parser, Debug)]
#[command(
    name = "fundamentalnode",
    version,
    about = "Collateral-backed service node tooling"
)]
struct Cli {
    /// Data directory holding the config and the directory cache.
    #[arg(long, default_value = "./fundamentalnode-data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new operational key.
    Genkey,

    /// List the cached directory.
    List {
        /// One of activeseconds, donation, full, lastseen, protocol,
        /// pubkey, pose, rank, status, vin, votes.
        #[arg(long, default_value = "status")]
        mode: String,

        /// Substring filter on the address or the listed value.
        #[arg(long, default_value = "")]
        filter: String,
    },

    /// Count the cached nodes.
    ///
    /// Offline, every collateral is taken as unspent: `enabled` counts the
    /// cached Enabled records whatever the chain state.
    Count,

    /// Show the configured fundamentalnode entries.
    ListConf,

    /// Run the three-node protocol demo.
    Demo,
}

/// Chain view for offline inspection: every collateral counts as unspent
/// and the clock is the local one.
struct OfflineChain;

impl ChainView for OfflineChain {
    fn best_height(&self) -> Option<u64> {
        None
    }

    fn block_hash(&self, _height: u64) -> Option<Hash> {
        None
    }

    fn block_time(&self, _height: u64) -> Option<i64> {
        None
    }

    fn transaction(&self, _txid: &Hash) -> Option<TxInfo> {
        None
    }

    fn is_spendable(&self, _outpoint: &OutPoint) -> bool {
        true
    }

    fn confirmations(&self, _outpoint: &OutPoint) -> Option<u32> {
        None
    }

    fn is_initial_block_download(&self) -> bool {
        false
    }

    fn adjusted_time(&self) -> i64 {
        fundamentalnode::unix_now()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Genkey => {
            let key = SecretKey::generate();
            println!("{}", key.to_hex());
            Ok(())
        }
        Command::List { mode, filter } => {
            let mode: ListMode = mode.parse()?;
            let registry = load_cache(&cli.data_dir)?;
            let rows: BTreeMap<String, String> =
                report::list(&registry, &OfflineChain, None, mode, &filter)
                    .into_iter()
                    .map(|row| (row.addr, row.value))
                    .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Command::Count => {
            let registry = load_cache(&cli.data_dir)?;
            let enabled = registry.count_enabled(&OfflineChain, 0);
            println!(
                "{}",
                serde_json::json!({ "total": registry.len(), "enabled": enabled })
            );
            Ok(())
        }
        Command::ListConf => {
            let config = load_config(&cli.data_dir)?;
            println!("{}", serde_json::to_string_pretty(&config.entries)?);
            Ok(())
        }
        Command::Demo => fundamentalnode::demo::run_demo(),
    }
}

fn load_config(data_dir: &Path) -> Result<FundamentalnodeConfig, Box<dyn std::error::Error>> {
    let mut config = FundamentalnodeConfig::load(data_dir);
    config.node.data_dir = data_dir.display().to_string();
    let legacy = config.load_legacy_entries(data_dir)?;
    if legacy > 0 {
        tracing::info!(entries = legacy, "Loaded legacy fundamentalnode entries");
    }
    config.validate_entries()?;
    Ok(config)
}

fn load_cache(data_dir: &Path) -> Result<Registry, Box<dyn std::error::Error>> {
    let config = load_config(data_dir)?;
    let store = PersistentStore::in_dir(&config.data_dir(), config.params().magic);
    let registry = Registry::new(config.timing.liveness_policy());
    registry.restore(store.read()?);
    tracing::debug!(path = %store.path().display(), nodes = registry.len(), "Read fundamentalnode cache");
    Ok(registry)
}
