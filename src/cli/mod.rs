//! Command-line interface for tor-operator
//!
//! Provides main commands:
//! - `operator` - Run the HiddenService and BalancedFleet controllers
//! - `agent` - Run a node agent next to one Tor or balancer daemon
//! - `apply` - Create or update resources from a YAML manifest
//! - `keygen` - Generate an onion identity
//! - `hash-password` - Print the hashed form of a control password

mod agent;
mod apply;
mod keygen;
mod operator;

pub use agent::run_agent;
pub use apply::{parse_manifest, run_apply};
pub use keygen::run_keygen;
pub use operator::run_operator;

use crate::config::Config;
use crate::store::{ClusterApi, FsStore, MemoryStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// tor-operator - Onion services and onion-balanced fleets, kept converged
#[derive(Parser, Debug)]
#[command(name = "tor-operator")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run both resource controllers until interrupted
    Operator,

    /// Run a node agent for one resource
    Agent(AgentArgs),

    /// Create or update resources from a manifest
    Apply(ApplyArgs),

    /// Generate an onion identity
    Keygen(KeygenArgs),

    /// Print the S2K hash of a control password
    HashPassword(HashPasswordArgs),
}

/// Which daemon the agent drives
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Service,
    Balancer,
}

/// Arguments for agent command
#[derive(Parser, Debug)]
pub struct AgentArgs {
    #[arg(value_enum)]
    pub role: AgentRole,

    /// Namespace of the watched resource
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Name of the watched resource
    #[arg(long, default_value = "")]
    pub name: String,

    /// Keep all daemon files below this directory instead of /run
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Arguments for apply command
#[derive(Parser, Debug)]
pub struct ApplyArgs {
    /// Manifest file, one or more YAML documents
    #[arg(short, long)]
    pub file: PathBuf,
}

/// Arguments for keygen command
#[derive(Parser, Debug)]
pub struct KeygenArgs {
    /// Write the key files into this directory
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Arguments for hash-password command
#[derive(Parser, Debug)]
pub struct HashPasswordArgs {
    pub secret: String,
}

/// Open the store configured in `[store]`
///
/// Without a root everything lives in this process only, which is only
/// useful for trying the operator out.
pub fn open_store(config: &Config) -> Result<Arc<dyn ClusterApi>> {
    match &config.store.root {
        Some(root) => {
            let store = FsStore::open(root, config.store.poll_interval())
                .with_context(|| format!("Failed to open store at {:?}", root))?;
            info!("Using object store at {:?}", root);
            Ok(Arc::new(store))
        },
        None => {
            warn!("No store root configured, objects are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        },
    }
}

/// Run the hash-password command
pub fn run_hash_password(args: &HashPasswordArgs) -> Result<()> {
    let hashed = crate::crypto::hash_control_password(&args.secret)
        .context("Failed to hash control password")?;
    println!("{}", hashed);
    Ok(())
}
