//! tor-operator - Tor onion services and onion-balanced fleets, kept converged
//!
//! # Usage
//!
//! ```bash
//! # Run the controllers against a shared store
//! tor-operator -c /etc/tor-operator/config.toml operator
//!
//! # Declare resources
//! tor-operator apply -f hidden-services.yaml
//!
//! # Run next to a Tor daemon
//! tor-operator agent service --namespace default --name web
//! ```

use anyhow::Result;
use clap::Parser;
use tor_operator::cli::{self, Cli, Commands};
use tor_operator::{config, logging};
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        logging::init_with_level(Level::DEBUG);
    } else {
        logging::init();
    }

    match &cli.command {
        Commands::Operator => {
            let config = config::load_config(cli.config.as_deref())?;
            cli::run_operator(config).await?;
        },
        Commands::Agent(args) => {
            let config = config::load_config(cli.config.as_deref())?;
            cli::run_agent(config, args).await?;
        },
        Commands::Apply(args) => {
            let config = config::load_config(cli.config.as_deref())?;
            cli::run_apply(&config, &args.file).await?;
        },
        Commands::Keygen(args) => {
            cli::run_keygen(args)?;
        },
        Commands::HashPassword(args) => {
            cli::run_hash_password(args)?;
        },
    }

    Ok(())
}
