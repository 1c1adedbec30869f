//! Agent command - run one node agent until interrupted

use super::{open_store, AgentArgs, AgentRole};
use crate::agent::{self, rooted_paths, target_key, AgentKind};
use crate::config::Config;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the agent command
pub async fn run_agent(mut config: Config, args: &AgentArgs) -> Result<()> {
    let key = target_key(&args.namespace, &args.name)?;
    if let Some(root) = &args.root {
        rooted_paths(&mut config, root);
        info!("Agent files rooted at {:?}", root);
    }

    let kind = match args.role {
        AgentRole::Service => AgentKind::Service,
        AgentRole::Balancer => AgentKind::Balancer,
    };
    let config = Arc::new(config);
    let client = open_store(&config)?;
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(agent::run_agent(
        kind,
        key,
        client,
        config,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, stopping agent");
    shutdown.cancel();

    task.await.context("Agent task failed")?
}
