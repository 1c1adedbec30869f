//! Node-local agents
//!
//! Each agent watches exactly one resource, renders its daemon's
//! configuration to local files and drives a [`Supervisor`] from the
//! result. They reuse the work-queue controller with a single worker and
//! delayed enqueue so bursts of changes collapse into one reload.

pub mod balancer;
pub mod daemon;
pub mod fs;
pub mod service;

pub use balancer::BalancerAgent;
pub use daemon::{DaemonSpec, DaemonState, Status, Supervisor, SupervisorError};
pub use service::{rooted_paths, ServiceAgent};

use crate::api::{Kind, ObjectKey};
use crate::config::Config;
use crate::controller::{Controller, ControllerSettings, EventRecorder, Reconciler};
use crate::store::{ClusterApi, Selector};
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Tor daemon of one HiddenService
    Service,
    /// Balancer daemon of one BalancedFleet
    Balancer,
}

impl AgentKind {
    fn watched(&self) -> Kind {
        match self {
            AgentKind::Service => Kind::HiddenService,
            AgentKind::Balancer => Kind::BalancedFleet,
        }
    }
}

/// Both must be given; every missing one is reported at once
pub fn target_key(namespace: &str, name: &str) -> Result<ObjectKey> {
    let mut missing = Vec::new();
    if namespace.trim().is_empty() {
        missing.push("namespace must not be empty");
    }
    if name.trim().is_empty() {
        missing.push("name must not be empty");
    }
    if !missing.is_empty() {
        bail!("invalid agent target: {}", missing.join("; "));
    }
    Ok(ObjectKey::new(namespace, name))
}

/// Run an agent for `key` until `shutdown` fires
pub async fn run_agent(
    kind: AgentKind,
    key: ObjectKey,
    client: Arc<dyn ClusterApi>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<()> {
    let agent_config = &config.agent;
    let spec = match kind {
        AgentKind::Service => DaemonSpec::from_config("tor", &agent_config.tor, agent_config),
        AgentKind::Balancer => {
            DaemonSpec::from_config("onionbalance", &agent_config.balancer, agent_config)
        },
    };
    let supervisor = Arc::new(Supervisor::spawn(spec, shutdown.clone()));

    info!("Starting {:?} agent for {} {}", kind, kind.watched(), key);
    match kind {
        AgentKind::Service => {
            let agent = ServiceAgent::new(client.clone(), config.clone(), supervisor.clone());
            drive(agent, kind, &key, client, &config, shutdown).await;
        },
        AgentKind::Balancer => {
            let agent = BalancerAgent::new(client.clone(), config.clone(), supervisor.clone());
            drive(agent, kind, &key, client, &config, shutdown).await;
        },
    }

    // The controller dropped its handle; ours is the last one
    if let Ok(supervisor) = Arc::try_unwrap(supervisor) {
        supervisor.wait().await;
    }
    info!("{:?} agent for {} stopped", kind, key);
    Ok(())
}

async fn drive<R: Reconciler>(
    agent: R,
    kind: AgentKind,
    key: &ObjectKey,
    client: Arc<dyn ClusterApi>,
    config: &Config,
    shutdown: CancellationToken,
) {
    Controller::new(
        agent,
        client.clone(),
        kind.watched(),
        Selector::named(key),
        ControllerSettings::agent(&config.controller),
    )
    .with_recorder(EventRecorder::new(client))
    .run(shutdown)
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_key_reports_every_problem() {
        let err = target_key("", " ").unwrap_err().to_string();
        assert!(err.contains("namespace must not be empty"));
        assert!(err.contains("name must not be empty"));

        let key = target_key("default", "web").unwrap();
        assert_eq!(key.to_string(), "default/web");
    }
}
