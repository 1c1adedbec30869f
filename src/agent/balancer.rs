//! Balancer agent: keeps the balancer daemon's instance list current

use super::daemon::Supervisor;
use super::fs::write_if_changed;
use crate::api::{BalancedFleet, ObjectKey};
use crate::config::Config;
use crate::controller::{Action, Reconciler};
use crate::render::render_balancer_config;
use crate::store::{Api, ClusterApi};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct BalancerAgent {
    client: Arc<dyn ClusterApi>,
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
}

impl BalancerAgent {
    pub fn new(client: Arc<dyn ClusterApi>, config: Arc<Config>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            client,
            config,
            supervisor,
        }
    }

    async fn sync(&self, key: &ObjectKey) -> Result<Action> {
        let api: Api<BalancedFleet> = Api::namespaced(self.client.clone(), &key.namespace);
        let Some(fleet) = api.get_opt(&key.name).await? else {
            warn!("BalancedFleet {} does not exist anymore", key);
            return Ok(Action::Done);
        };

        let agent = &self.config.agent;
        let rendered = render_balancer_config(&fleet, &agent.balancer_key_path)
            .with_context(|| format!("Failed to render balancer config for {}", key))?;

        if write_if_changed(&agent.balancer_config_path, &rendered)? {
            info!(
                "Balancer config of {} changed ({} instances), reloading",
                key,
                fleet
                    .status
                    .backends
                    .values()
                    .filter(|b| !b.hostname.is_empty())
                    .count()
            );
            self.supervisor.reload().await?;
        } else {
            self.supervisor.ensure_running().await?;
        }
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for BalancerAgent {
    type Error = anyhow::Error;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        self.sync(key).await
    }
}
