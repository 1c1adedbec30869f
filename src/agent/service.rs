//! Service agent: keeps one Tor daemon in line with its HiddenService

use super::daemon::Supervisor;
use super::fs::{copy_if_not_exist, ensure_private_dir, read_trimmed, write_if_changed};
use crate::api::{HiddenService, ObjectKey};
use crate::config::Config;
use crate::controller::{Action, Reconciler};
use crate::reconcile::secret::HASHED_CONTROL_KEY;
use crate::render::{render_ob_config, render_service_torrc, TorrcOptions};
use crate::store::{Api, ClusterApi};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const HOSTNAME_FILE: &str = "hostname";
const OB_CONFIG_FILE: &str = "ob_config";

/// Key files the daemon expects in its service directory
fn key_files(version: u8) -> [&'static str; 2] {
    if version == 2 {
        ["public_key", "private_key"]
    } else {
        ["hs_ed25519_public_key", "hs_ed25519_secret_key"]
    }
}

pub struct ServiceAgent {
    client: Arc<dyn ClusterApi>,
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
}

impl ServiceAgent {
    pub fn new(client: Arc<dyn ClusterApi>, config: Arc<Config>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            client,
            config,
            supervisor,
        }
    }

    fn hashed_passwords(&self) -> Result<Vec<String>> {
        let path = self.config.agent.control_dir.join(HASHED_CONTROL_KEY);
        Ok(read_trimmed(&path)?
            .filter(|h| !h.is_empty())
            .into_iter()
            .collect())
    }

    /// Copy identity material out of the read-only secret mount
    fn install_keys(&self, version: u8) -> Result<()> {
        let agent = &self.config.agent;
        ensure_private_dir(&agent.service_dir)?;

        let mut files = vec![HOSTNAME_FILE];
        files.extend(key_files(version));
        for file in files {
            let src = agent.key_dir.join(file);
            if !src.exists() {
                debug!("{} not mounted, skipping", src.display());
                continue;
            }
            copy_if_not_exist(&src, &agent.service_dir.join(file))?;
        }
        Ok(())
    }

    /// Render and write every config file; true if any changed
    fn write_configs(&self, hs: &HiddenService) -> Result<bool> {
        let agent = &self.config.agent;
        let options =
            TorrcOptions::from_config(&self.config).with_hashed_passwords(self.hashed_passwords()?);
        let torrc = render_service_torrc(hs, &options)
            .with_context(|| format!("Failed to render torrc for {}", hs.metadata.key()))?;
        let mut changed = write_if_changed(&agent.torrc_path, &torrc)?;

        if let Some(master) = hs.spec.master() {
            let ob_config = render_ob_config(master)?;
            changed |= write_if_changed(&agent.service_dir.join(OB_CONFIG_FILE), &ob_config)?;
        }
        Ok(changed)
    }

    async fn sync(&self, key: &ObjectKey) -> Result<Action> {
        let api: Api<HiddenService> = Api::namespaced(self.client.clone(), &key.namespace);
        let Some(hs) = api.get_opt(&key.name).await? else {
            warn!("HiddenService {} does not exist anymore", key);
            return Ok(Action::Done);
        };

        self.install_keys(hs.spec.effective_version())?;
        if self.write_configs(&hs)? {
            info!("Configuration of {} changed, reloading", key);
            self.supervisor.reload().await?;
        } else {
            self.supervisor.ensure_running().await?;
        }

        let hostname_path = self.config.agent.service_dir.join(HOSTNAME_FILE);
        let Some(hostname) = read_trimmed(&hostname_path)? else {
            bail!("{} does not exist yet", hostname_path.display());
        };
        if hostname != hs.status.hostname {
            info!("Got new hostname for {}: {}", key, hostname);
            let mut updated = hs;
            updated.status.hostname = hostname;
            api.update(updated)
                .await
                .with_context(|| format!("Failed to update status of {}", key))?;
        }
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for ServiceAgent {
    type Error = anyhow::Error;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        self.sync(key).await
    }
}

/// Where the agent's files live, rooted at `root` (tests and local runs)
pub fn rooted_paths(config: &mut Config, root: &Path) {
    let agent = &mut config.agent;
    agent.torrc_path = root.join("tor/torfile");
    agent.service_dir = root.join("tor/service");
    agent.key_dir = root.join("tor/service/key");
    agent.control_dir = root.join("tor/control");
    agent.balancer_config_path = root.join("onionbalance/config.yaml");
}
