//! Deployments and the balancer's config map

use super::primitive::{ensure_owned, Child};
use super::{selector_labels, Context, ReconcileError};
use crate::api::{
    ConfigMap, Container, ContainerPort, Deployment, DeploymentSpec, HiddenService, KeyToPath,
    ObjectMeta, OwnerReference, PodSpec, Volume, VolumeMount, VolumeSource, WorkloadTemplate,
};
use crate::config::Config;
use crate::crypto::keys::secret_keys;
use crate::reconcile::network::METRICS_PORT_NAME;
use crate::render::render_balancer_torrc;
use std::collections::BTreeMap;

/// Config map key holding the balancer's torrc
pub const TORFILE_KEY: &str = "torfile";

const KEY_VOLUME: &str = "private-key";
const CONTROL_VOLUME: &str = "control-password";
const TOR_CONFIG_VOLUME: &str = "tor-config";
const BALANCER_CONFIG_VOLUME: &str = "onionbalance-config";

impl Child for Deployment {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.spec == other.spec && self.metadata.labels == other.metadata.labels
    }
}

impl Child for ConfigMap {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.data == other.data && self.metadata.labels == other.metadata.labels
    }
}

fn secret_volume(name: &str, secret_name: &str, items: Vec<KeyToPath>) -> Volume {
    Volume {
        name: name.to_string(),
        source: VolumeSource::Secret {
            secret_name: secret_name.to_string(),
            items,
        },
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only,
    }
}

fn item(key: &str, path: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
    }
}

/// Secret keys projected into the daemon's key directory
fn identity_items(version: u8) -> Vec<KeyToPath> {
    if version == 2 {
        vec![
            item(secret_keys::HOSTNAME, "hostname"),
            item(secret_keys::PRIVATE_KEY, "private_key"),
        ]
    } else {
        vec![
            item(secret_keys::HOSTNAME, "hostname"),
            item(secret_keys::PRIVATE_KEY_FILE, "hs_ed25519_secret_key"),
            item(secret_keys::PUBLIC_KEY_FILE, "hs_ed25519_public_key"),
        ]
    }
}

/// `agent` roles, as the command line spells them
pub const SERVICE_ROLE: &str = "service";
pub const BALANCER_ROLE: &str = "balancer";

/// Container arguments starting the node agent for `namespace/name`
pub fn agent_args(role: &str, namespace: &str, name: &str) -> Vec<String> {
    ["agent", role, "--namespace", namespace, "--name", name]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
}

fn pod_labels(selector: &BTreeMap<String, String>, template: &WorkloadTemplate) -> BTreeMap<String, String> {
    let mut labels = template.labels.clone();
    labels.extend(selector.clone());
    labels
}

/// Desired Deployment running the service agent and its Tor daemon
pub fn service_deployment(hs: &HiddenService, identity_secret: &str, config: &Config) -> Deployment {
    let namespace = &hs.metadata.namespace;
    let name = &hs.metadata.name;
    let names = &config.names;
    let template = &hs.spec.template;
    let selector = selector_labels(&names.service(name), name);
    let agent = &config.agent;

    let container = Container {
        name: "tor".to_string(),
        image: template
            .image
            .clone()
            .unwrap_or_else(|| config.images.daemon.clone()),
        command: Vec::new(),
        args: agent_args(SERVICE_ROLE, namespace, name),
        ports: vec![ContainerPort {
            name: METRICS_PORT_NAME.to_string(),
            port: config.ports.metrics,
        }],
        volume_mounts: vec![
            mount(KEY_VOLUME, &agent.key_dir.to_string_lossy(), true),
            mount(CONTROL_VOLUME, &agent.control_dir.to_string_lossy(), true),
        ],
        env: template.env.clone(),
    };

    Deployment {
        metadata: ObjectMeta::new(namespace, names.deployment(name)),
        spec: DeploymentSpec {
            replicas: template.replicas.unwrap_or(1),
            selector: selector.clone(),
            template: PodSpec {
                labels: pod_labels(&selector, template),
                service_account: names.service_account(name),
                containers: vec![container],
                volumes: vec![
                    secret_volume(
                        KEY_VOLUME,
                        identity_secret,
                        identity_items(hs.spec.effective_version()),
                    ),
                    secret_volume(CONTROL_VOLUME, &names.control_secret(name), Vec::new()),
                ],
            },
        },
    }
}

/// Desired Deployment running the balancer agent beside a local Tor
pub fn balancer_deployment(
    namespace: &str,
    name: &str,
    identity_secret: &str,
    template: &WorkloadTemplate,
    config: &Config,
) -> Deployment {
    let names = &config.names;
    let selector = selector_labels(&names.service(name), name);
    let balancer_dir = config
        .agent
        .balancer_config_path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/run/onionbalance".to_string());

    let balancer = Container {
        name: "onionbalance".to_string(),
        image: template
            .image
            .clone()
            .unwrap_or_else(|| config.images.balancer.clone()),
        command: Vec::new(),
        args: agent_args(BALANCER_ROLE, namespace, name),
        ports: Vec::new(),
        volume_mounts: vec![
            mount(BALANCER_CONFIG_VOLUME, &balancer_dir, false),
            mount(KEY_VOLUME, &format!("{}/key", balancer_dir), true),
        ],
        env: template.env.clone(),
    };

    let tor = Container {
        name: "tor".to_string(),
        image: config.images.balancer.clone(),
        command: vec!["/usr/local/bin/tor".to_string()],
        args: vec!["-f".to_string(), "/run/tor/torfile".to_string()],
        ports: Vec::new(),
        volume_mounts: vec![
            mount(TOR_CONFIG_VOLUME, "/run/tor", true),
            mount(KEY_VOLUME, "/run/tor/key", true),
        ],
        env: BTreeMap::new(),
    };

    Deployment {
        metadata: ObjectMeta::new(namespace, names.deployment(name)),
        spec: DeploymentSpec {
            replicas: template.replicas.unwrap_or(1),
            selector: selector.clone(),
            template: PodSpec {
                labels: pod_labels(&selector, template),
                service_account: names.service_account(name),
                containers: vec![balancer, tor],
                volumes: vec![
                    Volume {
                        name: BALANCER_CONFIG_VOLUME.to_string(),
                        source: VolumeSource::EmptyDir,
                    },
                    secret_volume(KEY_VOLUME, identity_secret, identity_items(3)),
                    Volume {
                        name: TOR_CONFIG_VOLUME.to_string(),
                        source: VolumeSource::ConfigMap {
                            name: names.config_map(name),
                        },
                    },
                ],
            },
        },
    }
}

pub async fn ensure_deployment(
    ctx: &Context,
    owner: &OwnerReference,
    want: Deployment,
) -> Result<(), ReconcileError> {
    let namespace = want.metadata.namespace.clone();
    let name = want.metadata.name.clone();
    ensure_owned(&ctx.api::<Deployment>(&namespace), owner, &name, |_| Ok(want)).await?;
    Ok(())
}

/// Ensure the config map carrying the balancer's torrc
pub async fn ensure_balancer_config_map(
    ctx: &Context,
    owner: &OwnerReference,
    namespace: &str,
    resource_name: &str,
) -> Result<(), ReconcileError> {
    let name = ctx.config.names.config_map(resource_name);
    let torrc = render_balancer_torrc(ctx.config.ports.balancer_control);
    ensure_owned(&ctx.api::<ConfigMap>(namespace), owner, &name, |_| {
        let mut data = BTreeMap::new();
        data.insert(TORFILE_KEY.to_string(), torrc);
        Ok(ConfigMap {
            metadata: ObjectMeta::new(namespace, &name),
            data,
        })
    })
    .await?;
    Ok(())
}
