//! Configuration loading and validation
//!
//! Handles TOML configuration parsing with strict validation.
//! No runtime mutation - configuration is immutable after load and shared
//! as an `Arc<Config>` by every component.

#![allow(unused_imports)] // Re-exports for public API

pub mod file;
mod validation;

pub use file::{load_config, load_from_path};
pub use validation::validate;

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// API group stamped into secret types and RBAC rules
    #[serde(default = "default_api_group")]
    pub api_group: String,
    #[serde(default)]
    pub names: NamesConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_api_group() -> String {
    "tor.k8s.torproject.org".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_group: default_api_group(),
            names: NamesConfig::default(),
            ports: PortsConfig::default(),
            images: ImagesConfig::default(),
            controller: ControllerConfig::default(),
            agent: AgentConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    pub fn identity_secret_type(&self) -> String {
        format!("{}/onion-v3", self.api_group)
    }

    pub fn authorized_clients_secret_type(&self) -> String {
        format!("{}/authorized-clients-v3", self.api_group)
    }

    pub fn control_secret_type(&self) -> String {
        format!("{}/control-password", self.api_group)
    }
}

/// Derived object names. `{name}` is the parent's name, `{index}` the
/// 1-based backend number.
#[derive(Debug, Clone, Deserialize)]
pub struct NamesConfig {
    #[serde(default = "default_deployment_name")]
    pub deployment: String,
    #[serde(default = "default_secret_name")]
    pub secret: String,
    #[serde(default = "default_service_name")]
    pub service: String,
    #[serde(default = "default_metrics_service_name")]
    pub metrics_service: String,
    #[serde(default = "default_role_name")]
    pub role: String,
    #[serde(default = "default_service_account_name")]
    pub service_account: String,
    #[serde(default = "default_config_map_name")]
    pub config_map: String,
    #[serde(default = "default_authorized_clients_name")]
    pub authorized_clients: String,
    #[serde(default = "default_control_secret_name")]
    pub control_secret: String,
    #[serde(default = "default_backend_name")]
    pub backend: String,
}

fn default_deployment_name() -> String {
    "{name}-tor-daemon".to_string()
}
fn default_secret_name() -> String {
    "{name}-tor-secret".to_string()
}
fn default_service_name() -> String {
    "{name}-tor-svc".to_string()
}
fn default_metrics_service_name() -> String {
    "{name}-tor-metrics-svc".to_string()
}
fn default_role_name() -> String {
    "{name}-tor-role".to_string()
}
fn default_service_account_name() -> String {
    "{name}-tor-sa".to_string()
}
fn default_config_map_name() -> String {
    "{name}-tor-config".to_string()
}
fn default_authorized_clients_name() -> String {
    "{name}-tor-authorized-clients".to_string()
}
fn default_control_secret_name() -> String {
    "{name}-tor-control".to_string()
}
fn default_backend_name() -> String {
    "{name}-tor-obb-{index}".to_string()
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            deployment: default_deployment_name(),
            secret: default_secret_name(),
            service: default_service_name(),
            metrics_service: default_metrics_service_name(),
            role: default_role_name(),
            service_account: default_service_account_name(),
            config_map: default_config_map_name(),
            authorized_clients: default_authorized_clients_name(),
            control_secret: default_control_secret_name(),
            backend: default_backend_name(),
        }
    }
}

impl NamesConfig {
    fn render(template: &str, name: &str) -> String {
        template.replace("{name}", name)
    }

    pub fn deployment(&self, name: &str) -> String {
        Self::render(&self.deployment, name)
    }

    pub fn secret(&self, name: &str) -> String {
        Self::render(&self.secret, name)
    }

    pub fn service(&self, name: &str) -> String {
        Self::render(&self.service, name)
    }

    pub fn metrics_service(&self, name: &str) -> String {
        Self::render(&self.metrics_service, name)
    }

    /// Monitors share the metrics service's name
    pub fn service_monitor(&self, name: &str) -> String {
        self.metrics_service(name)
    }

    /// Role bindings share the role's name
    pub fn role(&self, name: &str) -> String {
        Self::render(&self.role, name)
    }

    pub fn service_account(&self, name: &str) -> String {
        Self::render(&self.service_account, name)
    }

    pub fn config_map(&self, name: &str) -> String {
        Self::render(&self.config_map, name)
    }

    pub fn authorized_clients(&self, name: &str) -> String {
        Self::render(&self.authorized_clients, name)
    }

    pub fn control_secret(&self, name: &str) -> String {
        Self::render(&self.control_secret, name)
    }

    pub fn backend(&self, name: &str, index: u32) -> String {
        Self::render(&self.backend, name).replace("{index}", &index.to_string())
    }
}

/// Daemon listener ports
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_socks_port")]
    pub socks: u16,
    #[serde(default = "default_control_port")]
    pub control: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics: u16,
    #[serde(default = "default_metrics_policy")]
    pub metrics_policy: String,
    /// Loopback control port the balancer daemon drives its local Tor through
    #[serde(default = "default_balancer_control_port")]
    pub balancer_control: u16,
}

fn default_socks_port() -> u16 {
    9050
}
fn default_control_port() -> u16 {
    9051
}
fn default_metrics_port() -> u16 {
    9035
}
fn default_metrics_policy() -> String {
    "accept 0.0.0.0/0".to_string()
}
fn default_balancer_control_port() -> u16 {
    6666
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            socks: default_socks_port(),
            control: default_control_port(),
            metrics: default_metrics_port(),
            metrics_policy: default_metrics_policy(),
            balancer_control: default_balancer_control_port(),
        }
    }
}

/// Container images for generated workloads
#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_daemon_image")]
    pub daemon: String,
    #[serde(default = "default_balancer_image")]
    pub balancer: String,
}

fn default_daemon_image() -> String {
    "quay.io/bugfest/tor-daemon-manager:latest".to_string()
}
fn default_balancer_image() -> String {
    "quay.io/bugfest/tor-onionbalance-manager:latest".to_string()
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            daemon: default_daemon_image(),
            balancer: default_balancer_image(),
        }
    }
}

/// Work-queue and retry timing
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fleet re-evaluation delay while backends are not synced
    #[serde(default = "default_convergence_requeue")]
    pub convergence_requeue_secs: u64,
    /// Full relist interval; 0 disables
    #[serde(default = "default_resync")]
    pub resync_secs: u64,
    /// Delay applied to watch-driven enqueues in the node agents
    #[serde(default = "default_agent_event_delay")]
    pub agent_event_delay_secs: u64,
}

fn default_workers() -> usize {
    2
}
fn default_retry_delay() -> u64 {
    3
}
fn default_max_retries() -> u32 {
    5
}
fn default_convergence_requeue() -> u64 {
    3
}
fn default_resync() -> u64 {
    300
}
fn default_agent_event_delay() -> u64 {
    2
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_delay_secs: default_retry_delay(),
            max_retries: default_max_retries(),
            convergence_requeue_secs: default_convergence_requeue(),
            resync_secs: default_resync(),
            agent_event_delay_secs: default_agent_event_delay(),
        }
    }
}

impl ControllerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn convergence_requeue(&self) -> Duration {
        Duration::from_secs(self.convergence_requeue_secs)
    }

    pub fn resync(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    pub fn agent_event_delay(&self) -> Duration {
        Duration::from_secs(self.agent_event_delay_secs)
    }
}

/// How a supervised daemon picks up new configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// SIGHUP the live process
    Signal,
    /// Stop, then start again
    Restart,
}

/// One supervised daemon
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub reload: ReloadMode,
}

fn default_tor_daemon() -> DaemonConfig {
    DaemonConfig {
        program: "tor".to_string(),
        args: vec!["-f".to_string(), "/run/tor/torfile".to_string()],
        reload: ReloadMode::Signal,
    }
}

fn default_balancer_daemon() -> DaemonConfig {
    DaemonConfig {
        program: "onionbalance".to_string(),
        args: [
            "--config",
            "/run/onionbalance/config.yaml",
            "--ip",
            "127.0.0.1",
            "--port",
            "6666",
            "--hs-version",
            "v3",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        reload: ReloadMode::Signal,
    }
}

/// Node agent paths and process supervision
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_torrc_path")]
    pub torrc_path: PathBuf,
    #[serde(default = "default_service_dir")]
    pub service_dir: PathBuf,
    /// Read-only mount of the identity secret
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    /// Read-only mount of the control password secret
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,
    #[serde(default = "default_balancer_config_path")]
    pub balancer_config_path: PathBuf,
    /// Key path written into the balancer config, relative to its directory
    #[serde(default = "default_balancer_key_path")]
    pub balancer_key_path: String,
    #[serde(default = "default_tor_daemon")]
    pub tor: DaemonConfig,
    #[serde(default = "default_balancer_daemon")]
    pub balancer: DaemonConfig,
    /// Cool-down before an exited daemon is started again
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_torrc_path() -> PathBuf {
    PathBuf::from("/run/tor/torfile")
}
fn default_service_dir() -> PathBuf {
    PathBuf::from("/run/tor/service")
}
fn default_key_dir() -> PathBuf {
    PathBuf::from("/run/tor/service/key")
}
fn default_control_dir() -> PathBuf {
    PathBuf::from("/run/tor/control")
}
fn default_balancer_config_path() -> PathBuf {
    PathBuf::from("/run/onionbalance/config.yaml")
}
fn default_balancer_key_path() -> String {
    "key/hs_ed25519_secret_key".to_string()
}
fn default_restart_delay() -> u64 {
    3
}
fn default_stop_timeout() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            torrc_path: default_torrc_path(),
            service_dir: default_service_dir(),
            key_dir: default_key_dir(),
            control_dir: default_control_dir(),
            balancer_config_path: default_balancer_config_path(),
            balancer_key_path: default_balancer_key_path(),
            tor: default_tor_daemon(),
            balancer: default_balancer_daemon(),
            restart_delay_secs: default_restart_delay(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl AgentConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Object store selection
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory of the shared file store; in-memory when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    500
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
