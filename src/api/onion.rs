//! HiddenService resource

use super::{InvalidSpec, Kind, ObjectMeta};
use crate::crypto::pubkey_from_onion_address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// One `public port -> backend address:port` mapping
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub public_port: u16,
    /// IP literal, or the name of a Service in the same namespace
    pub backend_address: String,
    pub backend_port: u16,
}

/// Reference to a secret, optionally to one key inside it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Workload knobs carried through to the generated Deployment
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenServiceSpec {
    #[serde(default)]
    pub rules: Vec<PortRule>,
    #[serde(default)]
    pub template: WorkloadTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_secret_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorized_client_refs: Vec<SecretRef>,
    /// 0 means "default" and is treated as 3
    #[serde(default = "default_version")]
    pub version: u8,
    /// Set when this service is a backend of a balanced fleet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_config: Option<String>,
    #[serde(default)]
    pub monitor_enabled: bool,
}

fn default_version() -> u8 {
    3
}

impl Default for HiddenServiceSpec {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            template: WorkloadTemplate::default(),
            private_key_secret_ref: None,
            authorized_client_refs: Vec::new(),
            version: default_version(),
            master_address: None,
            extra_config: None,
            monitor_enabled: false,
        }
    }
}

impl HiddenServiceSpec {
    /// Protocol version actually deployed: 2 stays 2, anything else is 3
    pub fn effective_version(&self) -> u8 {
        if self.version == 2 {
            2
        } else {
            3
        }
    }

    /// Master address, ignoring an empty string
    pub fn master(&self) -> Option<&str> {
        self.master_address.as_deref().filter(|m| !m.is_empty())
    }

    /// Distinct Service names the rules point at, in rule order
    pub fn backend_services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for rule in &self.rules {
            let address = rule.backend_address.as_str();
            if address.parse::<IpAddr>().is_err() && !names.contains(&address) {
                names.push(address);
            }
        }
        names
    }
}

/// `resolvedBackendAddress` when the backend Service does not exist
pub const UNRESOLVED_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenServiceStatus {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub resolved_backend_address: String,
    /// Cluster IP of every Service named by a rule, keyed by Service name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_backends: BTreeMap<String, String>,
}

impl HiddenServiceStatus {
    /// Address a rule's backend resolves to, if its Service has one
    pub fn backend_for(&self, service: &str) -> Option<&str> {
        self.resolved_backends
            .get(service)
            .map(String::as_str)
            .filter(|ip| !ip.is_empty() && *ip != UNRESOLVED_ADDRESS)
    }
}

/// A single onion service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenService {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: HiddenServiceSpec,
    #[serde(default)]
    pub status: HiddenServiceStatus,
}

impl HiddenService {
    pub fn new(namespace: &str, name: &str, spec: HiddenServiceSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: HiddenServiceStatus::default(),
        }
    }

    /// Check the invariants the schema layer would otherwise enforce
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        let invalid = |reason: String| InvalidSpec {
            kind: Kind::HiddenService,
            key: self.metadata.key(),
            reason,
        };

        self.metadata.check_key().map_err(invalid)?;
        if !matches!(self.spec.version, 0 | 2 | 3) {
            return Err(invalid(format!(
                "version must be one of 0, 2, 3 (got {})",
                self.spec.version
            )));
        }
        if self.spec.effective_version() == 2 && self.spec.private_key_secret_ref.is_none() {
            return Err(invalid(
                "version 2 requires privateKeySecretRef; v2 keys are not generated".to_string(),
            ));
        }
        if let Some(master) = self.spec.master() {
            pubkey_from_onion_address(master)
                .map_err(|e| invalid(format!("masterAddress is not a v3 onion address: {}", e)))?;
        }
        for (idx, rule) in self.spec.rules.iter().enumerate() {
            if rule.public_port == 0 || rule.backend_port == 0 {
                return Err(invalid(format!("rule {} has a zero port", idx)));
            }
            if rule.backend_address.trim().is_empty() {
                return Err(invalid(format!("rule {} has an empty backendAddress", idx)));
            }
        }
        Ok(())
    }
}
