//! BalancedFleet resource
//!
//! One fleet address published by a balancer daemon in front of N backend
//! HiddenServices.

use super::onion::{HiddenServiceSpec, HiddenServiceStatus, SecretRef, WorkloadTemplate};
use super::{InvalidSpec, Kind, ObjectMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound on backends per fleet
pub const MAX_BACKENDS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancedFleetSpec {
    #[serde(default = "default_backend_count")]
    pub backend_count: u32,
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_secret_ref: Option<SecretRef>,
    /// Spec copied into every backend; `masterAddress` is overwritten
    #[serde(default)]
    pub backend_template: HiddenServiceSpec,
    #[serde(default)]
    pub balancer_template: WorkloadTemplate,
}

fn default_backend_count() -> u32 {
    2
}

fn default_version() -> u8 {
    3
}

impl Default for BalancedFleetSpec {
    fn default() -> Self {
        Self {
            backend_count: default_backend_count(),
            version: default_version(),
            private_key_secret_ref: None,
            backend_template: HiddenServiceSpec::default(),
            balancer_template: WorkloadTemplate::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancedFleetStatus {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub resolved_address: String,
    #[serde(default)]
    pub backends: BTreeMap<String, HiddenServiceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancedFleet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BalancedFleetSpec,
    #[serde(default)]
    pub status: BalancedFleetStatus,
}

impl BalancedFleet {
    pub fn new(namespace: &str, name: &str, spec: BalancedFleetSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: BalancedFleetStatus::default(),
        }
    }

    /// Every desired backend is reported and has a hostname
    pub fn is_synced(&self) -> bool {
        self.status.backends.len() == self.spec.backend_count as usize
            && self
                .status
                .backends
                .values()
                .all(|b| !b.hostname.is_empty())
    }

    pub fn validate(&self) -> Result<(), InvalidSpec> {
        let invalid = |reason: String| InvalidSpec {
            kind: Kind::BalancedFleet,
            key: self.metadata.key(),
            reason,
        };

        self.metadata.check_key().map_err(invalid)?;
        if self.spec.backend_count < 1 || self.spec.backend_count > MAX_BACKENDS {
            return Err(invalid(format!(
                "backendCount must be within 1..={} (got {})",
                MAX_BACKENDS, self.spec.backend_count
            )));
        }
        if self.spec.version != 3 {
            return Err(invalid(format!(
                "only version 3 fleets are supported (got {})",
                self.spec.version
            )));
        }
        if self.spec.backend_template.effective_version() != 3 {
            return Err(invalid("backendTemplate must use version 3".to_string()));
        }
        Ok(())
    }
}
