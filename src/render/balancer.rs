//! Balancer daemon configuration
//!
//! One service entry per fleet, one instance per backend that already has a
//! hostname. Instances are ordered by backend name.

use super::RenderError;
use crate::api::BalancedFleet;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct BalancerConfig {
    services: Vec<BalancerService>,
}

#[derive(Debug, Serialize)]
struct BalancerService {
    instances: Vec<Instance>,
    key: String,
}

#[derive(Debug, Serialize)]
struct Instance {
    name: String,
    address: String,
}

/// YAML config for the balancer daemon
pub fn render_balancer_config(fleet: &BalancedFleet, key_path: &str) -> Result<String, RenderError> {
    // BTreeMap iteration keeps instance order stable
    let instances = fleet
        .status
        .backends
        .iter()
        .filter(|(_, status)| !status.hostname.is_empty())
        .map(|(name, status)| Instance {
            name: name.clone(),
            address: status.hostname.clone(),
        })
        .collect();

    let config = BalancerConfig {
        services: vec![BalancerService {
            instances,
            key: key_path.to_string(),
        }],
    };
    serde_yaml::to_string(&config).map_err(|e| RenderError::Encode(e.to_string()))
}

/// Torrc of the Tor daemon running next to the balancer
pub fn render_balancer_torrc(control_port: u16) -> String {
    format!("SocksPort 0\nControlPort 127.0.0.1:{}\n", control_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BalancedFleetSpec, HiddenServiceStatus};

    fn status(hostname: &str) -> HiddenServiceStatus {
        HiddenServiceStatus {
            hostname: hostname.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_only_resolved_backends_are_listed() {
        let mut fleet = BalancedFleet::new("default", "shop", BalancedFleetSpec::default());
        fleet
            .status
            .backends
            .insert("shop-tor-obb-2".to_string(), status("bbb.onion"));
        fleet
            .status
            .backends
            .insert("shop-tor-obb-1".to_string(), status("aaa.onion"));
        fleet
            .status
            .backends
            .insert("shop-tor-obb-3".to_string(), status(""));

        let yaml = render_balancer_config(&fleet, "key/hs_ed25519_secret_key").unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let service = &parsed["services"][0];
        assert_eq!(service["key"].as_str(), Some("key/hs_ed25519_secret_key"));

        let instances = service["instances"].as_sequence().unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0]["name"].as_str(), Some("shop-tor-obb-1"));
        assert_eq!(instances[0]["address"].as_str(), Some("aaa.onion"));
        assert_eq!(instances[1]["name"].as_str(), Some("shop-tor-obb-2"));

        // Same input, same bytes
        assert_eq!(yaml, render_balancer_config(&fleet, "key/hs_ed25519_secret_key").unwrap());
    }

    #[test]
    fn test_balancer_torrc() {
        assert_eq!(
            render_balancer_torrc(6666),
            "SocksPort 0\nControlPort 127.0.0.1:6666\n"
        );
    }
}
