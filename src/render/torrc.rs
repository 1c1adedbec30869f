//! Tor daemon configuration for a single hidden service

use super::{check_single_token, RenderError};
use crate::api::HiddenService;
use crate::config::Config;
use std::net::IpAddr;
use std::path::PathBuf;

/// Everything besides the resource that shapes the torrc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrcOptions {
    pub socks_port: u16,
    pub control_port: u16,
    pub metrics_port: u16,
    pub metrics_policy: String,
    pub service_dir: PathBuf,
    /// `HashedControlPassword` values, one line each
    pub hashed_passwords: Vec<String>,
}

impl TorrcOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            socks_port: config.ports.socks,
            control_port: config.ports.control,
            metrics_port: config.ports.metrics,
            metrics_policy: config.ports.metrics_policy.clone(),
            service_dir: config.agent.service_dir.clone(),
            hashed_passwords: Vec::new(),
        }
    }

    pub fn with_hashed_passwords(mut self, passwords: Vec<String>) -> Self {
        self.hashed_passwords = passwords;
        self
    }
}

/// Render the torrc for `hs`
///
/// A rule whose backend address names a Service is pointed at that
/// Service's resolved address from the status, once known.
pub fn render_service_torrc(hs: &HiddenService, opts: &TorrcOptions) -> Result<String, RenderError> {
    let mut out = String::new();
    out.push_str("# Config automatically generated\n");
    out.push_str(&format!(
        "# {}/{}\n",
        hs.metadata.namespace, hs.metadata.name
    ));

    out.push_str(&format!("SocksPort 0.0.0.0:{}\n", opts.socks_port));
    out.push_str(&format!("ControlPort 0.0.0.0:{}\n", opts.control_port));
    for hashed in &opts.hashed_passwords {
        check_single_token("HashedControlPassword", hashed)?;
        out.push_str(&format!("HashedControlPassword {}\n", hashed));
    }
    out.push_str(&format!("MetricsPort 0.0.0.0:{}\n", opts.metrics_port));
    out.push_str(&format!("MetricsPortPolicy {}\n", opts.metrics_policy));
    out.push('\n');

    out.push_str(&format!(
        "HiddenServiceDir {}\n",
        opts.service_dir.display()
    ));
    if let Some(master) = hs.spec.master() {
        check_single_token("masterAddress", master)?;
        out.push_str("HiddenServiceOnionbalanceInstance 1\n");
    }
    out.push_str(&format!(
        "HiddenServiceVersion {}\n",
        hs.spec.effective_version()
    ));

    for (index, rule) in hs.spec.rules.iter().enumerate() {
        if rule.public_port == 0 || rule.backend_port == 0 {
            return Err(RenderError::InvalidRule {
                index,
                reason: "port 0".to_string(),
            });
        }
        check_single_token("backendAddress", &rule.backend_address).map_err(|e| {
            RenderError::InvalidRule {
                index,
                reason: e.to_string(),
            }
        })?;

        let address = if rule.backend_address.parse::<IpAddr>().is_ok() {
            rule.backend_address.as_str()
        } else {
            hs.status
                .backend_for(&rule.backend_address)
                .unwrap_or(rule.backend_address.as_str())
        };
        out.push_str(&format!(
            "HiddenServicePort {} {}:{}\n",
            rule.public_port, address, rule.backend_port
        ));
    }

    if let Some(extra) = hs.spec.extra_config.as_deref().filter(|e| !e.trim().is_empty()) {
        out.push('\n');
        out.push_str(extra);
        if !extra.ends_with('\n') {
            out.push('\n');
        }
    }

    Ok(out)
}

/// Companion file read by Tor when the service is an onionbalance instance
pub fn render_ob_config(master: &str) -> Result<String, RenderError> {
    check_single_token("masterAddress", master)?;
    Ok(format!("MasterOnionAddress {}\n", master))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HiddenServiceSpec, PortRule};

    fn service() -> HiddenService {
        let mut hs = HiddenService::new("default", "web", HiddenServiceSpec::default());
        hs.spec.rules.push(PortRule {
            name: Some("http".to_string()),
            public_port: 80,
            backend_address: "10.0.0.7".to_string(),
            backend_port: 8080,
        });
        hs
    }

    fn options() -> TorrcOptions {
        TorrcOptions::from_config(&Config::default())
    }

    #[test]
    fn test_render_layout() {
        let torrc = render_service_torrc(&service(), &options()).unwrap();
        let expected = "\
# Config automatically generated
# default/web
SocksPort 0.0.0.0:9050
ControlPort 0.0.0.0:9051
MetricsPort 0.0.0.0:9035
MetricsPortPolicy accept 0.0.0.0/0

HiddenServiceDir /run/tor/service
HiddenServiceVersion 3
HiddenServicePort 80 10.0.0.7:8080
";
        assert_eq!(torrc, expected);
    }

    #[test]
    fn test_render_is_deterministic() {
        let hs = service();
        let a = render_service_torrc(&hs, &options()).unwrap();
        let b = render_service_torrc(&hs, &options()).unwrap();
        assert_eq!(a, b);

        let mut changed = hs.clone();
        changed.spec.rules[0].backend_port = 8081;
        assert_ne!(a, render_service_torrc(&changed, &options()).unwrap());

        let mut changed = hs;
        changed.spec.version = 2;
        assert_ne!(a, render_service_torrc(&changed, &options()).unwrap());
    }

    #[test]
    fn test_render_backend_instance() {
        let mut hs = service();
        hs.spec.master_address = Some("master.onion".to_string());
        hs.spec.extra_config = Some("HiddenServiceNumIntroductionPoints 5".to_string());
        let opts = options().with_hashed_passwords(vec!["16:ABCDEF".to_string()]);

        let torrc = render_service_torrc(&hs, &opts).unwrap();
        assert!(torrc.contains("HashedControlPassword 16:ABCDEF\n"));
        assert!(torrc.contains(
            "HiddenServiceDir /run/tor/service\nHiddenServiceOnionbalanceInstance 1\n"
        ));
        assert!(torrc.ends_with("\nHiddenServiceNumIntroductionPoints 5\n"));
    }

    #[test]
    fn test_service_name_uses_resolved_address() {
        let mut hs = service();
        hs.spec.rules[0].backend_address = "web".to_string();
        let torrc = render_service_torrc(&hs, &options()).unwrap();
        assert!(torrc.contains("HiddenServicePort 80 web:8080"));

        hs.status
            .resolved_backends
            .insert("web".to_string(), "10.96.0.4".to_string());
        let torrc = render_service_torrc(&hs, &options()).unwrap();
        assert!(torrc.contains("HiddenServicePort 80 10.96.0.4:8080"));
    }

    #[test]
    fn test_rules_keep_their_own_service() {
        let mut hs = service();
        hs.spec.rules[0].backend_address = "svc-a".to_string();
        hs.spec.rules.push(PortRule {
            name: Some("https".to_string()),
            public_port: 443,
            backend_address: "svc-b".to_string(),
            backend_port: 8443,
        });
        hs.spec.rules.push(PortRule {
            name: None,
            public_port: 22,
            backend_address: "10.0.0.7".to_string(),
            backend_port: 2222,
        });
        hs.status.resolved_backend_address = "10.96.0.1".to_string();
        hs.status
            .resolved_backends
            .insert("svc-a".to_string(), "10.96.0.1".to_string());
        hs.status
            .resolved_backends
            .insert("svc-b".to_string(), "10.96.0.2".to_string());

        let torrc = render_service_torrc(&hs, &options()).unwrap();
        assert!(torrc.contains("HiddenServicePort 80 10.96.0.1:8080\n"));
        assert!(torrc.contains("HiddenServicePort 443 10.96.0.2:8443\n"));
        assert!(torrc.contains("HiddenServicePort 22 10.0.0.7:2222\n"));
    }

    #[test]
    fn test_invalid_rules() {
        let mut hs = service();
        hs.spec.rules[0].backend_address = "10.0.0.7\nControlPort 1".to_string();
        assert!(matches!(
            render_service_torrc(&hs, &options()),
            Err(RenderError::InvalidRule { index: 0, .. })
        ));

        let mut hs = service();
        hs.spec.rules[0].public_port = 0;
        assert!(render_service_torrc(&hs, &options()).is_err());
    }

    #[test]
    fn test_ob_config() {
        assert_eq!(
            render_ob_config("abc.onion").unwrap(),
            "MasterOnionAddress abc.onion\n"
        );
        assert!(render_ob_config("").is_err());
    }
}
