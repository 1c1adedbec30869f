//! Service, metrics service and service monitor children

use super::primitive::{delete_owned, ensure_owned, Child};
use super::{selector_labels, Context, ReconcileError};
use crate::api::{
    MonitorEndpoint, ObjectMeta, OwnerReference, PortRule, Service, ServiceMonitor,
    ServiceMonitorSpec, ServicePort, ServiceSpec,
};

/// Port name shared by the metrics service and its monitor endpoint
pub const METRICS_PORT_NAME: &str = "metrics";
const METRICS_PATH: &str = "/metrics";

impl Child for Service {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.spec.selector == other.spec.selector
            && self.spec.ports == other.spec.ports
            && self.metadata.labels == other.metadata.labels
    }

    fn carry_over(&mut self, current: &Self) {
        self.metadata.carry_server_fields(&current.metadata);
        self.spec.cluster_ip = current.spec.cluster_ip.clone();
    }
}

impl Child for ServiceMonitor {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.spec == other.spec && self.metadata.labels == other.metadata.labels
    }
}

/// One service port per rule, named after the rule or its public port
pub fn service_ports(rules: &[PortRule]) -> Vec<ServicePort> {
    rules
        .iter()
        .map(|rule| ServicePort {
            name: rule
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| rule.public_port.to_string()),
            port: rule.public_port,
            target_port: rule.public_port,
        })
        .collect()
}

/// Ensure the service exposing the daemon pods and return it
///
/// The returned object carries the cluster IP the store assigned.
pub async fn ensure_service(
    ctx: &Context,
    owner: &OwnerReference,
    namespace: &str,
    resource_name: &str,
    ports: Vec<ServicePort>,
) -> Result<Service, ReconcileError> {
    let name = ctx.config.names.service(resource_name);
    let selector = selector_labels(&name, resource_name);
    let outcome = ensure_owned(&ctx.api::<Service>(namespace), owner, &name, |_| {
        Ok(Service {
            metadata: ObjectMeta::new(namespace, &name).with_labels(selector.clone()),
            spec: ServiceSpec {
                selector,
                ports,
                cluster_ip: String::new(),
            },
        })
    })
    .await?;
    Ok(outcome.into_inner())
}

/// Ensure the metrics service, then the monitor when enabled
pub async fn ensure_metrics(
    ctx: &Context,
    owner: &OwnerReference,
    namespace: &str,
    resource_name: &str,
    monitor_enabled: bool,
) -> Result<(), ReconcileError> {
    let names = &ctx.config.names;
    let name = names.metrics_service(resource_name);
    let selector = selector_labels(&name, resource_name);
    let metrics_port = ctx.config.ports.metrics;

    ensure_owned(&ctx.api::<Service>(namespace), owner, &name, |_| {
        Ok(Service {
            metadata: ObjectMeta::new(namespace, &name).with_labels(selector.clone()),
            spec: ServiceSpec {
                selector: selector.clone(),
                ports: vec![ServicePort {
                    name: METRICS_PORT_NAME.to_string(),
                    port: metrics_port,
                    target_port: metrics_port,
                }],
                cluster_ip: String::new(),
            },
        })
    })
    .await?;

    let monitors = ctx.api::<ServiceMonitor>(namespace);
    let monitor_name = names.service_monitor(resource_name);
    if !monitor_enabled {
        delete_owned(&monitors, owner, &monitor_name).await?;
        return Ok(());
    }

    ensure_owned(&monitors, owner, &monitor_name, |_| {
        Ok(ServiceMonitor {
            metadata: ObjectMeta::new(namespace, &monitor_name).with_labels(selector.clone()),
            spec: ServiceMonitorSpec {
                selector,
                endpoints: vec![MonitorEndpoint {
                    port: METRICS_PORT_NAME.to_string(),
                    path: METRICS_PATH.to_string(),
                }],
            },
        })
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_ports_from_rules() {
        let rules = vec![
            PortRule {
                name: Some("http".to_string()),
                public_port: 80,
                backend_address: "web".to_string(),
                backend_port: 8080,
            },
            PortRule {
                name: None,
                public_port: 443,
                backend_address: "10.0.0.5".to_string(),
                backend_port: 8443,
            },
        ];
        let ports = service_ports(&rules);
        assert_eq!(ports[0].name, "http");
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].target_port, 80);
        assert_eq!(ports[1].name, "443");
    }

    #[test]
    fn test_cluster_ip_survives_update() {
        let mut current = Service::default();
        current.spec.cluster_ip = "10.96.0.7".to_string();
        current.metadata.uid = "abc".to_string();

        let mut want = Service::default();
        want.carry_over(&current);
        assert_eq!(want.spec.cluster_ip, "10.96.0.7");
        assert_eq!(want.metadata.uid, "abc");
        assert!(want.semantically_equal(&current));
    }
}
