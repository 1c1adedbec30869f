//! HiddenService reconciler

use super::network::{ensure_metrics, ensure_service, service_ports};
use super::primitive::Child;
use super::rbac::ensure_agent_rbac;
use super::secret::{ensure_authorized_clients, ensure_control_secret, ensure_identity_secret};
use super::workload::{ensure_deployment, service_deployment};
use super::{Context, ReconcileError};
use crate::api::onion::UNRESOLVED_ADDRESS;
use crate::api::{HiddenService, HiddenServiceStatus, ObjectKey, OwnerReference, Service};
use crate::controller::{Action, Reconciler};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Backends are compared on spec and labels; their status belongs to their
/// own reconciler.
impl Child for HiddenService {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.spec == other.spec && self.metadata.labels == other.metadata.labels
    }

    fn carry_over(&mut self, current: &Self) {
        self.metadata.carry_server_fields(&current.metadata);
        self.status = current.status.clone();
    }
}

/// Name of the identity secret of `hs`
pub fn identity_secret_name(hs: &HiddenService, ctx: &Context) -> String {
    hs.spec
        .private_key_secret_ref
        .as_ref()
        .map(|r| r.name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| ctx.config.names.secret(&hs.metadata.name))
}

pub struct HiddenServiceReconciler {
    ctx: Context,
}

impl HiddenServiceReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// One pass over `key`; a missing resource is a no-op
    pub async fn reconcile_key(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let api = self.ctx.api::<HiddenService>(&key.namespace);
        let Some(hs) = api.get_opt(&key.name).await? else {
            debug!("HiddenService {} no longer exists", key);
            return Ok(Action::Done);
        };
        hs.validate()?;

        let hostname = self.ensure_children(&hs).await?;
        let resolved = self.resolve_backends(&hs).await?;

        let status = HiddenServiceStatus {
            hostname: hostname.unwrap_or_else(|| hs.status.hostname.clone()),
            resolved_backend_address: primary_backend_address(&hs, &resolved),
            resolved_backends: resolved,
        };
        if status != hs.status {
            let mut updated = hs;
            updated.status = status;
            let updated = api.update(updated).await?;
            info!(
                "Updated status of HiddenService {} (hostname {:?})",
                key, updated.status.hostname
            );
        }
        Ok(Action::Done)
    }

    /// Run the child pipeline in order; returns the identity's address
    async fn ensure_children(&self, hs: &HiddenService) -> Result<Option<String>, ReconcileError> {
        let ctx = &self.ctx;
        let names = &ctx.config.names;
        let namespace = hs.metadata.namespace.as_str();
        let name = hs.metadata.name.as_str();
        let owner = OwnerReference::controller_of(hs);

        let secret_name = identity_secret_name(hs, ctx);
        let hostname = ensure_identity_secret(
            ctx,
            &owner,
            namespace,
            &secret_name,
            hs.spec.effective_version(),
        )
        .await?;

        ensure_authorized_clients(
            ctx,
            &owner,
            namespace,
            &names.authorized_clients(name),
            &hs.spec.authorized_client_refs,
        )
        .await?;
        ensure_control_secret(ctx, &owner, namespace, &names.control_secret(name)).await?;

        ensure_agent_rbac(ctx, &owner, namespace, name).await?;

        ensure_service(ctx, &owner, namespace, name, service_ports(&hs.spec.rules)).await?;
        ensure_metrics(ctx, &owner, namespace, name, hs.spec.monitor_enabled).await?;

        ensure_deployment(ctx, &owner, service_deployment(hs, &secret_name, &ctx.config)).await?;

        Ok(hostname)
    }

    /// Cluster IP of every Service a rule names; a missing Service maps to
    /// the unresolved address
    async fn resolve_backends(
        &self,
        hs: &HiddenService,
    ) -> Result<BTreeMap<String, String>, ReconcileError> {
        let services = self.ctx.api::<Service>(&hs.metadata.namespace);
        let mut resolved = BTreeMap::new();
        for name in hs.spec.backend_services() {
            let ip = services
                .get_opt(name)
                .await?
                .map(|svc| svc.spec.cluster_ip)
                .filter(|ip| !ip.is_empty())
                .unwrap_or_else(|| UNRESOLVED_ADDRESS.to_string());
            resolved.insert(name.to_string(), ip);
        }
        Ok(resolved)
    }
}

/// Address of the first Service-named rule's backend, else the first rule's
/// IP literal
fn primary_backend_address(hs: &HiddenService, resolved: &BTreeMap<String, String>) -> String {
    if let Some(name) = hs.spec.backend_services().first() {
        return resolved
            .get(*name)
            .cloned()
            .unwrap_or_else(|| UNRESOLVED_ADDRESS.to_string());
    }
    hs.spec
        .rules
        .first()
        .map(|rule| rule.backend_address.clone())
        .unwrap_or_else(|| UNRESOLVED_ADDRESS.to_string())
}

#[async_trait]
impl Reconciler for HiddenServiceReconciler {
    type Error = ReconcileError;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_key(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        Deployment, HiddenServiceSpec, ObjectMeta, PortRule, Role, RoleBinding, Secret,
        ServiceAccount, ServiceMonitor,
    };
    use crate::config::Config;
    use crate::store::{ClusterApi, MemoryStore};
    use std::sync::Arc;

    fn context() -> Context {
        let client: Arc<dyn ClusterApi> = Arc::new(MemoryStore::new());
        Context::new(client, Arc::new(Config::default()))
    }

    fn spec(addr: &str) -> HiddenServiceSpec {
        HiddenServiceSpec {
            rules: vec![PortRule {
                name: Some("http".to_string()),
                public_port: 80,
                backend_address: addr.to_string(),
                backend_port: 8080,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pipeline_creates_children_and_status() {
        let ctx = context();
        let services = ctx.api::<HiddenService>("default");
        services
            .create(HiddenService::new("default", "web", spec("10.0.0.9")))
            .await
            .unwrap();

        let reconciler = HiddenServiceReconciler::new(ctx.clone());
        let key = ObjectKey::new("default", "web");
        assert_eq!(reconciler.reconcile_key(&key).await.unwrap(), Action::Done);

        let secrets = ctx.api::<Secret>("default");
        assert!(secrets.get_opt("web-tor-secret").await.unwrap().is_some());
        assert!(secrets.get_opt("web-tor-control").await.unwrap().is_some());
        assert!(secrets
            .get_opt("web-tor-authorized-clients")
            .await
            .unwrap()
            .is_none());
        assert!(ctx
            .api::<ServiceAccount>("default")
            .get_opt("web-tor-sa")
            .await
            .unwrap()
            .is_some());
        assert!(ctx.api::<Role>("default").get_opt("web-tor-role").await.unwrap().is_some());
        assert!(ctx
            .api::<RoleBinding>("default")
            .get_opt("web-tor-role")
            .await
            .unwrap()
            .is_some());
        assert!(ctx.api::<Service>("default").get_opt("web-tor-svc").await.unwrap().is_some());
        assert!(ctx
            .api::<Service>("default")
            .get_opt("web-tor-metrics-svc")
            .await
            .unwrap()
            .is_some());
        assert!(ctx
            .api::<ServiceMonitor>("default")
            .get_opt("web-tor-metrics-svc")
            .await
            .unwrap()
            .is_none());
        assert!(ctx
            .api::<Deployment>("default")
            .get_opt("web-tor-daemon")
            .await
            .unwrap()
            .is_some());

        let hs = services.get("web").await.unwrap();
        assert!(hs.status.hostname.ends_with(".onion"));
        assert_eq!(hs.status.resolved_backend_address, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_backend_service_name_is_resolved() {
        let ctx = context();
        let backend = ctx
            .api::<Service>("default")
            .create(Service {
                metadata: ObjectMeta::new("default", "web-backend"),
                ..Default::default()
            })
            .await
            .unwrap();
        ctx.api::<HiddenService>("default")
            .create(HiddenService::new("default", "web", spec("web-backend")))
            .await
            .unwrap();
        ctx.api::<HiddenService>("default")
            .create(HiddenService::new("default", "lost", spec("nowhere")))
            .await
            .unwrap();

        let reconciler = HiddenServiceReconciler::new(ctx.clone());
        reconciler
            .reconcile_key(&ObjectKey::new("default", "web"))
            .await
            .unwrap();
        reconciler
            .reconcile_key(&ObjectKey::new("default", "lost"))
            .await
            .unwrap();

        let api = ctx.api::<HiddenService>("default");
        assert_eq!(
            api.get("web").await.unwrap().status.resolved_backend_address,
            backend.spec.cluster_ip
        );
        assert_eq!(
            api.get("lost").await.unwrap().status.resolved_backend_address,
            UNRESOLVED_ADDRESS
        );
    }

    #[tokio::test]
    async fn test_each_rule_resolves_its_own_service() {
        let ctx = context();
        for (name, ip) in [("svc-a", "10.96.0.1"), ("svc-b", "10.96.0.2")] {
            let mut svc = Service {
                metadata: ObjectMeta::new("default", name),
                ..Default::default()
            };
            svc.spec.cluster_ip = ip.to_string();
            ctx.api::<Service>("default").create(svc).await.unwrap();
        }
        let mut spec = spec("svc-a");
        spec.rules.push(PortRule {
            name: Some("https".to_string()),
            public_port: 443,
            backend_address: "svc-b".to_string(),
            backend_port: 8443,
        });
        let api = ctx.api::<HiddenService>("default");
        api.create(HiddenService::new("default", "web", spec))
            .await
            .unwrap();

        HiddenServiceReconciler::new(ctx.clone())
            .reconcile_key(&ObjectKey::new("default", "web"))
            .await
            .unwrap();

        let status = api.get("web").await.unwrap().status;
        assert_eq!(status.resolved_backend_address, "10.96.0.1");
        assert_eq!(status.backend_for("svc-a"), Some("10.96.0.1"));
        assert_eq!(status.backend_for("svc-b"), Some("10.96.0.2"));
    }

    #[tokio::test]
    async fn test_monitor_follows_flag() {
        let ctx = context();
        let api = ctx.api::<HiddenService>("default");
        let mut spec = spec("10.0.0.9");
        spec.monitor_enabled = true;
        api.create(HiddenService::new("default", "web", spec))
            .await
            .unwrap();

        let reconciler = HiddenServiceReconciler::new(ctx.clone());
        let key = ObjectKey::new("default", "web");
        reconciler.reconcile_key(&key).await.unwrap();
        let monitors = ctx.api::<ServiceMonitor>("default");
        assert!(monitors.get_opt("web-tor-metrics-svc").await.unwrap().is_some());

        let mut hs = api.get("web").await.unwrap();
        hs.spec.monitor_enabled = false;
        api.update(hs).await.unwrap();
        reconciler.reconcile_key(&key).await.unwrap();
        assert!(monitors.get_opt("web-tor-metrics-svc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected() {
        let ctx = context();
        let mut hs = HiddenService::new("default", "web", spec("10.0.0.9"));
        hs.spec.version = 7;
        ctx.api::<HiddenService>("default").create(hs).await.unwrap();

        let err = HiddenServiceReconciler::new(ctx.clone())
            .reconcile_key(&ObjectKey::new("default", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid(_)));
        assert!(ctx
            .api::<Secret>("default")
            .get_opt("web-tor-secret")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_resource_is_done() {
        let reconciler = HiddenServiceReconciler::new(context());
        let action = reconciler
            .reconcile_key(&ObjectKey::new("default", "gone"))
            .await
            .unwrap();
        assert_eq!(action, Action::Done);
    }
}
