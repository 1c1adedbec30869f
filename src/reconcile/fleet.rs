//! BalancedFleet reconciler and backend fan-out
//!
//! The fleet's own pipeline runs first; it yields the fleet address every
//! backend needs as its master. Backends are then ensured one per index,
//! surplus owned backends are removed, and the observed backend statuses are
//! folded into the fleet's status. Until every backend reports a hostname
//! the fleet is re-evaluated on a fixed delay, since backend hostnames are
//! assigned by other reconcile passes.

use super::network::ensure_service;
use super::primitive::{delete_owned, ensure_owned};
use super::rbac::ensure_agent_rbac;
use super::secret::ensure_identity_secret;
use super::workload::{balancer_deployment, ensure_balancer_config_map, ensure_deployment};
use super::{Context, ReconcileError};
use crate::api::{
    BalancedFleet, BalancedFleetStatus, HiddenService, HiddenServiceStatus, ObjectKey, ObjectMeta,
    OwnerReference, ServicePort,
};
use crate::controller::{Action, Reconciler};
use crate::store::Selector;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Names of the desired backends, index 1 first
pub fn backend_names(ctx: &Context, fleet: &BalancedFleet) -> Vec<String> {
    (1..=fleet.spec.backend_count)
        .map(|idx| ctx.config.names.backend(&fleet.metadata.name, idx))
        .collect()
}

pub struct BalancedFleetReconciler {
    ctx: Context,
}

impl BalancedFleetReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub async fn reconcile_key(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let api = self.ctx.api::<BalancedFleet>(&key.namespace);
        let Some(fleet) = api.get_opt(&key.name).await? else {
            debug!("BalancedFleet {} no longer exists", key);
            return Ok(Action::Done);
        };
        fleet.validate()?;

        let owner = OwnerReference::controller_of(&fleet);
        let (hostname, resolved_address) = self.ensure_children(&fleet, &owner).await?;

        let Some(hostname) = hostname else {
            return Err(ReconcileError::precondition(format!(
                "BalancedFleet {} has no address yet, not creating backends",
                key
            )));
        };

        self.ensure_backends(&fleet, &owner, &hostname).await?;
        let backends = self.observe_backends(&fleet, &owner).await?;

        let status = BalancedFleetStatus {
            hostname,
            resolved_address,
            backends,
        };
        let mut fleet = fleet;
        if status != fleet.status {
            fleet.status = status;
            fleet = api.update(fleet).await?;
            info!(
                "Updated status of BalancedFleet {} ({}/{} backends)",
                key,
                fleet.status.backends.len(),
                fleet.spec.backend_count
            );
        }

        if fleet.is_synced() {
            Ok(Action::Done)
        } else {
            let delay = self.ctx.config.controller.convergence_requeue();
            debug!("BalancedFleet {} not synced, re-checking in {:?}", key, delay);
            Ok(Action::RequeueAfter(delay))
        }
    }

    /// Fleet pipeline; returns the fleet address and service cluster IP
    async fn ensure_children(
        &self,
        fleet: &BalancedFleet,
        owner: &OwnerReference,
    ) -> Result<(Option<String>, String), ReconcileError> {
        let ctx = &self.ctx;
        let names = &ctx.config.names;
        let namespace = fleet.metadata.namespace.as_str();
        let name = fleet.metadata.name.as_str();

        let secret_name = fleet
            .spec
            .private_key_secret_ref
            .as_ref()
            .map(|r| r.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| names.secret(name));
        let hostname = ensure_identity_secret(ctx, owner, namespace, &secret_name, 3).await?;

        ensure_agent_rbac(ctx, owner, namespace, name).await?;

        let port = ctx.config.ports.balancer_control;
        let service = ensure_service(
            ctx,
            owner,
            namespace,
            name,
            vec![ServicePort {
                name: "control".to_string(),
                port,
                target_port: port,
            }],
        )
        .await?;

        ensure_balancer_config_map(ctx, owner, namespace, name).await?;
        ensure_deployment(
            ctx,
            owner,
            balancer_deployment(
                namespace,
                name,
                &secret_name,
                &fleet.spec.balancer_template,
                &ctx.config,
            ),
        )
        .await?;

        Ok((hostname, service.spec.cluster_ip))
    }

    /// One backend HiddenService per index, pointed at the fleet address
    async fn ensure_backends(
        &self,
        fleet: &BalancedFleet,
        owner: &OwnerReference,
        master: &str,
    ) -> Result<(), ReconcileError> {
        let namespace = fleet.metadata.namespace.as_str();
        let api = self.ctx.api::<HiddenService>(namespace);
        let desired = backend_names(&self.ctx, fleet);

        for backend in &desired {
            let mut spec = fleet.spec.backend_template.clone();
            spec.master_address = Some(master.to_string());
            ensure_owned(&api, owner, backend, |_| {
                Ok(HiddenService {
                    metadata: ObjectMeta::new(namespace, backend),
                    spec,
                    status: Default::default(),
                })
            })
            .await?;
        }

        let desired: BTreeSet<&String> = desired.iter().collect();
        for existing in api.list(&Selector::all()).await? {
            if existing.metadata.is_controlled_by(owner) && !desired.contains(&existing.metadata.name)
            {
                info!(
                    "Scaling down BalancedFleet {}: removing backend {}",
                    fleet.metadata.key(),
                    existing.metadata.name
                );
                delete_owned(&api, owner, &existing.metadata.name).await?;
            }
        }
        Ok(())
    }

    /// Status of every backend this fleet controls, keyed by name
    async fn observe_backends(
        &self,
        fleet: &BalancedFleet,
        owner: &OwnerReference,
    ) -> Result<BTreeMap<String, HiddenServiceStatus>, ReconcileError> {
        let api = self.ctx.api::<HiddenService>(&fleet.metadata.namespace);
        Ok(api
            .list(&Selector::all())
            .await?
            .into_iter()
            .filter(|hs| hs.metadata.is_controlled_by(owner))
            .map(|hs| (hs.metadata.name, hs.status))
            .collect())
    }
}

#[async_trait]
impl Reconciler for BalancedFleetReconciler {
    type Error = ReconcileError;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_key(key).await
    }
}
