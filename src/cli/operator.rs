//! Operator command - run the resource controllers

use super::open_store;
use crate::api::Kind;
use crate::config::Config;
use crate::controller::{Controller, ControllerSettings, EventRecorder};
use crate::reconcile::{BalancedFleetReconciler, Context, HiddenServiceReconciler};
use crate::store::Selector;
use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Kinds a HiddenService reconciler creates
const SERVICE_CHILDREN: [Kind; 7] = [
    Kind::Secret,
    Kind::ServiceAccount,
    Kind::Role,
    Kind::RoleBinding,
    Kind::Service,
    Kind::ServiceMonitor,
    Kind::Deployment,
];

/// Kinds a BalancedFleet reconciler creates
const FLEET_CHILDREN: [Kind; 8] = [
    Kind::HiddenService,
    Kind::Secret,
    Kind::ServiceAccount,
    Kind::Role,
    Kind::RoleBinding,
    Kind::Service,
    Kind::ConfigMap,
    Kind::Deployment,
];

/// Run the operator command
pub async fn run_operator(config: Config) -> Result<()> {
    info!("tor-operator v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let client = open_store(&config)?;
    let ctx = Context::new(client.clone(), config.clone());
    let settings = ControllerSettings::operator(&config.controller);
    let shutdown = CancellationToken::new();

    let mut services = Controller::new(
        HiddenServiceReconciler::new(ctx.clone()),
        client.clone(),
        Kind::HiddenService,
        Selector::all(),
        settings.clone(),
    )
    .with_recorder(EventRecorder::new(client.clone()));
    for kind in SERVICE_CHILDREN {
        services = services.owns(kind);
    }

    let mut fleets = Controller::new(
        BalancedFleetReconciler::new(ctx),
        client.clone(),
        Kind::BalancedFleet,
        Selector::all(),
        settings,
    )
    .with_recorder(EventRecorder::new(client));
    for kind in FLEET_CHILDREN {
        fleets = fleets.owns(kind);
    }

    let services = tokio::spawn(services.run(shutdown.clone()));
    let fleets = tokio::spawn(fleets.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");
    shutdown.cancel();

    for (name, handle) in [("HiddenService", services), ("BalancedFleet", fleets)] {
        if let Err(e) = handle.await {
            error!("{} controller failed: {}", name, e);
        }
    }
    info!("tor-operator stopped");
    Ok(())
}
