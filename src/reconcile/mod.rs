//! Resource reconcilers
//!
//! Each reconciler runs a fixed, ordered pipeline of [`ensure_owned`] calls
//! for one resource instance and then writes its observed status. The first
//! failing step aborts the pass.

pub mod error;
pub mod fleet;
pub mod network;
pub mod onion;
pub mod primitive;
pub mod rbac;
pub mod secret;
pub mod workload;

pub use error::ReconcileError;
pub use fleet::BalancedFleetReconciler;
pub use onion::HiddenServiceReconciler;
pub use primitive::{delete_owned, ensure_owned, Child, Outcome};

use crate::api::Resource;
use crate::config::Config;
use crate::store::{Api, ClusterApi};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared handles every reconciler is constructed with
#[derive(Clone)]
pub struct Context {
    pub client: Arc<dyn ClusterApi>,
    pub config: Arc<Config>,
}

impl Context {
    pub fn new(client: Arc<dyn ClusterApi>, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    pub fn api<R: Resource>(&self, namespace: &str) -> Api<R> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// `{app: <service name>, controller: <resource name>}`
pub fn selector_labels(app: &str, controller: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), app.to_string());
    labels.insert("controller".to_string(), controller.to_string());
    labels
}
