//! Cluster API boundary
//!
//! The reconcilers only ever talk to the cluster through [`ClusterApi`]:
//! get, create, update, delete, list and a watch feed. Two backends are
//! provided: [`MemoryStore`] for a single process (and tests) and
//! [`FsStore`], a directory of YAML objects shared between the operator and
//! node agents.

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use crate::api::{Kind, Object, ObjectKey, ObjectMeta, Resource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Errors returned by a [`ClusterApi`] backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: Kind, key: ObjectKey },

    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: ObjectKey },

    #[error("{kind} {key} was modified concurrently (resource version {expected} is stale)")]
    Conflict {
        kind: Kind,
        key: ObjectKey,
        expected: u64,
    },

    #[error("{kind} {key} cannot be stored under that namespace or name")]
    InvalidKey { kind: Kind, key: ObjectKey },

    #[error("expected a {expected} object, store returned {found}")]
    UnexpectedKind { expected: Kind, found: Kind },

    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed stored object: {0}")]
    Serde(String),
}

/// Change notification delivered by a watch
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
}

impl WatchEvent {
    pub fn object(&self) -> &Object {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Namespace / name / label filter for list and watch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    /// Exactly one object
    pub fn named(key: &ObjectKey) -> Self {
        Self {
            namespace: Some(key.namespace.clone()),
            name: Some(key.name.clone()),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ns) = &self.namespace {
            if ns != &meta.namespace {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if name != &meta.name {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k) == Some(v))
    }
}

/// Filtered view over a store's change feed
pub struct Watcher {
    kind: Kind,
    selector: Selector,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Watcher {
    pub fn new(kind: Kind, selector: Selector, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self { kind, selector, rx }
    }

    /// Next matching event; `None` once the store is gone
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let obj = event.object();
                    if obj.kind() == self.kind && self.selector.matches(obj.meta()) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Missed events are picked up by the next resync
                    warn!("{} watch lagged by {} events", self.kind, n);
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The operations the core needs from the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<Option<Object>, StoreError>;

    /// Store a new object; uid, resource version and creation time are assigned
    async fn create(&self, obj: Object) -> Result<Object, StoreError>;

    /// Replace an existing object. A non-zero resource version must match
    /// the stored one.
    async fn update(&self, obj: Object) -> Result<Object, StoreError>;

    /// Remove an object and everything it controls
    async fn delete(&self, kind: Kind, key: &ObjectKey) -> Result<(), StoreError>;

    async fn list(&self, kind: Kind, selector: &Selector) -> Result<Vec<Object>, StoreError>;

    fn watch(&self, kind: Kind, selector: Selector) -> Watcher;
}

/// Typed, namespaced handle over a [`ClusterApi`]
pub struct Api<R> {
    client: Arc<dyn ClusterApi>,
    namespace: String,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for Api<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R: Resource> Api<R> {
    pub fn namespaced(client: Arc<dyn ClusterApi>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(&self.namespace, name)
    }

    fn typed(obj: Object) -> Result<R, StoreError> {
        let found = obj.kind();
        R::from_object(obj).ok_or(StoreError::UnexpectedKind {
            expected: R::KIND,
            found,
        })
    }

    pub async fn get_opt(&self, name: &str) -> Result<Option<R>, StoreError> {
        match self.client.get(R::KIND, &self.key(name)).await? {
            Some(obj) => Ok(Some(Self::typed(obj)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, name: &str) -> Result<R, StoreError> {
        self.get_opt(name).await?.ok_or_else(|| StoreError::NotFound {
            kind: R::KIND,
            key: self.key(name),
        })
    }

    pub async fn create(&self, mut obj: R) -> Result<R, StoreError> {
        obj.meta_mut().namespace = self.namespace.clone();
        Self::typed(self.client.create(obj.into_object()).await?)
    }

    pub async fn update(&self, mut obj: R) -> Result<R, StoreError> {
        obj.meta_mut().namespace = self.namespace.clone();
        Self::typed(self.client.update(obj.into_object()).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.client.delete(R::KIND, &self.key(name)).await
    }

    /// List within this handle's namespace
    pub async fn list(&self, selector: &Selector) -> Result<Vec<R>, StoreError> {
        let mut selector = selector.clone();
        selector.namespace = Some(self.namespace.clone());
        self.client
            .list(R::KIND, &selector)
            .await?
            .into_iter()
            .map(Self::typed)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_matches() {
        let mut meta = ObjectMeta::new("default", "web");
        meta.labels.insert("app".to_string(), "web".to_string());

        assert!(Selector::all().matches(&meta));
        assert!(Selector::namespace("default").matches(&meta));
        assert!(!Selector::namespace("other").matches(&meta));
        assert!(Selector::named(&ObjectKey::new("default", "web")).matches(&meta));
        assert!(!Selector::named(&ObjectKey::new("default", "api")).matches(&meta));
        assert!(Selector::all().with_label("app", "web").matches(&meta));
        assert!(!Selector::all().with_label("app", "api").matches(&meta));
    }
}
