//! Shared test helpers

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tor_operator::api::{HiddenService, HiddenServiceSpec, Kind, Object, ObjectKey, PortRule};
use tor_operator::config::Config;
use tor_operator::reconcile::Context;
use tor_operator::store::{ClusterApi, MemoryStore, Selector, StoreError, Watcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    List,
}

/// [`MemoryStore`] that counts calls and fails on demand
#[derive(Default)]
pub struct CountingApi {
    inner: MemoryStore,
    calls: Mutex<HashMap<(Op, Kind), usize>>,
    failing: Mutex<HashSet<(Op, Kind)>>,
}

impl CountingApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self, op: Op, kind: Kind) -> usize {
        self.calls.lock().get(&(op, kind)).copied().unwrap_or(0)
    }

    /// Creates, updates and deletes across every kind
    pub fn writes(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|((op, _), _)| matches!(op, Op::Create | Op::Update | Op::Delete))
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    /// Every later `op` on `kind` fails with a backend error
    pub fn fail(&self, op: Op, kind: Kind) {
        self.failing.lock().insert((op, kind));
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn count(&self, kind: Kind) -> usize {
        self.inner.count(kind)
    }

    fn enter(&self, op: Op, kind: Kind) -> Result<(), StoreError> {
        *self.calls.lock().entry((op, kind)).or_insert(0) += 1;
        if self.failing.lock().contains(&(op, kind)) {
            return Err(StoreError::Backend(format!("injected {:?} failure on {}", op, kind)));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for CountingApi {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<Option<Object>, StoreError> {
        self.enter(Op::Get, kind)?;
        self.inner.get(kind, key).await
    }

    async fn create(&self, obj: Object) -> Result<Object, StoreError> {
        self.enter(Op::Create, obj.kind())?;
        self.inner.create(obj).await
    }

    async fn update(&self, obj: Object) -> Result<Object, StoreError> {
        self.enter(Op::Update, obj.kind())?;
        self.inner.update(obj).await
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey) -> Result<(), StoreError> {
        self.enter(Op::Delete, kind)?;
        self.inner.delete(kind, key).await
    }

    async fn list(&self, kind: Kind, selector: &Selector) -> Result<Vec<Object>, StoreError> {
        self.enter(Op::List, kind)?;
        self.inner.list(kind, selector).await
    }

    fn watch(&self, kind: Kind, selector: Selector) -> Watcher {
        self.inner.watch(kind, selector)
    }
}

pub fn context(api: &Arc<CountingApi>) -> Context {
    let client: Arc<dyn ClusterApi> = api.clone();
    Context::new(client, Arc::new(Config::default()))
}

pub fn web_service(namespace: &str, name: &str) -> HiddenService {
    HiddenService::new(
        namespace,
        name,
        HiddenServiceSpec {
            rules: vec![PortRule {
                name: Some("http".to_string()),
                public_port: 80,
                backend_address: "web-backend".to_string(),
                backend_port: 8080,
            }],
            ..Default::default()
        },
    )
}
