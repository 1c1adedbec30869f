//! In-process object store
//!
//! Holds every object in one map behind a mutex and fans changes out over a
//! broadcast channel. Used by the `operator` command when no store root is
//! configured, and by the test suite.

use super::{ClusterApi, Selector, StoreError, WatchEvent, Watcher};
use crate::api::{Kind, Object, ObjectKey};
use crate::util::time::unix_timestamp;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    objects: BTreeMap<(Kind, ObjectKey), Object>,
    last_version: u64,
    next_ip: u32,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn next_cluster_ip(&mut self) -> String {
        self.next_ip += 1;
        let n = self.next_ip;
        format!("10.96.{}.{}", (n >> 8) & 0xff, n & 0xff)
    }
}

/// Object store living in this process
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: Kind) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for MemoryStore {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<Option<Object>, StoreError> {
        Ok(self.state.lock().objects.get(&(kind, key.clone())).cloned())
    }

    async fn create(&self, mut obj: Object) -> Result<Object, StoreError> {
        let kind = obj.kind();
        let key = obj.key();
        let created = {
            let mut state = self.state.lock();
            if state.objects.contains_key(&(kind, key.clone())) {
                return Err(StoreError::AlreadyExists { kind, key });
            }
            let version = state.next_version();
            let meta = obj.meta_mut();
            meta.uid = Uuid::new_v4().to_string();
            meta.resource_version = version;
            meta.created_at = unix_timestamp();
            if let Object::Service(svc) = &mut obj {
                if svc.spec.cluster_ip.is_empty() {
                    svc.spec.cluster_ip = state.next_cluster_ip();
                }
            }
            state.objects.insert((kind, key.clone()), obj.clone());
            obj
        };
        debug!("store: created {} {}", kind, key);
        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, mut obj: Object) -> Result<Object, StoreError> {
        let kind = obj.kind();
        let key = obj.key();
        let updated = {
            let mut state = self.state.lock();
            let current = match state.objects.get(&(kind, key.clone())) {
                Some(current) => current.meta().clone(),
                None => return Err(StoreError::NotFound { kind, key }),
            };
            let expected = obj.meta().resource_version;
            if expected != 0 && expected != current.resource_version {
                return Err(StoreError::Conflict {
                    kind,
                    key,
                    expected,
                });
            }
            let preserved_ip = match state.objects.get(&(kind, key.clone())) {
                Some(Object::Service(svc)) => svc.spec.cluster_ip.clone(),
                _ => String::new(),
            };
            let version = state.next_version();
            let meta = obj.meta_mut();
            meta.uid = current.uid;
            meta.created_at = current.created_at;
            meta.resource_version = version;
            if let Object::Service(svc) = &mut obj {
                if svc.spec.cluster_ip.is_empty() {
                    svc.spec.cluster_ip = preserved_ip;
                }
            }
            state.objects.insert((kind, key.clone()), obj.clone());
            obj
        };
        debug!("store: updated {} {}", kind, key);
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey) -> Result<(), StoreError> {
        let removed = {
            let mut state = self.state.lock();
            let root = match state.objects.remove(&(kind, key.clone())) {
                Some(obj) => obj,
                None => {
                    return Err(StoreError::NotFound {
                        kind,
                        key: key.clone(),
                    })
                },
            };

            // Cascade through controller references
            let mut removed = vec![root];
            let mut cursor = 0;
            while cursor < removed.len() {
                let parent = removed[cursor].meta().clone();
                let parent_kind = removed[cursor].kind();
                let children: Vec<(Kind, ObjectKey)> = state
                    .objects
                    .iter()
                    .filter(|((_, k), obj)| {
                        k.namespace == parent.namespace
                            && obj.meta().owner.as_ref().is_some_and(|o| {
                                o.kind == parent_kind && o.uid == parent.uid
                            })
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for child in children {
                    if let Some(obj) = state.objects.remove(&child) {
                        removed.push(obj);
                    }
                }
                cursor += 1;
            }
            removed
        };

        for obj in removed {
            debug!("store: deleted {} {}", obj.kind(), obj.key());
            self.publish(WatchEvent::Deleted(obj));
        }
        Ok(())
    }

    async fn list(&self, kind: Kind, selector: &Selector) -> Result<Vec<Object>, StoreError> {
        Ok(self
            .state
            .lock()
            .objects
            .iter()
            .filter(|((k, _), obj)| *k == kind && selector.matches(obj.meta()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    fn watch(&self, kind: Kind, selector: Selector) -> Watcher {
        Watcher::new(kind, selector, self.events.subscribe())
    }
}
