//! File-backed object store
//!
//! Objects live at `<root>/<kind>/<namespace>/<name>.yaml`. Writes go through
//! a temp file and a rename so readers never see a partial object, and every
//! read-check-write holds an exclusive `flock` on `<root>/.lock`. Watches
//! poll the tree and diff resource versions, which lets the operator and the
//! node agents run as separate processes over a shared directory.

use super::{ClusterApi, Selector, StoreError, WatchEvent, Watcher};
use crate::api::{Kind, Object, ObjectKey};
use crate::util::time::unix_timestamp;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;
const LOCK_FILE: &str = ".lock";

struct Inner {
    root: PathBuf,
    poll_interval: Duration,
    events: broadcast::Sender<WatchEvent>,
    poller_started: Mutex<bool>,
}

/// Object store over a shared directory
#[derive(Clone)]
pub struct FsStore {
    inner: Arc<Inner>,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!("Opened object store at {:?}", root);
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                poll_interval,
                events,
                poller_started: Mutex::new(false),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn ensure_poller(&self) {
        let mut started = self.inner.poller_started.lock();
        if *started {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&self.inner);
                let interval = self.inner.poll_interval;
                let snapshot = self.inner.scan_all();
                handle.spawn(poll_loop(weak, interval, snapshot));
                *started = true;
            },
            Err(_) => warn!("No async runtime; file store watches will not receive events"),
        }
    }
}

impl Inner {
    fn kind_dir(&self, kind: Kind) -> PathBuf {
        self.root.join(kind.plural())
    }

    fn path(&self, kind: Kind, key: &ObjectKey) -> Result<PathBuf, StoreError> {
        for part in [&key.namespace, &key.name] {
            if !is_path_component(part) {
                return Err(StoreError::InvalidKey {
                    kind,
                    key: key.clone(),
                });
            }
        }
        Ok(self
            .kind_dir(kind)
            .join(&key.namespace)
            .join(format!("{}.yaml", key.name)))
    }

    /// Exclusive lock over the whole tree, held until the guard drops
    fn lock(&self) -> Result<RootLock, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        flock_exclusive(&file)?;
        Ok(RootLock { _file: file })
    }

    fn read(&self, kind: Kind, key: &ObjectKey) -> Result<Option<Object>, StoreError> {
        read_object(&self.path(kind, key)?)
    }

    fn write(&self, obj: &Object) -> Result<(), StoreError> {
        let path = self.path(obj.kind(), &obj.key())?;
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("invalid object path {:?}", path)))?;
        std::fs::create_dir_all(dir)?;

        let yaml = serde_yaml::to_string(obj).map_err(|e| StoreError::Serde(e.to_string()))?;
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        std::fs::write(&tmp, yaml)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn scan(&self, kind: Kind, namespace: Option<&str>) -> Vec<Object> {
        let kind_dir = self.kind_dir(kind);
        let namespaces: Vec<PathBuf> = match namespace {
            Some(ns) => vec![kind_dir.join(ns)],
            None => match std::fs::read_dir(&kind_dir) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect(),
                Err(_) => Vec::new(),
            },
        };

        let mut objects = Vec::new();
        for ns_dir in namespaces {
            let entries = match std::fs::read_dir(&ns_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let is_yaml = path.extension().is_some_and(|ext| ext == "yaml");
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                if !is_yaml || hidden {
                    continue;
                }
                match read_object(&path) {
                    Ok(Some(obj)) if obj.kind() == kind => objects.push(obj),
                    Ok(_) => {},
                    Err(e) => warn!("Skipping unreadable object {:?}: {}", path, e),
                }
            }
        }
        objects.sort_by_key(|o| o.key());
        objects
    }

    fn scan_all(&self) -> HashMap<(Kind, ObjectKey), Object> {
        Kind::ALL
            .iter()
            .flat_map(|kind| self.scan(*kind, None))
            .map(|obj| ((obj.kind(), obj.key()), obj))
            .collect()
    }
}

/// Released when the file is closed
struct RootLock {
    _file: File,
}

fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        loop {
            // SAFETY: the descriptor is owned by `file` for the whole call
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

/// A namespace or name that stays inside its directory
fn is_path_component(part: &str) -> bool {
    !part.is_empty() && !part.starts_with('.') && !part.contains(['/', '\\', '\0'])
}

fn read_object(path: &Path) -> Result<Option<Object>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|e| StoreError::Serde(format!("{:?}: {}", path, e)))
}

/// Cluster IPs are derived from the uid so separate processes agree
fn cluster_ip_for(uid: &Uuid) -> String {
    let b = uid.as_bytes();
    format!("10.96.{}.{}", b[0], b[1].max(1))
}

async fn poll_loop(
    inner: Weak<Inner>,
    interval: Duration,
    mut known: HashMap<(Kind, ObjectKey), Object>,
) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            debug!("File store dropped, stopping watch poller");
            return;
        };

        let current = inner.scan_all();
        for (id, obj) in &current {
            match known.get(id) {
                None => {
                    let _ = inner.events.send(WatchEvent::Added(obj.clone()));
                },
                Some(old) if old.meta().resource_version != obj.meta().resource_version => {
                    let _ = inner.events.send(WatchEvent::Modified(obj.clone()));
                },
                Some(_) => {},
            }
        }
        for (id, obj) in &known {
            if !current.contains_key(id) {
                let _ = inner.events.send(WatchEvent::Deleted(obj.clone()));
            }
        }
        known = current;
    }
}

#[async_trait]
impl ClusterApi for FsStore {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<Option<Object>, StoreError> {
        self.inner.read(kind, key)
    }

    async fn create(&self, mut obj: Object) -> Result<Object, StoreError> {
        let kind = obj.kind();
        let key = obj.key();
        let _lock = self.inner.lock()?;
        if self.inner.read(kind, &key)?.is_some() {
            return Err(StoreError::AlreadyExists { kind, key });
        }

        let uid = Uuid::new_v4();
        let meta = obj.meta_mut();
        meta.uid = uid.to_string();
        meta.resource_version = 1;
        meta.created_at = unix_timestamp();
        if let Object::Service(svc) = &mut obj {
            if svc.spec.cluster_ip.is_empty() {
                svc.spec.cluster_ip = cluster_ip_for(&uid);
            }
        }
        self.inner.write(&obj)?;
        debug!("store: created {} {}", kind, key);
        Ok(obj)
    }

    async fn update(&self, mut obj: Object) -> Result<Object, StoreError> {
        let kind = obj.kind();
        let key = obj.key();
        let _lock = self.inner.lock()?;
        let current = match self.inner.read(kind, &key)? {
            Some(current) => current,
            None => return Err(StoreError::NotFound { kind, key }),
        };

        let expected = obj.meta().resource_version;
        let stored = current.meta().resource_version;
        if expected != 0 && expected != stored {
            return Err(StoreError::Conflict {
                kind,
                key,
                expected,
            });
        }

        let meta = obj.meta_mut();
        meta.uid = current.meta().uid.clone();
        meta.created_at = current.meta().created_at;
        meta.resource_version = stored + 1;
        if let (Object::Service(svc), Object::Service(old)) = (&mut obj, &current) {
            if svc.spec.cluster_ip.is_empty() {
                svc.spec.cluster_ip = old.spec.cluster_ip.clone();
            }
        }
        self.inner.write(&obj)?;
        debug!("store: updated {} {}", kind, key);
        Ok(obj)
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey) -> Result<(), StoreError> {
        let _lock = self.inner.lock()?;
        let root = match self.inner.read(kind, key)? {
            Some(obj) => obj,
            None => {
                return Err(StoreError::NotFound {
                    kind,
                    key: key.clone(),
                })
            },
        };

        let mut pending = vec![root];
        while let Some(obj) = pending.pop() {
            let path = self.inner.path(obj.kind(), &obj.key())?;
            match std::fs::remove_file(&path) {
                Ok(()) => {},
                Err(e) if e.kind() == ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
            debug!("store: deleted {} {}", obj.kind(), obj.key());

            let parent = obj.meta();
            for child_kind in Kind::ALL {
                for child in self.inner.scan(child_kind, Some(&parent.namespace)) {
                    let owned = child
                        .meta()
                        .owner
                        .as_ref()
                        .is_some_and(|o| o.kind == obj.kind() && o.uid == parent.uid);
                    if owned {
                        pending.push(child);
                    }
                }
            }
        }
        Ok(())
    }

    async fn list(&self, kind: Kind, selector: &Selector) -> Result<Vec<Object>, StoreError> {
        Ok(self
            .inner
            .scan(kind, selector.namespace.as_deref())
            .into_iter()
            .filter(|obj| selector.matches(obj.meta()))
            .collect())
    }

    fn watch(&self, kind: Kind, selector: Selector) -> Watcher {
        self.ensure_poller();
        Watcher::new(kind, selector, self.inner.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        HiddenService, HiddenServiceSpec, ObjectMeta, OwnerReference, Resource, Secret,
    };

    fn open(dir: &Path) -> FsStore {
        FsStore::open(dir, Duration::from_millis(20)).unwrap()
    }

    #[tokio::test]
    async fn test_objects_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let hs = HiddenService::new("default", "web", HiddenServiceSpec::default());
        let created = store.create(hs.into_object()).await.unwrap();

        assert!(dir
            .path()
            .join("hiddenservices/default/web.yaml")
            .exists());

        let reopened = open(dir.path());
        let fetched = reopened
            .get(Kind::HiddenService, &ObjectKey::new("default", "web"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_update_conflict_and_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let parent = store
            .create(HiddenService::new("default", "web", HiddenServiceSpec::default()).into_object())
            .await
            .unwrap();
        let parent = HiddenService::from_object(parent).unwrap();

        let mut child = Secret::new(ObjectMeta::new("default", "web-tor-secret"), "Opaque");
        child.metadata.owner = Some(OwnerReference::controller_of(&parent));
        let child = store.create(child.into_object()).await.unwrap();

        let bumped = store.update(child.clone()).await.unwrap();
        assert_eq!(bumped.meta().resource_version, 2);
        assert!(matches!(
            store.update(child).await,
            Err(StoreError::Conflict { .. })
        ));

        store
            .delete(Kind::HiddenService, &parent.key())
            .await
            .unwrap();
        let left = store
            .get(Kind::Secret, &ObjectKey::new("default", "web-tor-secret"))
            .await
            .unwrap();
        assert!(left.is_none());
    }

    #[test]
    fn test_writers_on_separate_handles_serialize() {
        const WRITERS: usize = 8;
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let created = rt
            .block_on(open(dir.path()).create(
                HiddenService::new("default", "web", HiddenServiceSpec::default()).into_object(),
            ))
            .unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(WRITERS));
        let writers: Vec<_> = (0..WRITERS)
            .map(|i| {
                let root = dir.path().to_path_buf();
                let barrier = barrier.clone();
                let mut hs = HiddenService::from_object(created.clone()).unwrap();
                hs.status.hostname = format!("writer{}.onion", i);
                std::thread::spawn(move || {
                    let store = open(&root);
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .build()
                        .unwrap();
                    barrier.wait();
                    rt.block_on(store.update(hs.into_object()))
                })
            })
            .collect();
        let results: Vec<_> = writers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(StoreError::Conflict { .. }))));
        let stored = rt
            .block_on(open(dir.path()).get(Kind::HiddenService, &ObjectKey::new("default", "web")))
            .unwrap()
            .unwrap();
        assert_eq!(stored.meta().resource_version, 2);
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_keys_cannot_leave_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let store = open(&root);

        let escape = Secret::new(ObjectMeta::new("default", "../../x"), "Opaque");
        assert!(matches!(
            store.create(escape.into_object()).await,
            Err(StoreError::InvalidKey { .. })
        ));
        let escape = Secret::new(ObjectMeta::new("..", "x"), "Opaque");
        assert!(matches!(
            store.create(escape.into_object()).await,
            Err(StoreError::InvalidKey { .. })
        ));
        assert!(!dir.path().join("x.yaml").exists());
        assert!(!root.join("x.yaml").exists());
    }

    #[tokio::test]
    async fn test_watch_sees_writes_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let watcher_store = open(dir.path());
        let writer_store = open(dir.path());
        let mut watcher = watcher_store.watch(Kind::HiddenService, Selector::all());

        writer_store
            .create(HiddenService::new("default", "web", HiddenServiceSpec::default()).into_object())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.next())
            .await
            .unwrap();
        assert!(matches!(event, Some(WatchEvent::Added(_))));
    }
}
