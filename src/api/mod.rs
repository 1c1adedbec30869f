//! Resource model
//!
//! Declarative resources (HiddenService, BalancedFleet) and the child object
//! kinds the reconcilers keep converged. Every object carries an
//! [`ObjectMeta`] with an explicit controller [`OwnerReference`].

pub mod balanced;
pub mod objects;
pub mod onion;

pub use balanced::{BalancedFleet, BalancedFleetSpec, BalancedFleetStatus};
pub use objects::{
    Container, ContainerPort, Deployment, DeploymentSpec, Event, KeyToPath, ObjectReference,
    PodSpec, PolicyRule, Role, RoleBinding, Secret, Service, ServiceAccount, ServiceMonitor,
    ServiceMonitorSpec, ServicePort, ServiceSpec, Subject, Volume, VolumeMount, VolumeSource,
    ConfigMap, MonitorEndpoint,
};
pub use onion::{HiddenService, HiddenServiceSpec, HiddenServiceStatus, PortRule, SecretRef, WorkloadTemplate};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Object kinds known to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    HiddenService,
    BalancedFleet,
    Secret,
    ConfigMap,
    Service,
    Deployment,
    Role,
    RoleBinding,
    ServiceAccount,
    ServiceMonitor,
    Event,
}

impl Kind {
    pub const ALL: [Kind; 11] = [
        Kind::HiddenService,
        Kind::BalancedFleet,
        Kind::Secret,
        Kind::ConfigMap,
        Kind::Service,
        Kind::Deployment,
        Kind::Role,
        Kind::RoleBinding,
        Kind::ServiceAccount,
        Kind::ServiceMonitor,
        Kind::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::HiddenService => "HiddenService",
            Kind::BalancedFleet => "BalancedFleet",
            Kind::Secret => "Secret",
            Kind::ConfigMap => "ConfigMap",
            Kind::Service => "Service",
            Kind::Deployment => "Deployment",
            Kind::Role => "Role",
            Kind::RoleBinding => "RoleBinding",
            Kind::ServiceAccount => "ServiceAccount",
            Kind::ServiceMonitor => "ServiceMonitor",
            Kind::Event => "Event",
        }
    }

    /// Lower-case plural, used as a directory name by the file store
    pub fn plural(&self) -> &'static str {
        match self {
            Kind::HiddenService => "hiddenservices",
            Kind::BalancedFleet => "balancedfleets",
            Kind::Secret => "secrets",
            Kind::ConfigMap => "configmaps",
            Kind::Service => "services",
            Kind::Deployment => "deployments",
            Kind::Role => "roles",
            Kind::RoleBinding => "rolebindings",
            Kind::ServiceAccount => "serviceaccounts",
            Kind::ServiceMonitor => "servicemonitors",
            Kind::Event => "events",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace + name of one object; the unit of work-queue deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string
    pub fn parse(s: &str) -> Option<Self> {
        let (namespace, name) = s.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Back-reference from a child to the parent allowed to mutate it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: Kind,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Controller reference pointing at `owner`
    pub fn controller_of<R: Resource>(owner: &R) -> Self {
        let meta = owner.meta();
        Self {
            kind: R::KIND,
            name: meta.name.clone(),
            uid: meta.uid.clone(),
            controller: true,
        }
    }
}

/// Metadata shared by every stored object
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,
    /// Assigned by the store on create
    #[serde(default)]
    pub uid: String,
    /// Bumped by the store on every write; zero skips the conflict check
    #[serde(default)]
    pub resource_version: u64,
    /// Unix timestamp assigned by the store on create
    #[serde(default)]
    pub created_at: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Parent recorded on this object, if it has a controller reference
    pub fn owner_of(&self) -> Option<(Kind, ObjectKey)> {
        self.owner
            .as_ref()
            .filter(|o| o.controller)
            .map(|o| (o.kind, ObjectKey::new(&self.namespace, &o.name)))
    }

    /// True if `owner` is the recorded controller of this object
    pub fn is_controlled_by(&self, owner: &OwnerReference) -> bool {
        match &self.owner {
            Some(current) => {
                current.controller
                    && current.kind == owner.kind
                    && current.name == owner.name
                    && current.uid == owner.uid
            },
            None => false,
        }
    }

    /// Copy the store-assigned fields from `current`
    pub fn carry_server_fields(&mut self, current: &ObjectMeta) {
        self.uid = current.uid.clone();
        self.resource_version = current.resource_version;
        self.created_at = current.created_at;
    }

    /// Check the namespace and name can address an object
    pub fn check_key(&self) -> Result<(), String> {
        check_namespace(&self.namespace)?;
        check_name(&self.name)
    }
}

/// A resource spec failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} {key}: {reason}")]
pub struct InvalidSpec {
    pub kind: Kind,
    pub key: ObjectKey,
    pub reason: String,
}

/// Longest namespace, a single DNS label
pub const MAX_NAMESPACE_LEN: usize = 63;
/// Longest object name, a DNS subdomain
pub const MAX_NAME_LEN: usize = 253;

fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= MAX_NAMESPACE_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        },
        _ => false,
    }
}

/// Check a namespace is a DNS label
pub fn check_namespace(namespace: &str) -> Result<(), String> {
    if is_dns_label(namespace) {
        Ok(())
    } else {
        Err(format!(
            "namespace {:?} must be a lowercase DNS label of at most {} characters",
            namespace, MAX_NAMESPACE_LEN
        ))
    }
}

/// Check an object name is a DNS subdomain: dot-separated DNS labels
pub fn check_name(name: &str) -> Result<(), String> {
    if name.len() <= MAX_NAME_LEN && name.split('.').all(is_dns_label) {
        Ok(())
    } else {
        Err(format!(
            "name {:?} must be a lowercase DNS subdomain of at most {} characters",
            name, MAX_NAME_LEN
        ))
    }
}

/// Typed view over one [`Object`] variant
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn into_object(self) -> Object;
    fn from_object(obj: Object) -> Option<Self>;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> &str {
        &self.meta().namespace
    }
}

macro_rules! resources {
    ($($ty:ident),* $(,)?) => {
        /// Any stored object, tagged by kind
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "kind")]
        pub enum Object {
            $($ty($ty),)*
        }

        impl Object {
            pub fn kind(&self) -> Kind {
                match self {
                    $(Object::$ty(_) => Kind::$ty,)*
                }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(Object::$ty(o) => &o.metadata,)*
                }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Object::$ty(o) => &mut o.metadata,)*
                }
            }

            pub fn key(&self) -> ObjectKey {
                self.meta().key()
            }
        }

        $(
            impl Resource for $ty {
                const KIND: Kind = Kind::$ty;

                fn meta(&self) -> &ObjectMeta {
                    &self.metadata
                }

                fn meta_mut(&mut self) -> &mut ObjectMeta {
                    &mut self.metadata
                }

                fn into_object(self) -> Object {
                    Object::$ty(self)
                }

                fn from_object(obj: Object) -> Option<Self> {
                    match obj {
                        Object::$ty(o) => Some(o),
                        _ => None,
                    }
                }
            }
        )*
    };
}

resources!(
    HiddenService,
    BalancedFleet,
    Secret,
    ConfigMap,
    Service,
    Deployment,
    Role,
    RoleBinding,
    ServiceAccount,
    ServiceMonitor,
    Event,
);
