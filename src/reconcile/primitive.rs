//! Reconcile Primitive: ensure an owned child
//!
//! Written once and instantiated per child kind through the [`Child`] trait:
//! fetch, build the desired object, compare, then create or update. Objects
//! without this parent's controller reference are never adopted or
//! overwritten.

use super::ReconcileError;
use crate::api::{OwnerReference, Resource};
use crate::store::{Api, StoreError};
use tracing::{debug, info, warn};

/// A kind the reconcilers keep converged
pub trait Child: Resource {
    /// Equality over the fields this operator manages. Server-assigned
    /// fields (uid, resource version, timestamps, cluster IPs, status) are
    /// ignored.
    fn semantically_equal(&self, other: &Self) -> bool;

    /// Copy server-assigned state from `current` before an update
    fn carry_over(&mut self, current: &Self) {
        self.meta_mut().carry_server_fields(current.meta());
    }
}

/// What [`ensure_owned`] did
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    Created(R),
    Updated(R),
    Unchanged(R),
    /// Exists without our controller reference; left untouched
    Foreign(R),
}

impl<R> Outcome<R> {
    pub fn object(&self) -> &R {
        match self {
            Outcome::Created(r) | Outcome::Updated(r) | Outcome::Unchanged(r) | Outcome::Foreign(r) => r,
        }
    }

    pub fn into_inner(self) -> R {
        match self {
            Outcome::Created(r) | Outcome::Updated(r) | Outcome::Unchanged(r) | Outcome::Foreign(r) => r,
        }
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self, Outcome::Foreign(_))
    }
}

/// Converge the child `name` toward what `build` returns
///
/// `build` receives the current object when one exists and is owned, so
/// builders can keep material that must never be regenerated. Issues at
/// most one create or update; errors propagate without retry.
pub async fn ensure_owned<R, F>(
    api: &Api<R>,
    owner: &OwnerReference,
    name: &str,
    build: F,
) -> Result<Outcome<R>, ReconcileError>
where
    R: Child,
    F: FnOnce(Option<&R>) -> Result<R, ReconcileError> + Send,
{
    let existing = api.get_opt(name).await?;

    match existing {
        None => {
            let want = stamp(build(None)?, owner, name, api.namespace());
            let created = api.create(want).await?;
            info!("Created {} {}", R::KIND, created.key());
            Ok(Outcome::Created(created))
        },
        Some(current) if !current.meta().is_controlled_by(owner) => {
            warn!(
                "{} {} already exists and is not controlled by {} {}, skipping",
                R::KIND,
                current.key(),
                owner.kind,
                owner.name
            );
            Ok(Outcome::Foreign(current))
        },
        Some(current) => {
            let mut want = stamp(build(Some(&current))?, owner, name, api.namespace());
            if want.semantically_equal(&current) {
                debug!("{} {} is up to date", R::KIND, current.key());
                return Ok(Outcome::Unchanged(current));
            }
            want.carry_over(&current);
            let updated = api.update(want).await?;
            info!("Updated {} {}", R::KIND, updated.key());
            Ok(Outcome::Updated(updated))
        },
    }
}

fn stamp<R: Resource>(mut want: R, owner: &OwnerReference, name: &str, namespace: &str) -> R {
    let meta = want.meta_mut();
    meta.name = name.to_string();
    meta.namespace = namespace.to_string();
    meta.owner = Some(owner.clone());
    want
}

/// Delete the child `name` if, and only if, `owner` controls it
///
/// Returns whether something was deleted.
pub async fn delete_owned<R: Resource>(
    api: &Api<R>,
    owner: &OwnerReference,
    name: &str,
) -> Result<bool, ReconcileError> {
    let Some(current) = api.get_opt(name).await? else {
        return Ok(false);
    };
    if !current.meta().is_controlled_by(owner) {
        warn!(
            "{} {} is not controlled by {} {}, not deleting",
            R::KIND,
            current.key(),
            owner.kind,
            owner.name
        );
        return Ok(false);
    }
    match api.delete(name).await {
        Ok(()) => {
            info!("Deleted {} {}", R::KIND, current.key());
            Ok(true)
        },
        Err(StoreError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
