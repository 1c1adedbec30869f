//! Apply command - create or update resources from a manifest

use super::open_store;
use crate::api::{Kind, Object};
use crate::config::Config;
use crate::store::ClusterApi;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_NAMESPACE: &str = "default";

/// Parse every YAML document of a manifest into a validated resource
///
/// Only HiddenService and BalancedFleet objects may be applied; everything
/// else is created by the operator itself.
pub fn parse_manifest(text: &str) -> Result<Vec<Object>> {
    let mut objects = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("Document {} is not valid YAML", index + 1))?;
        if value.is_null() {
            continue;
        }
        let mut obj: Object = serde_yaml::from_value(value)
            .with_context(|| format!("Document {} is not a known resource", index + 1))?;

        let meta = obj.meta_mut();
        if meta.name.is_empty() {
            bail!("Document {} has no metadata.name", index + 1);
        }
        if meta.namespace.is_empty() {
            meta.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if let Err(reason) = meta.check_key() {
            bail!("Document {}: {}", index + 1, reason);
        }

        match &obj {
            Object::HiddenService(hs) => hs.validate()?,
            Object::BalancedFleet(fleet) => fleet.validate()?,
            other => bail!(
                "Document {}: {} objects are managed by the operator",
                index + 1,
                other.kind()
            ),
        }
        objects.push(obj);
    }
    Ok(objects)
}

/// Create `obj`, or replace the desired state of the stored one
async fn apply_object(client: &Arc<dyn ClusterApi>, mut obj: Object) -> Result<&'static str> {
    let kind = obj.kind();
    let key = obj.key();
    let Some(current) = client.get(kind, &key).await? else {
        client
            .create(obj)
            .await
            .with_context(|| format!("Failed to create {} {}", kind, key))?;
        return Ok("created");
    };

    obj.meta_mut().carry_server_fields(current.meta());
    obj.meta_mut().owner = current.meta().owner.clone();
    let obj = keep_status(obj, current);
    client
        .update(obj)
        .await
        .with_context(|| format!("Failed to update {} {}", kind, key))?;
    Ok("configured")
}

/// Status belongs to the reconcilers; a manifest never resets it
fn keep_status(obj: Object, current: Object) -> Object {
    match (obj, current) {
        (Object::HiddenService(mut want), Object::HiddenService(current)) => {
            want.status = current.status;
            Object::HiddenService(want)
        },
        (Object::BalancedFleet(mut want), Object::BalancedFleet(current)) => {
            want.status = current.status;
            Object::BalancedFleet(want)
        },
        (obj, _) => obj,
    }
}

/// Run the apply command
pub async fn run_apply(config: &Config, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read manifest: {:?}", file))?;
    let objects = parse_manifest(&text)?;
    if objects.is_empty() {
        bail!("{:?} contains no resources", file);
    }
    if config.store.root.is_none() {
        bail!("apply needs a shared store; set [store] root in the configuration");
    }

    let client = open_store(config)?;
    for obj in objects {
        let kind: Kind = obj.kind();
        let key = obj.key();
        let verb = apply_object(&client, obj).await?;
        println!("{} {} {}", kind, key, verb);
    }
    Ok(())
}
