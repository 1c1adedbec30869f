//! Secret children: identity, authorized clients, control password

use super::primitive::{delete_owned, ensure_owned, Child};
use super::{Context, ReconcileError};
use crate::api::{ObjectMeta, OwnerReference, Secret, SecretRef};
use crate::crypto::keys::secret_keys;
use crate::crypto::{
    hash_control_password, onion_address_from_public_key, public_key_from_file, OnionIdentity,
};
use crate::util::rand::random_password;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Key of the plaintext control password
pub const CONTROL_KEY: &str = "control";
/// Key of its S2K hash, rendered into the torrc by the agent
pub const HASHED_CONTROL_KEY: &str = "hashedControl";
/// Authorized client key looked up when the reference names none
pub const AUTH_KEY: &str = "authKey";

const CONTROL_PASSWORD_LEN: usize = 16;

impl Child for Secret {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.secret_type == other.secret_type
            && self.data == other.data
            && self.metadata.labels == other.metadata.labels
    }
}

/// Identity secret for a fresh identity
pub fn identity_secret(
    identity: &OnionIdentity,
    meta: ObjectMeta,
    secret_type: &str,
) -> Secret {
    let mut secret = Secret::new(meta, secret_type);
    secret.data = identity.secret_data();
    secret
}

/// Onion address recorded in an identity secret
///
/// Falls back to a `hostname` entry, then to the public key file, so
/// user-supplied secrets work too.
pub fn hostname_from_secret(secret: &Secret) -> Option<String> {
    if let Some(addr) = secret.string(secret_keys::ONION_ADDRESS).filter(|a| !a.is_empty()) {
        return Some(addr);
    }
    if let Some(addr) = secret.string(secret_keys::HOSTNAME).filter(|a| !a.is_empty()) {
        return Some(addr);
    }
    secret
        .data
        .get(secret_keys::PUBLIC_KEY_FILE)
        .and_then(|file| public_key_from_file(file).ok())
        .map(|key| onion_address_from_public_key(&key))
}

/// Ensure the identity secret `name` and return the address it holds
///
/// An identity is generated only when no secret exists; an existing one is
/// never rotated. A foreign (user-supplied) secret is read but not written.
pub async fn ensure_identity_secret(
    ctx: &Context,
    owner: &OwnerReference,
    namespace: &str,
    name: &str,
    version: u8,
) -> Result<Option<String>, ReconcileError> {
    let api = ctx.api::<Secret>(namespace);
    let secret_type = ctx.config.identity_secret_type();

    let outcome = ensure_owned(&api, owner, name, |current| match current {
        Some(current) => Ok(current.clone()),
        None => {
            if version == 2 {
                return Err(ReconcileError::precondition(format!(
                    "version 2 private key secret {}/{} does not exist",
                    namespace, name
                )));
            }
            let identity = OnionIdentity::generate()?;
            info!(
                "Generated onion identity {} for {} {}",
                identity.onion_address(),
                owner.kind,
                owner.name
            );
            Ok(identity_secret(
                &identity,
                ObjectMeta::new(namespace, name),
                &secret_type,
            ))
        },
    })
    .await?;

    Ok(hostname_from_secret(outcome.object()))
}

/// One `client-{idx}.auth` entry per resolvable reference
async fn collect_authorized_clients(
    ctx: &Context,
    namespace: &str,
    refs: &[SecretRef],
) -> Result<BTreeMap<String, Vec<u8>>, ReconcileError> {
    let api = ctx.api::<Secret>(namespace);
    let mut data = BTreeMap::new();

    for (idx, reference) in refs.iter().enumerate() {
        let Some(source) = api.get_opt(&reference.name).await? else {
            info!(
                "Authorized client secret {}/{} not found, skipping",
                namespace, reference.name
            );
            continue;
        };

        let value = match &reference.key {
            Some(key) => source.data.get(key).cloned(),
            None => source.data.get(AUTH_KEY).cloned().or_else(|| {
                source
                    .string(secret_keys::PUBLIC_KEY)
                    .map(|pk| format!("descriptor:x25519:{}", pk).into_bytes())
            }),
        };

        match value {
            Some(value) => {
                data.insert(format!("client-{}.auth", idx), value);
            },
            None => warn!(
                "Authorized client secret {}/{} has no usable key, skipping",
                namespace, reference.name
            ),
        }
    }

    Ok(data)
}

/// Ensure (or remove) the authorized-clients secret
pub async fn ensure_authorized_clients(
    ctx: &Context,
    owner: &OwnerReference,
    namespace: &str,
    name: &str,
    refs: &[SecretRef],
) -> Result<(), ReconcileError> {
    let api = ctx.api::<Secret>(namespace);
    if refs.is_empty() {
        delete_owned(&api, owner, name).await?;
        return Ok(());
    }

    let data = collect_authorized_clients(ctx, namespace, refs).await?;
    let secret_type = ctx.config.authorized_clients_secret_type();
    ensure_owned(&api, owner, name, |_| {
        let mut secret = Secret::new(ObjectMeta::new(namespace, name), &secret_type);
        secret.data = data;
        Ok(secret)
    })
    .await?;
    Ok(())
}

/// Ensure the control password secret, generated once and kept stable
pub async fn ensure_control_secret(
    ctx: &Context,
    owner: &OwnerReference,
    namespace: &str,
    name: &str,
) -> Result<Secret, ReconcileError> {
    let api = ctx.api::<Secret>(namespace);
    let secret_type = ctx.config.control_secret_type();

    let outcome = ensure_owned(&api, owner, name, |current| {
        let complete = current.filter(|c| {
            c.secret_type == secret_type
                && c.data.contains_key(CONTROL_KEY)
                && c.data.contains_key(HASHED_CONTROL_KEY)
        });
        if let Some(current) = complete {
            return Ok(current.clone());
        }

        let password = random_password(CONTROL_PASSWORD_LEN);
        let hashed = hash_control_password(&password)?;
        let mut secret = Secret::new(ObjectMeta::new(namespace, name), &secret_type);
        secret
            .data
            .insert(CONTROL_KEY.to_string(), password.into_bytes());
        secret
            .data
            .insert(HASHED_CONTROL_KEY.to_string(), hashed.into_bytes());
        Ok(secret)
    })
    .await?;

    Ok(outcome.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HiddenService, HiddenServiceSpec};
    use crate::config::Config;
    use crate::store::{ClusterApi, MemoryStore};
    use std::sync::Arc;

    async fn setup() -> (Context, OwnerReference) {
        let client: Arc<dyn ClusterApi> = Arc::new(MemoryStore::new());
        let ctx = Context::new(client, Arc::new(Config::default()));
        let parent = ctx
            .api::<HiddenService>("default")
            .create(HiddenService::new("default", "web", HiddenServiceSpec::default()))
            .await
            .unwrap();
        (ctx, OwnerReference::controller_of(&parent))
    }

    #[tokio::test]
    async fn test_identity_is_generated_once() {
        let (ctx, owner) = setup().await;
        let first = ensure_identity_secret(&ctx, &owner, "default", "web-tor-secret", 3)
            .await
            .unwrap()
            .unwrap();
        assert!(first.ends_with(".onion"));

        let again = ensure_identity_secret(&ctx, &owner, "default", "web-tor-secret", 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, again);

        let secret = ctx
            .api::<Secret>("default")
            .get("web-tor-secret")
            .await
            .unwrap();
        assert_eq!(secret.secret_type, "tor.k8s.torproject.org/onion-v3");
        for key in ["onionAddress", "publicKey", "privateKey", "publicKeyFile", "privateKeyFile"] {
            assert!(secret.data.contains_key(key), "missing {}", key);
        }
    }

    #[tokio::test]
    async fn test_foreign_identity_is_read_not_written() {
        let (ctx, owner) = setup().await;
        let identity = OnionIdentity::from_seed(&[9u8; 32]);
        let mut supplied = Secret::new(ObjectMeta::new("default", "my-keys"), "Opaque");
        supplied.data.insert(
            secret_keys::PUBLIC_KEY_FILE.to_string(),
            identity.public_key_file(),
        );
        ctx.api::<Secret>("default").create(supplied).await.unwrap();

        let hostname = ensure_identity_secret(&ctx, &owner, "default", "my-keys", 3)
            .await
            .unwrap();
        assert_eq!(hostname, Some(identity.onion_address()));
        let stored = ctx.api::<Secret>("default").get("my-keys").await.unwrap();
        assert_eq!(stored.secret_type, "Opaque");
    }

    #[tokio::test]
    async fn test_v2_identity_is_never_generated() {
        let (ctx, owner) = setup().await;
        let err = ensure_identity_secret(&ctx, &owner, "default", "legacy", 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_authorized_clients() {
        let (ctx, owner) = setup().await;
        let secrets = ctx.api::<Secret>("default");

        let mut alice = Secret::new(ObjectMeta::new("default", "alice"), "Opaque");
        alice
            .data
            .insert("authKey".to_string(), b"descriptor:x25519:AAAA".to_vec());
        secrets.create(alice).await.unwrap();

        let mut bob = Secret::new(ObjectMeta::new("default", "bob"), "Opaque");
        bob.data.insert("publicKey".to_string(), b"BBBB".to_vec());
        secrets.create(bob).await.unwrap();

        let refs = vec![
            SecretRef {
                name: "alice".to_string(),
                key: None,
            },
            SecretRef {
                name: "missing".to_string(),
                key: None,
            },
            SecretRef {
                name: "bob".to_string(),
                key: None,
            },
        ];
        ensure_authorized_clients(&ctx, &owner, "default", "web-tor-authorized-clients", &refs)
            .await
            .unwrap();

        let secret = secrets.get("web-tor-authorized-clients").await.unwrap();
        assert_eq!(
            secret.secret_type,
            "tor.k8s.torproject.org/authorized-clients-v3"
        );
        assert_eq!(secret.data.len(), 2);
        assert_eq!(secret.data["client-0.auth"], b"descriptor:x25519:AAAA".to_vec());
        assert_eq!(secret.data["client-2.auth"], b"descriptor:x25519:BBBB".to_vec());

        ensure_authorized_clients(&ctx, &owner, "default", "web-tor-authorized-clients", &[])
            .await
            .unwrap();
        assert!(secrets
            .get_opt("web-tor-authorized-clients")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_control_secret_is_stable() {
        let (ctx, owner) = setup().await;
        let first = ensure_control_secret(&ctx, &owner, "default", "web-tor-control")
            .await
            .unwrap();
        let password = first.string(CONTROL_KEY).unwrap();
        assert_eq!(password.len(), 16);
        assert!(first.string(HASHED_CONTROL_KEY).unwrap().starts_with("16:"));

        let second = ensure_control_secret(&ctx, &owner, "default", "web-tor-control")
            .await
            .unwrap();
        assert_eq!(second.data, first.data);
        assert_eq!(second.metadata.resource_version, first.metadata.resource_version);
    }
}
