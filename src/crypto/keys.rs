//! Ed25519 identities for v3 Onion Services
//!
//! An identity is an Ed25519 keypair plus everything derived from it: the
//! `.onion` address and the two key files the Tor daemon reads from its
//! hidden service directory.

use super::CryptoError;
use crate::util::rand::try_random_bytes;
use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest as Sha2Digest, Sha512};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;

/// Onion address version byte
const ONION_VERSION: u8 = 0x03;

/// Magic prefix of `hs_ed25519_secret_key` (padded to 32 bytes)
pub const SECRET_KEY_HEADER: &[u8; 32] = b"== ed25519v1-secret: type0 ==\x00\x00\x00";

/// Magic prefix of `hs_ed25519_public_key` (padded to 32 bytes)
pub const PUBLIC_KEY_HEADER: &[u8; 32] = b"== ed25519v1-public: type0 ==\x00\x00\x00";

/// Secret data keys of an identity secret
pub mod secret_keys {
    pub const ONION_ADDRESS: &str = "onionAddress";
    /// Address plus newline, the file the daemon reads
    pub const HOSTNAME: &str = "hostname";
    pub const PUBLIC_KEY: &str = "publicKey";
    pub const PRIVATE_KEY: &str = "privateKey";
    pub const PUBLIC_KEY_FILE: &str = "publicKeyFile";
    pub const PRIVATE_KEY_FILE: &str = "privateKeyFile";
}

/// Onion service identity
#[derive(Clone)]
pub struct OnionIdentity {
    signing_key: SigningKey,
}

impl std::fmt::Debug for OnionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionIdentity")
            .field("address", &self.onion_address())
            .finish_non_exhaustive()
    }
}

impl OnionIdentity {
    /// Generate a fresh identity from the OS random source
    pub fn generate() -> Result<Self, CryptoError> {
        let seed = try_random_bytes::<32>().map_err(|e| CryptoError::Rng(e.to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Create from raw seed bytes (32 bytes)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    /// Seed followed by public key, the usual 64-byte Ed25519 private key
    pub fn keypair_bytes(&self) -> [u8; 64] {
        self.signing_key.to_keypair_bytes()
    }

    /// Expanded secret key as Tor stores it: clamped scalar then PRF half
    pub fn expanded_secret_key(&self) -> [u8; 64] {
        let digest = Sha512::digest(self.signing_key.to_bytes());
        let mut expanded = [0u8; 64];
        expanded.copy_from_slice(&digest);
        expanded[0] &= 248;
        expanded[31] &= 63;
        expanded[31] |= 64;
        expanded
    }

    /// Derive the v3 onion address from public key
    pub fn onion_address(&self) -> String {
        onion_address_from_public_key(&self.public_key_bytes())
    }

    /// Contents of `hs_ed25519_secret_key`
    pub fn private_key_file(&self) -> Vec<u8> {
        let mut file = Vec::with_capacity(96);
        file.extend_from_slice(SECRET_KEY_HEADER);
        file.extend_from_slice(&self.expanded_secret_key());
        file
    }

    /// Contents of `hs_ed25519_public_key`
    pub fn public_key_file(&self) -> Vec<u8> {
        let mut file = Vec::with_capacity(64);
        file.extend_from_slice(PUBLIC_KEY_HEADER);
        file.extend_from_slice(&self.public_key_bytes());
        file
    }

    /// Data of the identity secret
    pub fn secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        let mut data = BTreeMap::new();
        data.insert(
            secret_keys::ONION_ADDRESS.to_string(),
            self.onion_address().into_bytes(),
        );
        data.insert(
            secret_keys::HOSTNAME.to_string(),
            format!("{}\n", self.onion_address()).into_bytes(),
        );
        data.insert(
            secret_keys::PUBLIC_KEY.to_string(),
            self.public_key_bytes().to_vec(),
        );
        data.insert(
            secret_keys::PRIVATE_KEY.to_string(),
            self.keypair_bytes().to_vec(),
        );
        data.insert(
            secret_keys::PUBLIC_KEY_FILE.to_string(),
            self.public_key_file(),
        );
        data.insert(
            secret_keys::PRIVATE_KEY_FILE.to_string(),
            self.private_key_file(),
        );
        data
    }
}

/// v3 address = base32(pubkey || checksum || version) + ".onion"
pub fn onion_address_from_public_key(pubkey: &[u8; 32]) -> String {
    let checksum = onion_checksum(pubkey);

    let mut addr_bytes = [0u8; 35];
    addr_bytes[..32].copy_from_slice(pubkey);
    addr_bytes[32..34].copy_from_slice(&checksum);
    addr_bytes[34] = ONION_VERSION;

    format!("{}.onion", BASE32_NOPAD.encode(&addr_bytes).to_lowercase())
}

/// H(".onion checksum" || pubkey || version)[:2]
fn onion_checksum(pubkey: &[u8]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

/// Extract the ed25519 public key from a v3 onion address
pub fn pubkey_from_onion_address(onion_addr: &str) -> Result<VerifyingKey, CryptoError> {
    let addr = onion_addr
        .trim()
        .to_lowercase()
        .trim_end_matches(".onion")
        .to_uppercase();

    // v3 addresses are 56 base32 characters
    if addr.len() != 56 {
        return Err(CryptoError::InvalidAddress(format!(
            "length {} (expected 56)",
            addr.len()
        )));
    }

    let decoded = BASE32_NOPAD
        .decode(addr.as_bytes())
        .map_err(|e| CryptoError::InvalidAddress(format!("base32: {}", e)))?;
    if decoded.len() != 35 {
        return Err(CryptoError::InvalidAddress(format!(
            "decoded to {} bytes",
            decoded.len()
        )));
    }

    let pubkey = &decoded[..32];
    if decoded[34] != ONION_VERSION {
        return Err(CryptoError::InvalidAddress(format!(
            "version {} (expected 3)",
            decoded[34]
        )));
    }
    if onion_checksum(pubkey) != decoded[32..34] {
        return Err(CryptoError::InvalidAddress("checksum mismatch".to_string()));
    }

    let mut key_array = [0u8; 32];
    key_array.copy_from_slice(pubkey);
    VerifyingKey::from_bytes(&key_array)
        .map_err(|e| CryptoError::InvalidAddress(format!("not an ed25519 point: {}", e)))
}

/// Public key carried by an `hs_ed25519_public_key` file
pub fn public_key_from_file(file: &[u8]) -> Result<[u8; 32], CryptoError> {
    if file.len() != 64 || &file[..32] != PUBLIC_KEY_HEADER {
        return Err(CryptoError::InvalidKeyFile(format!(
            "expected 64 bytes with ed25519v1-public header, got {} bytes",
            file.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&file[32..]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_shape() {
        let identity = OnionIdentity::from_seed(&[0u8; 32]);
        let addr = identity.onion_address();
        assert!(addr.ends_with(".onion"));
        assert_eq!(addr.len(), 56 + 6); // 56 chars + ".onion"
        assert!(addr
            .trim_end_matches(".onion")
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
        // The version byte 0x03 always encodes to a trailing 'd'
        assert!(addr.trim_end_matches(".onion").ends_with('d'));
    }

    #[test]
    fn test_same_key_same_outputs() {
        let a = OnionIdentity::from_seed(&[42u8; 32]);
        let b = OnionIdentity::from_seed(&[42u8; 32]);
        assert_eq!(a.onion_address(), b.onion_address());
        assert_eq!(a.private_key_file(), b.private_key_file());
        assert_eq!(a.public_key_file(), b.public_key_file());
        assert_eq!(a.secret_data(), b.secret_data());
    }

    #[test]
    fn test_different_keys_differ() {
        let a = OnionIdentity::generate().unwrap();
        let b = OnionIdentity::generate().unwrap();
        assert_ne!(a.onion_address(), b.onion_address());
    }

    #[test]
    fn test_key_file_layout() {
        let identity = OnionIdentity::from_seed(&[7u8; 32]);

        let secret = identity.private_key_file();
        assert_eq!(secret.len(), 96);
        assert!(secret.starts_with(b"== ed25519v1-secret: type0 =="));
        assert_eq!(&secret[29..32], &[0, 0, 0]);
        assert_eq!(secret[32] & 7, 0, "scalar is clamped");

        let public = identity.public_key_file();
        assert_eq!(public.len(), 64);
        assert!(public.starts_with(b"== ed25519v1-public: type0 =="));
        assert_eq!(public_key_from_file(&public).unwrap(), identity.public_key_bytes());
        assert!(public_key_from_file(&secret).is_err());
    }

    #[test]
    fn test_pubkey_roundtrip() {
        let identity = OnionIdentity::from_seed(&[42u8; 32]);
        let extracted = pubkey_from_onion_address(&identity.onion_address()).unwrap();
        assert_eq!(extracted.to_bytes(), identity.public_key_bytes());
    }

    #[test]
    fn test_real_onion_address() {
        let dread_addr = "dreadytofatroptsdj6io7l3xptbet6onoyno2yv7jicoxknyazubrad.onion";
        assert!(pubkey_from_onion_address(dread_addr).is_ok());
    }

    #[test]
    fn test_rejects_corrupted_address() {
        let mut addr = OnionIdentity::from_seed(&[1u8; 32]).onion_address();
        // Flip one character of the key part
        let replacement = if addr.starts_with('a') { "b" } else { "a" };
        addr.replace_range(0..1, replacement);
        assert!(matches!(
            pubkey_from_onion_address(&addr),
            Err(CryptoError::InvalidAddress(_))
        ));
        assert!(pubkey_from_onion_address("short.onion").is_err());
    }
}
