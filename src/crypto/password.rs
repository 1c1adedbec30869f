//! Control port password hashing
//!
//! Tor's `HashedControlPassword` uses the OpenPGP iterated and salted S2K
//! (RFC 2440, section 3.6.1.3) over SHA-1, encoded as
//! `16:<salt><count byte><digest>` in upper-case hex.

use super::CryptoError;
use crate::util::rand::try_random_bytes;
use data_encoding::HEXUPPER;
use sha1::{Digest, Sha1};

/// Iteration byte Tor uses; expands to 65536 hashed bytes
pub const S2K_ITERATION_BYTE: u8 = 96;

const SALT_LEN: usize = 8;

/// Number of bytes fed to the digest for iteration byte `c`
pub fn s2k_count(c: u8) -> usize {
    (16 + (c as usize & 15)) << ((c as usize >> 4) + 6)
}

/// Hash `secret` with a fresh random salt
pub fn hash_control_password(secret: &str) -> Result<String, CryptoError> {
    let salt = try_random_bytes::<SALT_LEN>().map_err(|e| CryptoError::Rng(e.to_string()))?;
    Ok(hash_control_password_with_salt(secret, &salt))
}

/// Deterministic variant used by [`hash_control_password`]
pub fn hash_control_password_with_salt(secret: &str, salt: &[u8; SALT_LEN]) -> String {
    let c = S2K_ITERATION_BYTE;
    let count = s2k_count(c);

    let mut input = Vec::with_capacity(SALT_LEN + secret.len());
    input.extend_from_slice(salt);
    input.extend_from_slice(secret.as_bytes());

    // Feed salt||secret cyclically until exactly `count` bytes went in
    let mut hasher = Sha1::new();
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(input.len());
        hasher.update(&input[..n]);
        remaining -= n;
    }
    let digest = hasher.finalize();

    let mut out = Vec::with_capacity(SALT_LEN + 1 + digest.len());
    out.extend_from_slice(salt);
    out.push(c);
    out.extend_from_slice(&digest);
    format!("16:{}", HEXUPPER.encode(&out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_for_tor_iteration_byte() {
        assert_eq!(s2k_count(96), 65536);
        assert_eq!(s2k_count(0), 1024);
    }

    #[test]
    fn test_hash_format() {
        let hashed = hash_control_password("correct horse").unwrap();
        assert!(hashed.starts_with("16:"));

        let hex = &hashed[3..];
        assert_eq!(hex.len(), 2 * (8 + 1 + 20));
        assert!(hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        // Iteration byte sits right after the salt
        assert_eq!(&hex[16..18], "60");
    }

    #[test]
    fn test_salt_is_random() {
        let a = hash_control_password("secret").unwrap();
        let b = hash_control_password("secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_known_vector() {
        // `tor --hash-password foo` with salt 0x2d1b7a4f7c4f6d39
        let salt = [0x2d, 0x1b, 0x7a, 0x4f, 0x7c, 0x4f, 0x6d, 0x39];
        let hashed = hash_control_password_with_salt("foo", &salt);
        assert_eq!(
            hashed,
            "16:2D1B7A4F7C4F6D3960F5776F2243891A5A9F8646A6CCE113D45D8B2AB5"
        );
        assert_ne!(hashed, hash_control_password_with_salt("bar", &salt));
    }
}
