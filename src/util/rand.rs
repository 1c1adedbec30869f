//! Randomization utilities

use rand::{CryptoRng, Rng, RngCore};

const PASSWORD_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a random alphanumeric password
pub fn random_password(len: usize) -> String {
    random_password_with(&mut rand::thread_rng(), len)
}

/// Same as [`random_password`], drawing from `rng`
pub fn random_password_with<R: RngCore + CryptoRng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

/// Fill `N` bytes from the OS generator, reporting failure instead of panicking
pub fn try_random_bytes<const N: usize>() -> Result<[u8; N], rand::Error> {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.try_fill_bytes(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_password_alphabet() {
        let password = random_password(16);
        assert_eq!(password.len(), 16);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, random_password(16));
    }

    #[test]
    fn test_try_random_bytes() {
        let a = try_random_bytes::<32>().unwrap();
        let b = try_random_bytes::<32>().unwrap();
        assert_ne!(a, b);
    }
}
