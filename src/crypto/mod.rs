//! Cryptographic primitives for v3 Onion Services
//!
//! Identity generation, key file encodings and control password hashing.
//! All crypto operations are isolated here - no IO allowed.

#![allow(unused_imports)] // Re-exports for public API

pub mod keys;
pub mod password;

pub use keys::{
    onion_address_from_public_key, pubkey_from_onion_address, public_key_from_file,
    OnionIdentity,
};
pub use password::hash_control_password;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("random source failed: {0}")]
    Rng(String),

    #[error("invalid onion address: {0}")]
    InvalidAddress(String),

    #[error("invalid key file: {0}")]
    InvalidKeyFile(String),
}
