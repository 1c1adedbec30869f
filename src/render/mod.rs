//! Config Renderer
//!
//! Pure functions from a resource to daemon configuration text. Output is
//! byte-for-byte deterministic for a given input, which is what lets the
//! agents decide whether a reload is needed by comparing files.

pub mod balancer;
pub mod torrc;

pub use balancer::{render_balancer_config, render_balancer_torrc};
pub use torrc::{render_ob_config, render_service_torrc, TorrcOptions};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid rule {index}: {reason}")]
    InvalidRule { index: usize, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to encode config: {0}")]
    Encode(String),
}

/// Reject values that would break a line-oriented config
fn check_single_token(field: &'static str, value: &str) -> Result<(), RenderError> {
    if value.is_empty() {
        return Err(RenderError::InvalidValue {
            field,
            reason: "empty".to_string(),
        });
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(RenderError::InvalidValue {
            field,
            reason: format!("{:?} contains whitespace", value),
        });
    }
    Ok(())
}
