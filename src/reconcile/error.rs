//! Reconcile error taxonomy

use crate::api::InvalidSpec;
use crate::crypto::CryptoError;
use crate::render::RenderError;
use crate::store::StoreError;
use thiserror::Error;

/// Why a reconcile pass stopped early
///
/// Every variant aborts the remaining pipeline steps and is handed back to
/// the work-queue controller, which alone decides between retry and drop.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Transient API failure
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("identity generation failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    /// Something this pass depends on is not there yet
    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error(transparent)]
    Invalid(#[from] InvalidSpec),
}

impl ReconcileError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}
