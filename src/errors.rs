//! Typed errors for the automation subsystem.
//!
//! Delivery failures are deliberately NOT represented here: the dispatcher
//! records them on the event row (`status`, `last_error`) instead of
//! propagating them. Only the manual retry action needs matchable variants,
//! so API handlers can map them to status codes.

use thiserror::Error;
use uuid::Uuid;

/// Why a manual retry request was rejected.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Automation event {id} not found")]
    NotFound { id: Uuid },

    #[error("Already sent.")]
    AlreadySent,

    #[error("Max attempts reached.")]
    MaxAttemptsReached,

    #[error("Event is not retryable.")]
    NotRetryable,

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}
