use chrono::{DateTime, Utc};
use thiserror::Error;

use tandem_types::models::MomentStatus;

use crate::fusion::FusionError;

/// Error taxonomy for the Moment protocol.
///
/// Validation and authorization failures surface synchronously and never
/// partially mutate state. `ConcurrencyConflict` only appears after the
/// bounded internal retry is exhausted. Fusion and dispatch failures are
/// recovered out-of-band and never travel through this type back to a
/// `capture` caller.
#[derive(Debug, Error)]
pub enum MomentError {
    #[error("{what} not found")]
    NotFound { what: &'static str },

    #[error("user is not a participant of this moment")]
    Forbidden,

    #[error("moment expired at {expires_at}")]
    Expired { expires_at: DateTime<Utc> },

    #[error("invalid transition from {} to {}", .from.as_str(), .requested.as_str())]
    InvalidTransition {
        from: MomentStatus,
        requested: MomentStatus,
    },

    #[error("couple already has {limit} active moments")]
    Capacity { limit: u32 },

    #[error("conditional write lost the race {attempts} times")]
    ConcurrencyConflict { attempts: u32 },

    #[error("fusion failed")]
    Fusion(#[from] FusionError),

    #[error("blob storage failure")]
    Storage(#[source] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MomentError {
    /// Stable machine-readable kind, used as the `error` field of API
    /// responses so clients can branch without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Forbidden => "forbidden",
            Self::Expired { .. } => "expired",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Capacity { .. } => "capacity_exceeded",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::Fusion(_) => "fusion_failed",
            Self::Storage(_) => "storage_failure",
            Self::Internal(_) => "internal",
        }
    }
}
