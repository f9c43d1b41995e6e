use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Moment, MomentStatus};

// -- JWT Claims --

/// JWT claims shared across tandem-api (REST middleware) and tandem-gateway
/// (WebSocket authentication). Tokens are minted by the external identity
/// provider; this is the shape we validate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Couples --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCoupleRequest {
    pub partner_id: Uuid,
}

// -- Moments --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitiateMomentRequest {
    pub couple_id: Uuid,
    pub memory_id: Option<Uuid>,
    /// Capture window in seconds. Defaults to 24 h, clamped to the 72 h max.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MomentResponse {
    pub moment_id: Uuid,
    pub couple_id: Uuid,
    pub initiator_id: Uuid,
    pub participant_id: Option<Uuid>,
    pub memory_id: Option<Uuid>,
    pub status: MomentStatus,
    pub captured_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub combined_image_path: Option<String>,
}

impl From<Moment> for MomentResponse {
    fn from(m: Moment) -> Self {
        Self {
            moment_id: m.id,
            couple_id: m.couple_id,
            initiator_id: m.initiator_id,
            participant_id: m.participant_id,
            memory_id: m.memory_id,
            status: m.status,
            captured_by: m.captured_by,
            created_at: m.created_at,
            expires_at: m.expires_at,
            completed_at: m.completed_at,
            combined_image_path: m.combined_image_path,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub moment: MomentResponse,
    /// True when the upload was byte-identical to an existing capture for
    /// this couple; `image_path` then points at the existing artifact.
    pub duplicate: bool,
    pub image_path: String,
}

// -- Errors --

/// Error body returned by every failing endpoint: a stable machine-readable
/// kind plus a human-readable message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
