use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use tandem_core::MomentError;
use tandem_types::api::{CaptureResponse, Claims, InitiateMomentRequest, MomentResponse};
use tandem_types::models::{FusionArtifactMeta, Moment};

use crate::error::{ApiError, blocking};
use crate::AppState;

/// 25 MB ceiling per capture upload.
const MAX_CAPTURE_SIZE: usize = 25 * 1024 * 1024;

/// POST /moments — open a new Moment; the authenticated user is the
/// initiator and the couple's other partner becomes the participant.
pub async fn initiate(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<InitiateMomentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.ttl_secs == Some(0) {
        return Err(ApiError::bad_request("ttl_secs must be positive"));
    }
    let ttl = req
        .ttl_secs
        .map(|secs| chrono::Duration::seconds(secs as i64));

    let moment = state
        .coordinator
        .initiate(req.couple_id, claims.sub, req.memory_id, ttl)
        .await?;

    Ok((StatusCode::CREATED, Json(MomentResponse::from(moment))))
}

/// POST /moments/{id}/capture — raw image bytes as the request body.
pub async fn capture(
    State(state): State<AppState>,
    Path(moment_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::bad_request("empty capture body"));
    }
    if bytes.len() > MAX_CAPTURE_SIZE {
        return Err(ApiError::bad_request("capture exceeds the 25 MB limit"));
    }

    let outcome = state
        .coordinator
        .capture(moment_id, claims.sub, bytes.to_vec())
        .await?;

    Ok(Json(CaptureResponse {
        moment: MomentResponse::from(outcome.moment),
        duplicate: outcome.duplicate,
        image_path: outcome.image.path,
    }))
}

/// GET /moments/{id}
pub async fn get_moment(
    State(state): State<AppState>,
    Path(moment_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let moment = load_member_moment(&state, moment_id, claims.sub).await?;
    Ok(Json(MomentResponse::from(moment)))
}

/// GET /moments/{id}/image — the fused artifact, once fusion has landed.
pub async fn get_combined_image(
    State(state): State<AppState>,
    Path(moment_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let moment = load_member_moment(&state, moment_id, claims.sub).await?;
    let path = moment
        .combined_image_path
        .ok_or(MomentError::NotFound { what: "fused artifact" })?;
    serve_blob(&state, &path).await
}

/// GET /moments/{id}/thumbnail
pub async fn get_thumbnail(
    State(state): State<AppState>,
    Path(moment_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let moment = load_member_moment(&state, moment_id, claims.sub).await?;
    let meta: FusionArtifactMeta = moment
        .fusion_meta
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or(MomentError::NotFound { what: "fused artifact" })?;
    serve_blob(&state, &meta.thumbnail_path).await
}

/// GET /couples/{id}/moments/active — the couple's non-terminal Moments,
/// newest first.
pub async fn active_moments(
    State(state): State<AppState>,
    Path(couple_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let couple = blocking(&state.db, move |db| db.get_couple(couple_id))
        .await?
        .ok_or(MomentError::NotFound { what: "couple" })?;
    if !couple.is_member(claims.sub) {
        return Err(MomentError::Forbidden.into());
    }

    let moments = blocking(&state.db, move |db| db.active_moments(couple_id)).await?;
    let responses: Vec<MomentResponse> = moments.into_iter().map(MomentResponse::from).collect();
    Ok(Json(responses))
}

async fn load_member_moment(
    state: &AppState,
    moment_id: Uuid,
    user_id: Uuid,
) -> Result<Moment, ApiError> {
    let moment = blocking(&state.db, move |db| db.get_moment(moment_id))
        .await?
        .ok_or(MomentError::NotFound { what: "moment" })?;

    // Capture is restricted to the two named participants; reads extend to
    // the owning couple.
    let couple_id = moment.couple_id;
    let couple = blocking(&state.db, move |db| db.get_couple(couple_id))
        .await?
        .ok_or(MomentError::NotFound { what: "couple" })?;
    if !couple.is_member(user_id) {
        return Err(MomentError::Forbidden.into());
    }
    Ok(moment)
}

async fn serve_blob(state: &AppState, path: &str) -> Result<impl IntoResponse + use<>, ApiError> {
    let content_type = if path.ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    };
    let bytes = state
        .blobs
        .read(path)
        .await
        .map_err(MomentError::Storage)?;
    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], bytes))
}
