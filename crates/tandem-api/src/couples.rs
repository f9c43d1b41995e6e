use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use tandem_core::MomentError;
use tandem_types::api::{Claims, CreateCoupleRequest};
use tandem_types::models::Couple;

use crate::error::{ApiError, blocking};
use crate::AppState;

/// POST /couples — pair the authenticated user with a partner.
pub async fn create_couple(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateCoupleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.partner_id == claims.sub {
        return Err(ApiError::bad_request("cannot pair with yourself"));
    }

    let couple = Couple {
        id: Uuid::new_v4(),
        partner1_id: claims.sub,
        partner2_id: req.partner_id,
        created_at: Utc::now(),
    };

    let insert = couple.clone();
    blocking(&state.db, move |db| db.create_couple(&insert)).await?;

    Ok((StatusCode::CREATED, Json(couple)))
}

/// GET /couples/{id}
pub async fn get_couple(
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
    Ok(Json(couple))
}
