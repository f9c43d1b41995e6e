use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use tandem_types::api::Claims;

use crate::error::{ApiError, blocking};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// GET /notifications — the caller's durable records, newest first.
pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.min(200);
    let user_id = claims.sub;
    let records =
        blocking(&state.db, move |db| db.notifications_for_user(user_id, limit)).await?;
    Ok(Json(records))
}

/// POST /notifications/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let updated = blocking(&state.db, move |db| {
        db.mark_notification_read(notification_id, user_id, Utc::now())
    })
    .await?;
    Ok(Json(serde_json::json!({ "read": updated })))
}
