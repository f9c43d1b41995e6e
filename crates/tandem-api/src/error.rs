use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use tandem_core::MomentError;
use tandem_db::Database;
use tandem_types::api::ErrorResponse;

/// Wrapper turning protocol errors into HTTP responses with a stable
/// machine-readable `error` kind, so clients can tell "try a new moment"
/// (expired) from "retry this request" (concurrency_conflict) from
/// "nothing to do" (duplicates are success-shaped and never come here).
pub enum ApiError {
    Moment(MomentError),
    BadRequest(String),
}

impl From<MomentError> for ApiError {
    fn from(e: MomentError) -> Self {
        Self::Moment(e)
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            Self::Moment(e) => {
                let status = match &e {
                    MomentError::NotFound { .. } => StatusCode::NOT_FOUND,
                    MomentError::Forbidden => StatusCode::FORBIDDEN,
                    MomentError::Expired { .. } => StatusCode::GONE,
                    MomentError::InvalidTransition { .. } => StatusCode::CONFLICT,
                    MomentError::Capacity { .. } => StatusCode::TOO_MANY_REQUESTS,
                    MomentError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
                    MomentError::Fusion(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    MomentError::Storage(_) | MomentError::Internal(_) => {
                        error!("Internal error on API path: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.kind(), e.to_string())
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: kind.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

/// Run a blocking database closure off the async runtime, mapping failures
/// into the API error shape.
pub(crate) async fn blocking<T, F>(db: &Arc<Database>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            ApiError::Moment(MomentError::Internal(anyhow::anyhow!(
                "spawn_blocking join error: {e}"
            )))
        })?
        .map_err(|e| ApiError::Moment(MomentError::Internal(e)))
}
