//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use inventory_sync_core::SyncError;
use serde::Serialize;

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Item not found: {0}")]
    ItemNotFound(String),
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::ItemNotFound(_) => (StatusCode::NOT_FOUND, "ITEM_NOT_FOUND"),
            ApiError::Sync(err) => match err {
                SyncError::Conflict { .. } => (StatusCode::CONFLICT, "CONFLICT"),
                SyncError::RateLimited { .. } => (StatusCode::SERVICE_UNAVAILABLE, "RATE_LIMITED"),
                SyncError::RetriesExhausted { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "RETRIES_EXHAUSTED")
                }
                SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                SyncError::Failure(_) => (StatusCode::BAD_GATEWAY, "SOURCE_FAILURE"),
                SyncError::DeadlineExceeded(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "DEADLINE_EXCEEDED")
                }
                SyncError::UnknownSource(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_SOURCE"),
                SyncError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            holder: Option<String>,
            retryable: bool,
        }

        let (status, code) = self.status();
        let (holder, retryable) = match &self {
            ApiError::Sync(err) => {
                let holder = match err {
                    SyncError::Conflict { holder, .. } => Some(holder.clone()),
                    _ => None,
                };
                (holder, err.is_retryable())
            }
            ApiError::ItemNotFound(_) => (None, false),
        };

        let body = ErrorBody {
            error: self.to_string(),
            code,
            holder,
            retryable,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use inventory_sync_core::ItemKey;

    fn status_of(err: SyncError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_sync_errors_map_to_status_codes() {
        let item = ItemKey::new("warehouse", "7");
        assert_eq!(
            status_of(SyncError::Conflict {
                item: item.clone(),
                holder: "A".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SyncError::RetriesExhausted {
                attempts: 2,
                retry_after: Duration::from_secs(1)
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(SyncError::NotFound(item.to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SyncError::Failure("protected".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(SyncError::DeadlineExceeded(item)),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(SyncError::UnknownSource("nope".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_missing_item_is_404() {
        let response = ApiError::ItemNotFound("warehouse/1".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
