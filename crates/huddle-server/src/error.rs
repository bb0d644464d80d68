use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use huddle_shared::ChatError;
use thiserror::Error;

/// HTTP face of a [`ChatError`]: the error kind picks the status, the body
/// is `{"error": message, "code": tag}`.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ServerError(#[from] pub ChatError);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }

        let body = serde_json::json!({
            "error": err.public_message(),
            "code": err.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let resp = ServerError::from(ChatError::RoomNotFound).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ServerError::from(ChatError::InvalidRequest("nope".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ServerError::from(ChatError::MediaTooLarge { size: 2, max: 1 }).into_response();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let resp = ServerError::from(ChatError::Internal("disk on fire".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
