use crate::domain::error::ChargeError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

// Newtype над доменной ошибкой, чтобы реализовать для нее IntoResponse
pub struct ApiError(pub ChargeError);

impl From<ChargeError> for ApiError {
    fn from(err: ChargeError) -> Self {
        Self(err)
    }
}

// HTTP-коды живут только в слое адаптеров
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self.0 {
            ChargeError::WebhookSignature(msg) => {
                tracing::warn!("webhook rejected: {msg}");
                (
                    StatusCode::UNAUTHORIZED,
                    "webhook_signature",
                    "invalid webhook signature".to_string(),
                )
            }
            ChargeError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            ChargeError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ChargeError::Invariant(msg) => {
                tracing::error!("invariant violated: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_string(),
                )
            }
            other => {
                tracing::error!(kind = other.kind(), "request failed: {other}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error_code": error_code,
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}
