use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use parley_gateway::{GatewayError, StoreError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Gateway(e) => match e {
                GatewayError::Auth(_) | GatewayError::NotAuthenticated => {
                    (StatusCode::UNAUTHORIZED, e.to_string())
                }
                GatewayError::NotAMember(_) | GatewayError::Denied(_) => {
                    (StatusCode::FORBIDDEN, e.to_string())
                }
                GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
                GatewayError::InvalidIntent(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                GatewayError::AlreadyAuthenticated | GatewayError::Store(StoreError::Conflict) => {
                    (StatusCode::CONFLICT, e.to_string())
                }
                GatewayError::Store(_) | GatewayError::ConnectionClosed => {
                    error!("Request failed: {}", e);
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
                }
            },
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
