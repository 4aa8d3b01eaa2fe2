use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use higgs_core::ServeError;

/// Status used when the client went away mid-request.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    ModelNotFound(String),
    ClientDisconnected,
    EngineError(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub r#type: &'static str,
    pub code: Option<&'static str>,
}

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self {
        match err {
            ServeError::Validation(_) | ServeError::ExtractorSetup { .. } => {
                ApiError::InvalidRequest(err.to_string())
            }
            ServeError::ClientDisconnected => ApiError::ClientDisconnected,
            other => ApiError::EngineError(other.to_string()),
        }
    }
}

impl ApiError {
    fn parts(self) -> (StatusCode, ErrorResponse) {
        let (status, error_type, code, message) = match self {
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", None, msg)
            }
            ApiError::ModelNotFound(msg) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                Some("model_not_found"),
                msg,
            ),
            ApiError::ClientDisconnected => (
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST),
                "client_error",
                Some("client_disconnected"),
                "Client disconnected".to_string(),
            ),
            ApiError::EngineError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None, msg)
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                message,
                r#type: error_type,
                code,
            },
        };
        (status, body)
    }

    /// Body of an error reported inside an already-started SSE stream.
    pub fn into_body(self) -> ErrorResponse {
        self.parts().1
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        (status, axum::Json(body)).into_response()
    }
}
