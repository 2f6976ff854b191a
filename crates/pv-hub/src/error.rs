use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pv_core::CoreError;
use serde::Serialize;

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
}

/// HTTP wrapper around core errors. Each error is logged once, here.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        Self(value)
    }
}

/// Unreadable request bodies are parameter errors like any other.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let msg = format!("request body: {}", rejection.body_text());
        Self(CoreError::InvalidParameter(msg))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::MissingParameters(_)
            | CoreError::InvalidParameter(_)
            | CoreError::InvalidScriptFormat(_)
            | CoreError::InvalidAggregationSyntax(_)
            | CoreError::InvalidPipelineFormat(_)
            | CoreError::InvalidAggregationPipeline(_)
            | CoreError::InvalidExecutionMode(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_client_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "Request rejected");
        } else {
            tracing::error!(status = status.as_u16(), error = %self.0, "Request failed");
        }

        let payload = Json(ErrorResponse {
            error: self.0.to_string(),
        });
        (status, payload).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
