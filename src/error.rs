use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

/// Failures that terminate a request and reach the caller.
///
/// Local store failures are deliberately absent: the store recovers them and
/// hands back default state.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    /// A provider credential is missing from the environment.
    #[error("{0}")]
    Configuration(String),
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("A response is already being generated for chat {0}")]
    SessionBusy(Uuid),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    RemoteProvider(#[from] anyhow::Error),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) | ChatError::UnsupportedProvider(_) => StatusCode::BAD_REQUEST,
            ChatError::SessionBusy(_) => StatusCode::CONFLICT,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Configuration(_) | ChatError::RemoteProvider(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {:#}", self);
        } else {
            log::warn!("Request rejected: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
