use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("No backend registered for authority: {0}")]
    NoRoute(String),

    #[error("Backend request could not be started: {0}")]
    BackendStart(String),

    #[error("Backend I/O failure: {0}")]
    BackendIo(String),

    #[error("No event within the {stage} timeout")]
    StageTimeout { stage: &'static str },

    #[error("Client I/O failure: {0}")]
    ClientIo(String),

    #[error("Route refresh failed: {0}")]
    RouteRefresh(String),

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl RouterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::NoRoute(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::BackendStart(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::BackendIo(_) => StatusCode::BAD_GATEWAY,
            RouterError::StageTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RouterError::ClientIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::RouteRefresh(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        // Clients get a bare status line; the reason stays in our logs.
        self.status_code().into_response()
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
