//! Admin API error types
//!
//! Proxy failures are rendered directly by the proxy handler; only the admin
//! surface needs a typed error that maps onto HTTP statuses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures of the admin data and reconfiguration endpoints.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Invalid API Key")]
    Unauthorized,

    #[error("Invalid JSON format")]
    InvalidJson,

    #[error("Configuration must be a JSON object")]
    NotAnObject,

    #[error("{0}")]
    Write(#[from] vertex_config::Error),
}

impl AdminError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::InvalidJson | AdminError::NotAnObject => StatusCode::BAD_REQUEST,
            AdminError::Write(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.to_string() });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
