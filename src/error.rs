//! Typed rejection taxonomy for the dispatch pipeline.
//!
//! Every policy decision in the pipeline is a value of [`GatewayError`], never
//! an uncontrolled fault. Policy rejections carry the route-configured message
//! and are returned verbatim; backend and fault variants map to generic bodies
//! so that internal detail never leaks to the client.
use std::net::IpAddr;

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use thiserror::Error;

/// Body returned for faults contained by the recovery layer. Diagnostic detail
/// goes to the tracing sink only.
pub const GENERIC_FAULT_BODY: &str = "internal server error";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches the request")]
    RouteNotFound,

    #[error("client {0} is blocked")]
    BlockedClient(IpAddr),

    #[error("credential missing or invalid")]
    InvalidCredential,

    #[error("credential valid but not authorized for this route")]
    NotAuthorized,

    #[error("rate limited: {message}")]
    RateLimited { status: StatusCode, message: String },

    #[error("circuit open: {message}")]
    CircuitOpen { message: String },

    #[error("backend did not answer within {timeout_ms}ms")]
    BackendTimeout { timeout_ms: u64 },

    #[error("backend connection failed: {0}")]
    BackendConnection(String),

    #[error("unhandled fault in the pipeline")]
    UnhandledFault,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::BlockedClient(_) => StatusCode::FORBIDDEN,
            Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::NotAuthorized => StatusCode::FORBIDDEN,
            Self::RateLimited { status, .. } => *status,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendConnection(_) => StatusCode::BAD_GATEWAY,
            Self::UnhandledFault => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-visible body. Configured messages are returned verbatim; the
    /// rest get short generic strings.
    fn body(&self) -> String {
        match self {
            Self::RouteNotFound => "no matching route".to_string(),
            Self::BlockedClient(_) => "forbidden".to_string(),
            Self::InvalidCredential => "invalid credential".to_string(),
            Self::NotAuthorized => "not authorized".to_string(),
            Self::RateLimited { message, .. } => message.clone(),
            Self::CircuitOpen { message } => message.clone(),
            Self::BackendTimeout { .. } => "backend timeout".to_string(),
            Self::BackendConnection(_) => "bad gateway".to_string(),
            Self::UnhandledFault => GENERIC_FAULT_BODY.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Body::from(self.body())).into_response()
    }
}
