//! Gateway error types.
//!
//! Every failure the core can produce is one [`GatewayError`] variant.
//! The enum implements [`axum::response::IntoResponse`] so handlers can
//! simply return `Err(GatewayError::JobTimeout { .. })` and get an oVirt
//! `<fault>` body with the right status.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::xml::render_fault;

/// Realm advertised on 401 responses, matching the oVirt engine.
const AUTH_REALM: &str = "Basic realm=\"RESTAPI\"";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or missing Authorization header, unsupported scheme, or the
    /// backend rejected the login.
    #[error("{message}")]
    Authentication { message: String },

    /// A backend call needed an identity that the request does not carry.
    ///
    /// `gateway_defect` is true when the auth middleware ran but left no
    /// identity behind, which is a bug rather than a caller mistake.
    #[error("No backend session is available for this request")]
    SessionNotFound { gateway_defect: bool },

    /// Non-2xx response, network failure, or unparseable body from the backend.
    #[error("Backend request failed: {message}")]
    DownstreamTransport { message: String },

    /// The backend reported the async job as failed.
    #[error("CloudStack job {job_id} failed: {code}")]
    JobFailed {
        job_id: String,
        code: String,
        detail: Option<String>,
    },

    /// The job was still pending when the wait budget ran out.
    #[error("Job {job_id} execution timeout after {timeout_secs} seconds")]
    JobTimeout { job_id: String, timeout_secs: u64 },

    /// The request itself is malformed.
    #[error("{message}")]
    BadRequest { message: String },

    #[error("{message}")]
    NotFound { message: String },

    #[error("Internal gateway error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Shorthand for an [`GatewayError::Authentication`] with a message.
    pub fn auth(message: impl Into<String>) -> Self {
        GatewayError::Authentication {
            message: message.into(),
        }
    }

    /// Shorthand for a [`GatewayError::DownstreamTransport`] with a message.
    pub fn transport(message: impl Into<String>) -> Self {
        GatewayError::DownstreamTransport {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        GatewayError::BadRequest {
            message: message.into(),
        }
    }

    /// Short reason phrase used in the `<reason>` element.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::Authentication { .. } => "Unauthorized",
            GatewayError::SessionNotFound { .. } => "Session Not Found",
            GatewayError::DownstreamTransport { .. } => "Operation Failed",
            GatewayError::JobFailed { .. } => "Operation Failed",
            GatewayError::JobTimeout { .. } => "Request Timeout",
            GatewayError::BadRequest { .. } => "Bad Request",
            GatewayError::NotFound { .. } => "Not Found",
            GatewayError::Internal(_) => "Internal Server Error",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::SessionNotFound {
                gateway_defect: false,
            } => StatusCode::UNAUTHORIZED,
            GatewayError::SessionNotFound {
                gateway_defect: true,
            } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::DownstreamTransport { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::JobFailed { .. } => StatusCode::BAD_REQUEST,
            GatewayError::JobTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            GatewayError::JobFailed {
                detail: Some(text), ..
            } => format!("{self}: {text}"),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = render_fault(self.reason(), &self.detail());

        if status == StatusCode::UNAUTHORIZED {
            return (
                status,
                [
                    (header::CONTENT_TYPE, "application/xml"),
                    (header::WWW_AUTHENTICATE, AUTH_REALM),
                ],
                body,
            )
                .into_response();
        }

        (status, [(header::CONTENT_TYPE, "application/xml")], body).into_response()
    }
}
