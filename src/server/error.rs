use axum::{
    Json,
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error};

use crate::server::dtos::error_dto::ErrorResponse;
use crate::server::utils::url_utils::ValidationError;

pub type AppResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// bad or disallowed target, nothing was sent upstream
    #[error("{message}")]
    BadRequest { message: String, url: Option<String> },

    #[error("Request timed out after {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64, url: String },

    /// upstream answered >= 400, forwarded as is
    #[error("upstream responded with {status}")]
    Upstream {
        status: StatusCode,
        content_type: Option<String>,
        body: Bytes,
    },

    /// the request never got an answer (dns, tls, connection reset)
    #[error("{message}")]
    Fetch { message: String, url: String },

    /// decompression or rewriting failed and no fallback was left
    #[error("{message}")]
    Processing { message: String, url: String },

    #[error("Failed to fetch image: {reason}")]
    ImageFetch {
        status: StatusCode,
        reason: String,
        url: String,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    pub fn validation(err: ValidationError, url: Option<String>) -> Self {
        Self::BadRequest {
            message: err.reason,
            url,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { status, .. } | Self::ImageFetch { status, .. } => *status,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Fetch { .. }
            | Self::Processing { .. }
            | Self::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn url(&self) -> Option<String> {
        match self {
            Self::BadRequest { url, .. } => url.clone(),
            Self::UpstreamTimeout { url, .. }
            | Self::Fetch { url, .. }
            | Self::Processing { url, .. }
            | Self::ImageFetch { url, .. } => Some(url.clone()),
            _ => None,
        }
    }
}

/// upstream error bodies go back byte for byte, json bodies are labelled as json whatever the
/// origin claimed
fn upstream_response(status: StatusCode, content_type: Option<String>, body: Bytes) -> Response {
    let is_json = !body.is_empty() && serde_json::from_slice::<serde_json::Value>(&body).is_ok();

    let content_type = if is_json {
        HeaderValue::from_static("application/json")
    } else {
        content_type
            .and_then(|ct| HeaderValue::from_str(&ct).ok())
            .unwrap_or_else(|| HeaderValue::from_static("text/plain; charset=utf-8"))
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    response
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self {
            Self::Upstream {
                status,
                content_type,
                body,
            } => {
                debug!("forwarding upstream error {} ({} bytes)", status, body.len());
                upstream_response(status, content_type, body)
            }
            other => {
                if status.is_server_error() {
                    error!("{}", other);
                } else {
                    debug!("{}", other);
                }
                let body = ErrorResponse::new(status.as_u16(), other.to_string(), other.url());
                (status, Json(body)).into_response()
            }
        }
    }
}
