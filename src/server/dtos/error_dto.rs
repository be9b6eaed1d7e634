use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// mirrors the http status
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `{ error: { code, message, url? }, success: false, timestamp }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(code: u16, message: impl Into<String>, url: Option<String>) -> Self {
        Self {
            error: ErrorDetail {
                code,
                message: message.into(),
                url,
            },
            success: false,
            timestamp: Utc::now(),
        }
    }
}
