use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Ok,
}

/// envelope for the read only monitoring endpoints
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub status: ApiStatus,
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> DataResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: ApiStatus::Ok,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// envelope for endpoints that change something (clear, reset)
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub status: ApiStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Ok,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
