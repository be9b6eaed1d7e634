use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ImageEncodeQuery {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedImage {
    pub original_url: String,
    pub encoded_url: String,
    /// path relative to the server root
    pub proxied_url: String,
    /// same as `proxied_url` but with scheme and host of the incoming request
    pub full_proxied_url: String,
    pub html_example: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEncodeResponse {
    pub success: bool,
    pub data: EncodedImage,
    pub timestamp: DateTime<Utc>,
}
