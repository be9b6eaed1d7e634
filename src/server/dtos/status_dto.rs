use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    /// resident set size of the process, `None` off linux
    pub rss_bytes: Option<u64>,
    pub cache_bytes: u64,
    pub cache_max_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
    pub memory: MemorySnapshot,
}
