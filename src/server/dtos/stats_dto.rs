use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0 before the first lookup
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub id: usize,
    pub completed: u64,
    pub failed: u64,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    pub queue_depth: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// tasks that ran on the request loop because every queue was full or a worker was too slow
    pub sync_fallbacks: u64,
    pub workers: Vec<WorkerStats>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successful_responses: u64,
    pub failed_responses: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub worker_tasks: u64,
    pub worker_failures: u64,
    pub worker_time_ms: u64,
    pub average_worker_time_ms: f64,
    pub streaming_requests: u64,
    pub total_response_time_ms: u64,
    pub average_response_time_ms: f64,
}
