use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};

use crate::server::dtos::stats_dto::MetricsSnapshot;

/// Process wide request counters.
///
/// Every counter is also mirrored into the `metrics` facade so a prometheus recorder sees it,
/// `reset` only clears the local snapshot.
#[derive(Debug, Default)]
pub struct MetricsService {
    stream_size_threshold: u64,
    requests: AtomicU64,
    successful_responses: AtomicU64,
    failed_responses: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    total_response_time_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    worker_tasks: AtomicU64,
    worker_failures: AtomicU64,
    worker_time_ms: AtomicU64,
    streaming_requests: AtomicU64,
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

impl MetricsService {
    pub fn new(stream_size_threshold: u64) -> Self {
        Self {
            stream_size_threshold,
            ..Default::default()
        }
    }

    /// returns the start instant to hand back to [`Self::record_response`]
    pub fn record_request(&self) -> Instant {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_requests_total").increment(1);
        Instant::now()
    }

    pub fn record_response(&self, started: Instant, success: bool, bytes_in: u64, bytes_out: u64) {
        let elapsed = started.elapsed();
        let outcome = if success { "success" } else { "failure" };

        if success {
            self.successful_responses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_responses.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);

        counter!("proxy_responses_total", "outcome" => outcome).increment(1);
        counter!("proxy_bytes_in_total").increment(bytes_in);
        counter!("proxy_bytes_out_total").increment(bytes_out);
        histogram!("proxy_response_seconds", "outcome" => outcome).record(elapsed.as_secs_f64());
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_cache_hits_total").increment(1);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_cache_misses_total").increment(1);
    }

    pub fn record_worker_task(&self, duration: Duration, success: bool) {
        self.worker_tasks.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.worker_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.worker_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        let outcome = if success { "success" } else { "failure" };
        counter!("proxy_worker_tasks_total", "outcome" => outcome).increment(1);
        histogram!("proxy_worker_task_seconds").record(duration.as_secs_f64());
    }

    /// counts the response as streaming when it's over the configured threshold
    pub fn record_streaming_request(&self, content_length: u64) -> bool {
        if content_length <= self.stream_size_threshold {
            return false;
        }
        self.streaming_requests.fetch_add(1, Ordering::Relaxed);
        counter!("proxy_streaming_requests_total").increment(1);
        true
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let successful = load(&self.successful_responses);
        let failed = load(&self.failed_responses);
        let worker_tasks = load(&self.worker_tasks);
        let worker_time_ms = load(&self.worker_time_ms);
        let total_response_time_ms = load(&self.total_response_time_ms);

        MetricsSnapshot {
            requests: load(&self.requests),
            successful_responses: successful,
            failed_responses: failed,
            bytes_in: load(&self.bytes_in),
            bytes_out: load(&self.bytes_out),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            worker_tasks,
            worker_failures: load(&self.worker_failures),
            worker_time_ms,
            average_worker_time_ms: average(worker_time_ms, worker_tasks),
            streaming_requests: load(&self.streaming_requests),
            total_response_time_ms,
            average_response_time_ms: average(total_response_time_ms, successful + failed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.successful_responses,
            &self.failed_responses,
            &self.bytes_in,
            &self.bytes_out,
            &self.total_response_time_ms,
            &self.cache_hits,
            &self.cache_misses,
            &self.worker_tasks,
            &self.worker_failures,
            &self.worker_time_ms,
            &self.streaming_requests,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
