use axum::{
    Extension, Json, Router,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::server::{
    api::health_controller::status_endpoint,
    dtos::{
        api_dto::{DataResponse, MessageResponse},
        stats_dto::{CacheStats, MetricsSnapshot, WorkerPoolStats},
    },
    services::proxy_services::ProxyServices,
};

pub struct MonitoringController;

impl MonitoringController {
    pub fn app() -> Router {
        Router::new()
            .route("/status", get(status_endpoint))
            .route("/cache/stats", get(Self::cache_stats))
            .route("/cache/clear", post(Self::cache_clear))
            .route("/workers/stats", get(Self::worker_stats))
            .route("/metrics", get(Self::metrics))
            .route("/metrics/reset", post(Self::metrics_reset))
            .route("/metrics/prometheus", get(Self::prometheus))
    }

    async fn cache_stats(Extension(services): Extension<ProxyServices>) -> Json<DataResponse<CacheStats>> {
        Json(DataResponse::ok(services.cache.stats()))
    }

    async fn cache_clear(Extension(services): Extension<ProxyServices>) -> Json<MessageResponse> {
        let dropped = services.cache.clear();
        info!("cache cleared, {} entries dropped", dropped);
        Json(MessageResponse::ok(format!("Cache cleared ({} entries)", dropped)))
    }

    async fn worker_stats(Extension(services): Extension<ProxyServices>) -> Json<DataResponse<WorkerPoolStats>> {
        Json(DataResponse::ok(services.decompression.stats()))
    }

    async fn metrics(Extension(services): Extension<ProxyServices>) -> Json<DataResponse<MetricsSnapshot>> {
        Json(DataResponse::ok(services.metrics.snapshot()))
    }

    async fn metrics_reset(Extension(services): Extension<ProxyServices>) -> Json<MessageResponse> {
        services.metrics.reset();
        info!("metrics reset");
        Json(MessageResponse::ok("Metrics reset"))
    }

    /// text exposition format, only there when the binary installed the recorder
    async fn prometheus(handle: Option<Extension<PrometheusHandle>>) -> Response {
        match handle {
            Some(Extension(handle)) => (
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                )],
                handle.render(),
            )
                .into_response(),
            None => (StatusCode::NOT_FOUND, "prometheus exporter not installed").into_response(),
        }
    }
}
