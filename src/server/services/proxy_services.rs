use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::config::AppConfig;

use super::{
    decompression_services::DecompressionService,
    header_resolver_services::HeaderResolverService,
    metrics_services::MetricsService,
    response_cache_services::{DynResponseCacheService, ResponseCacheService},
    upstream_services::{DynUpstreamService, UpstreamService},
};

/// everything a request handler needs, cloned into every request as an extension
#[derive(Clone)]
pub struct ProxyServices {
    pub config: Arc<AppConfig>,
    pub cache: DynResponseCacheService,
    pub decompression: Arc<DecompressionService>,
    pub metrics: Arc<MetricsService>,
    pub header_rules: Arc<HeaderResolverService>,
    pub upstream: DynUpstreamService,
}

impl ProxyServices {
    pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        info!("starting proxy services...");

        let upstream = Arc::new(
            UpstreamService::new(
                Duration::from_millis(config.request_timeout_ms),
                config.accept_invalid_certs,
            )
            .context("failed to build the upstream http client")?,
        ) as DynUpstreamService;

        Self::with_upstream(config, upstream)
    }

    /// same wiring with a caller supplied upstream, tests hand in a mock here
    pub fn with_upstream(config: Arc<AppConfig>, upstream: DynUpstreamService) -> anyhow::Result<Self> {
        let header_rules = Arc::new(
            HeaderResolverService::load(config.header_rules_path.as_deref().map(Path::new))
                .context("failed to load header rules")?,
        );
        info!("{} header rules loaded", header_rules.rule_count());

        let worker_count = config.effective_worker_count();
        let decompression = Arc::new(
            DecompressionService::new(
                worker_count,
                config.worker_queue_depth,
                Duration::from_millis(config.worker_timeout_ms),
            )
            .context("failed to spawn decompression workers")?,
        );
        info!("{} decompression workers up", worker_count);

        let cache = Arc::new(ResponseCacheService::new(
            config.cache_max_bytes as u64,
            config.cache_max_entry_bytes as u64,
        )) as DynResponseCacheService;

        let metrics = Arc::new(MetricsService::new(config.stream_size_threshold));

        Ok(Self {
            config,
            cache,
            decompression,
            metrics,
            header_rules,
            upstream,
        })
    }
}
