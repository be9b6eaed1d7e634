pub mod decompression_services;
pub mod header_resolver_services;
pub mod metrics_services;
pub mod pipeline_services;
pub mod proxy_services;
pub mod response_cache_services;
pub mod upstream_services;

pub use response_cache_services::DynResponseCacheService;
pub use upstream_services::DynUpstreamService;
