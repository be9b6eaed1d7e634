use axum::Extension;
use axum::Json;
use tracing::debug;

use crate::logger::Logger;
use crate::server::dtos::api_dto::DataResponse;
use crate::server::dtos::status_dto::{MemorySnapshot, StatusData};
use crate::server::services::proxy_services::ProxyServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// liveness plus a rough idea of how much memory we're holding
pub async fn status_endpoint(
    Extension(services): Extension<ProxyServices>,
) -> Json<DataResponse<StatusData>> {
    let cache = services.cache.stats();

    let status = StatusData {
        version: get_app_version().to_string(),
        environment: Logger::environment_name(services.config.cargo_env).to_string(),
        uptime_seconds: get_uptime_seconds(),
        memory: MemorySnapshot {
            rss_bytes: resident_set_bytes(),
            cache_bytes: cache.total_bytes,
            cache_max_bytes: cache.max_bytes,
        },
    };

    Json(DataResponse::ok(status))
}

/// VmRSS out of /proc/self/status, `None` wherever procfs isn't a thing
fn resident_set_bytes() -> Option<u64> {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(e) => {
            debug!("no procfs status: {}", e);
            return None;
        }
    };

    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kib * 1024)
}
