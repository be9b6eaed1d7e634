pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    Extension, Router,
    extract::Request,
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::{Next, from_fn},
    response::Response,
};
use metrics_exporter_prometheus::PrometheusHandle;
use once_cell::sync::Lazy;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::AppConfig;
use api::{
    image_controller::ImageController, monitoring_controller::MonitoringController,
    proxy_controller::ProxyController,
};
use error::Error;
use services::proxy_services::ProxyServices;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

const CROSS_ORIGIN_RESOURCE_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-resource-policy");

fn cors_layer(cors_origin: &str) -> CorsLayer {
    let allow_origin = if cors_origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        let origins = cors_origin
            .split(',')
            .filter_map(|o| {
                let o = o.trim();
                match HeaderValue::from_str(o) {
                    Ok(v) if !o.is_empty() => Some(v),
                    _ => {
                        warn!("ignoring unusable cors origin {:?}", o);
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ACCEPT,
            header::ACCEPT_ENCODING,
            header::ACCEPT_LANGUAGE,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ORIGIN,
            header::RANGE,
            header::IF_RANGE,
            header::IF_NONE_MATCH,
            header::IF_MODIFIED_SINCE,
            HeaderName::from_static("x-requested-with"),
        ])
        .expose_headers([
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
            header::CONTENT_TYPE,
            header::ACCEPT_RANGES,
            header::ETAG,
            header::LAST_MODIFIED,
            services::pipeline_services::X_CACHE,
        ])
        .max_age(Duration::from_secs(86400))
}

/// the cors layer answers every OPTIONS itself with a 200, players expect a 204
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;

    if is_options && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

async fn not_found() -> Error {
    Error::NotFound("Not found".to_string())
}

pub struct ApplicationServer;

impl ApplicationServer {
    /// All routes mounted under `proxy_base` with the shared layers on top.
    pub fn router(services: ProxyServices, prometheus: Option<PrometheusHandle>) -> Router {
        let base = services.config.normalized_proxy_base();
        let cors = cors_layer(&services.config.cors_origin);

        let routes = Router::new()
            .merge(MonitoringController::app())
            .merge(ImageController::app())
            .merge(ProxyController::app());

        // axum refuses to nest at the root
        let mut app = if base == "/" {
            routes
        } else {
            Router::new().nest(&base, routes).fallback(not_found)
        };

        if let Some(handle) = prometheus {
            app = app.layer(Extension(handle));
        }

        app.layer(Extension(services))
            .layer(cors)
            .layer(SetResponseHeaderLayer::overriding(
                CROSS_ORIGIN_RESOURCE_POLICY,
                HeaderValue::from_static("cross-origin"),
            ))
            .layer(from_fn(preflight_no_content))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(config: Arc<AppConfig>, prometheus: Option<PrometheusHandle>) -> anyhow::Result<()> {
        Lazy::force(&START_TIME);

        let services = ProxyServices::new(config.clone())?;
        let app = Self::router(services, prometheus);

        let address = format!("0.0.0.0:{}", config.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {}", address))?;

        info!(
            "hls relay listening on {} under {}",
            address,
            config.normalized_proxy_base()
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("error while starting server")?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
