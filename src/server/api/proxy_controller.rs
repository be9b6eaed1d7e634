use axum::{
    Router,
    body::Bytes,
    http::{HeaderMap, Method},
    response::Response,
    routing::any,
};

use crate::server::{
    error::AppResult,
    extractors::ProxyTarget,
    services::pipeline_services::{ProxyRequest, proxy_request},
};

pub struct ProxyController;

impl ProxyController {
    /// `/?url=`, `/base64/{*encoded}`, and the raw path form as the fallback for anything the
    /// other controllers don't claim. OPTIONS never gets here, the cors layer answers it.
    pub fn app() -> Router {
        Router::new()
            .route("/", any(Self::proxy))
            .route("/base64/{*encoded}", any(Self::proxy))
            .fallback(Self::proxy)
    }

    async fn proxy(
        ProxyTarget(target, services): ProxyTarget,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
    ) -> AppResult<Response> {
        proxy_request(
            &services,
            ProxyRequest {
                target,
                method,
                headers,
                body,
            },
        )
        .await
    }
}
