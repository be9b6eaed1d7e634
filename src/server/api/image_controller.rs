use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::{HeaderMap, header},
    response::Response,
    routing::get,
};
use chrono::Utc;
use tracing::debug;

use crate::server::{
    dtos::image_dto::{EncodedImage, ImageEncodeQuery, ImageEncodeResponse},
    error::{AppResult, Error},
    services::{pipeline_services::proxy_image, proxy_services::ProxyServices},
    utils::url_utils::{decode_base64_url, encode_image_url, validate_target_url},
};

pub struct ImageController;

impl ImageController {
    pub fn app() -> Router {
        Router::new()
            .route("/image/encode", get(Self::encode))
            .route("/image/{encoded}", get(Self::image))
    }

    async fn image(
        Extension(services): Extension<ProxyServices>,
        Path(encoded): Path<String>,
    ) -> AppResult<Response> {
        let raw = decode_base64_url(&encoded).map_err(|e| Error::validation(e, None))?;
        let url = validate_target_url(
            Some(&raw),
            services.config.max_url_length,
            &services.config.allowed_domains,
        )
        .map_err(|e| Error::validation(e, Some(raw.clone())))?;

        proxy_image(&services, url).await
    }

    /// hands back the image route url for a target, for pages building `<img>` tags
    async fn encode(
        Extension(services): Extension<ProxyServices>,
        Query(query): Query<ImageEncodeQuery>,
        headers: HeaderMap,
    ) -> AppResult<Json<ImageEncodeResponse>> {
        let url = validate_target_url(
            query.url.as_deref(),
            services.config.max_url_length,
            &services.config.allowed_domains,
        )
        .map_err(|e| Error::validation(e, query.url.clone()))?;

        let original_url = url.to_string();
        let encoded_url = encode_image_url(&original_url);
        let proxied_url = format!("{}/{}", services.config.image_proxy_base(), encoded_url);
        let full_proxied_url = format!("{}{}", request_origin(&headers), proxied_url);
        debug!("encoded image url {} -> {}", original_url, proxied_url);

        Ok(Json(ImageEncodeResponse {
            success: true,
            data: EncodedImage {
                html_example: format!("<img src=\"{}\" alt=\"Proxied image\">", full_proxied_url),
                original_url,
                encoded_url,
                proxied_url,
                full_proxied_url,
            },
            timestamp: Utc::now(),
        }))
    }
}

/// scheme and host the client used to reach us, honoring a fronting proxy
fn request_origin(headers: &HeaderMap) -> String {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let scheme = value("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = value("x-forwarded-host")
        .or_else(|| value(header::HOST.as_str()))
        .unwrap_or_else(|| "localhost".to_string());

    format!("{}://{}", scheme, host)
}
