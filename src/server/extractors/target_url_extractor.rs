use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::debug;
use url::Url;

use crate::server::error::Error;
use crate::server::services::proxy_services::ProxyServices;
use crate::server::utils::url_utils::{decode_base64_url, target_from_raw_path, validate_target_url};

const BASE64_PREFIX: &str = "/base64/";

/// The validated upstream target of a proxy request plus the services to fetch it with.
///
/// Accepts all three ways players hand us a target:
/// `?url=<encoded>`, `/base64/<encoded>` and the raw `/<absolute url>` path form.
pub struct ProxyTarget(pub Url, pub ProxyServices);

/// the unvalidated target string carried by a request, if any
pub fn raw_target(path: &str, query: Option<&str>) -> Result<Option<String>, Error> {
    if path.is_empty() || path == "/" {
        return Ok(query.and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "url")
                .map(|(_, v)| v.into_owned())
        }));
    }

    if let Some(encoded) = path.strip_prefix(BASE64_PREFIX) {
        return decode_base64_url(encoded)
            .map(Some)
            .map_err(|e| Error::validation(e, None));
    }

    Ok(target_from_raw_path(path, query))
}

impl<S> FromRequestParts<S> for ProxyTarget
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(services): Extension<ProxyServices> =
            Extension::from_request_parts(parts, state)
                .await
                .map_err(|err| Error::InternalServerErrorWithContext(err.to_string()))?;

        let raw = raw_target(parts.uri.path(), parts.uri.query())?;
        debug!("proxy target: {:?}", raw);

        let url = validate_target_url(
            raw.as_deref(),
            services.config.max_url_length,
            &services.config.allowed_domains,
        )
        .map_err(|e| Error::validation(e, raw.clone()))?;

        Ok(ProxyTarget(url, services))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_targets() {
        let raw = raw_target("/", Some("url=https%3A%2F%2Fcdn.example%2Fa.m3u8%3Ft%3D1")).unwrap();
        assert_eq!(raw.as_deref(), Some("https://cdn.example/a.m3u8?t=1"));
        assert_eq!(raw_target("", None).unwrap(), None);
    }

    #[test]
    fn base64_targets() {
        // https://cdn.example/a.m3u8
        let raw = raw_target("/base64/aHR0cHM6Ly9jZG4uZXhhbXBsZS9hLm0zdTg", None).unwrap();
        assert_eq!(raw.as_deref(), Some("https://cdn.example/a.m3u8"));

        assert!(matches!(
            raw_target("/base64/%%%", None),
            Err(Error::BadRequest { .. })
        ));
    }

    #[test]
    fn raw_path_targets_keep_their_query() {
        let raw = raw_target("/https://cdn.example/seg.ts", Some("token=abc")).unwrap();
        assert_eq!(raw.as_deref(), Some("https://cdn.example/seg.ts?token=abc"));
    }
}
