use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use mockall::automock;
use tracing::{debug, error, warn};
use url::Url;

use crate::server::error::{AppResult, Error};
use crate::server::services::header_resolver_services::HeaderResolverService;

pub type DynUpstreamService = Arc<dyn UpstreamServiceTrait + Send + Sync>;

// never forwarded, they describe the hop between the client and us
const EXCLUDED_HEADERS: [&str; 11] = [
    "host",
    "connection",
    "content-length",
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

// copied from the client last so no header rule can clobber them
const CONDITIONAL_HEADERS: [HeaderName; 4] = [
    header::RANGE,
    header::IF_RANGE,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
];

pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// status and headers are in, the body hasn't been read yet
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, std::io::Error>>,
}

impl UpstreamResponse {
    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(&header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }
}

#[automock]
#[async_trait]
pub trait UpstreamServiceTrait {
    /// Send the request and return once the response head is in. Body bytes are streamed from
    /// the returned response.
    async fn fetch(&self, request: UpstreamRequest) -> AppResult<UpstreamResponse>;
}

/// Outbound headers for `target`: the client's own headers minus hop headers, then the header
/// rule overlay, then `host`, then the conditional/range headers as the client sent them.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    target: &Url,
    resolver: &HeaderResolverService,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in client_headers.iter() {
        if !EXCLUDED_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    for (name, value) in resolver.headers_for(target) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("skipping unusable rule header {}: {}", name, value),
        }
    }

    let host = match target.port() {
        Some(port) => format!("{}:{}", target.host_str().unwrap_or_default(), port),
        None => target.host_str().unwrap_or_default().to_string(),
    };
    if let Ok(host) = HeaderValue::from_str(&host) {
        headers.insert(header::HOST, host);
    }

    for name in CONDITIONAL_HEADERS.iter() {
        if let Some(value) = client_headers.get(name) {
            headers.insert(name.clone(), value.clone());
        }
    }

    headers
}

pub struct UpstreamService {
    http: reqwest::Client,
    timeout: Duration,
}

impl UpstreamService {
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self, reqwest::Error> {
        if accept_invalid_certs {
            // SECURITY: some cdns redirect across certificate domains, this lets those through
            // at the cost of not verifying who we are talking to
            warn!("upstream tls certificate validation is DISABLED");
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl UpstreamServiceTrait for UpstreamService {
    async fn fetch(&self, request: UpstreamRequest) -> AppResult<UpstreamResponse> {
        let url = request.url.to_string();
        debug!("{} {}", request.method, url);

        let mut builder = self
            .http
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("upstream request to {} failed: {}", url, e);
                return Err(Error::Fetch {
                    message: format!("Failed to proxy request: {}", e),
                    url,
                });
            }
            // dropping the send future aborts the connection attempt
            Err(_) => {
                return Err(Error::UpstreamTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                    url,
                });
            }
        };

        debug!("{} answered {}", url, response.status());

        Ok(UpstreamResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://player.local"));
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        headers.insert(header::COOKIE, HeaderValue::from_static("a=1"));
        headers
    }

    #[test]
    fn assembles_outbound_headers() {
        let resolver = HeaderResolverService::built_in().unwrap();
        let target = Url::parse("https://video-edge.ttvnw.net:8443/v1/seg.ts").unwrap();
        let headers = build_upstream_headers(&client_headers(), &target, &resolver);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-forwarded-for").is_none());
        assert_eq!(headers[header::HOST], "video-edge.ttvnw.net:8443");
        assert_eq!(headers[header::ORIGIN], "https://www.twitch.tv");
        assert_eq!(headers[header::REFERER], "https://www.twitch.tv/");
        assert_eq!(headers[header::RANGE], "bytes=0-99");
        assert_eq!(headers[header::IF_NONE_MATCH], "\"abc\"");
        assert_eq!(headers[header::COOKIE], "a=1");
        assert_eq!(headers["sec-fetch-site"], "cross-site");
    }

    #[test]
    fn unmatched_hosts_use_their_own_origin() {
        let resolver = HeaderResolverService::built_in().unwrap();
        let target = Url::parse("http://media.example/a.m3u8").unwrap();
        let headers = build_upstream_headers(&HeaderMap::new(), &target, &resolver);

        assert_eq!(headers[header::HOST], "media.example");
        assert_eq!(headers[header::ORIGIN], "http://media.example");
        assert_eq!(headers[header::REFERER], "http://media.example/");
        assert!(headers.get(header::RANGE).is_none());
    }
}
