// fetch -> classify -> decompress -> rewrite -> cache -> respond, one request at a time
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::time::timeout_at;
use tracing::{debug, info, warn};
use url::Url;

use crate::server::error::{AppResult, Error};
use crate::server::services::proxy_services::ProxyServices;
use crate::server::services::response_cache_services::{CacheEntry, DynResponseCacheService, cache_key};
use crate::server::services::upstream_services::{UpstreamRequest, UpstreamResponse, build_upstream_headers};
use crate::server::utils::compression_utils::{CompressionError, ContentEncoding};
use crate::server::utils::content_utils::{
    HLS_MIME, RewriteKind, SNIFF_LEN, VTT_MIME, determine_content_type, is_media_segment_url, is_obfuscated,
    rewrite_kind, sniff,
};
use crate::server::utils::manifest_utils::{RewriteOptions, rewrite_manifest};
use crate::server::utils::range_utils::parse_range;
use crate::server::utils::subtitle_utils::rewrite_subtitles;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";
const IMAGE_ACCEPT_ENCODING: &str = "gzip, deflate, br, zstd";
const IMAGE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

// the only upstream response headers a client gets to see
const FORWARDED_RESPONSE_HEADERS: [HeaderName; 9] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::CACHE_CONTROL,
    header::EXPIRES,
    header::LAST_MODIFIED,
    header::ETAG,
    header::VARY,
];

/// Everything about an upstream response the plan depends on, known before the body is read
/// (apart from the leading chunk used for obfuscation checks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTraits {
    pub status: StatusCode,
    /// `None` when the origin used an encoding we can't decode
    pub encoding: Option<ContentEncoding>,
    pub rewrite: Option<RewriteKind>,
    pub obfuscated: bool,
    pub content_length: Option<u64>,
    pub has_body: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingPlan {
    /// compressed playlist or subtitles: buffer, decompress on the pool, rewrite
    DecompressAndRewrite(RewriteKind),
    /// plain text playlist or subtitles: buffer and rewrite
    Rewrite(RewriteKind),
    /// compressed body that doesn't need rewriting: buffer and decompress
    Decompress,
    /// claims a compression that was never applied, bytes and the claimed encoding go out as is
    Verbatim,
    /// stream straight through
    Passthrough,
    /// HEAD, 204, 304
    Empty,
}

/// The single place that decides how a response body is handled.
pub fn decide(traits: &ResponseTraits, stream_size_threshold: u64) -> ProcessingPlan {
    if !traits.has_body {
        return ProcessingPlan::Empty;
    }
    // partial content is forwarded untouched, decoding a slice of a gzip stream can't work
    if traits.status == StatusCode::PARTIAL_CONTENT {
        return ProcessingPlan::Passthrough;
    }
    let Some(encoding) = traits.encoding else {
        return ProcessingPlan::Passthrough;
    };
    if traits.obfuscated {
        return ProcessingPlan::Verbatim;
    }
    if let Some(kind) = traits.rewrite {
        return if encoding.is_compressed() {
            ProcessingPlan::DecompressAndRewrite(kind)
        } else {
            ProcessingPlan::Rewrite(kind)
        };
    }
    if traits
        .content_length
        .is_some_and(|len| len > stream_size_threshold)
    {
        return ProcessingPlan::Passthrough;
    }
    if encoding.is_compressed() {
        ProcessingPlan::Decompress
    } else {
        ProcessingPlan::Passthrough
    }
}

pub struct ProxyRequest {
    pub target: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct Outcome {
    response: Response,
    bytes_out: u64,
}

/// Copies chunks into a side buffer while they stream to the client and stores the whole body
/// once the upstream finishes cleanly. Gives up on the copy (never the stream) past `limit`.
struct CacheTee {
    inner: BoxStream<'static, Result<Bytes, io::Error>>,
    buffer: Option<BytesMut>,
    limit: usize,
    expected_len: Option<u64>,
    cache: DynResponseCacheService,
    key: String,
    content_type: Option<String>,
}

impl Stream for CacheTee {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(buffer) = this.buffer.as_mut() {
                    if buffer.len() + chunk.len() > this.limit {
                        this.buffer = None;
                    } else {
                        buffer.extend_from_slice(&chunk);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.buffer = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(buffer) = this.buffer.take() {
                    // a short read means the upstream cut us off, don't keep half a segment
                    if this
                        .expected_len
                        .is_none_or(|len| len == buffer.len() as u64)
                    {
                        this.cache
                            .set(&this.key, buffer.freeze(), this.content_type.take());
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn header_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}

/// Upstream headers that survive the hop. `content-length` only when the bytes are untouched,
/// `content-encoding` only when they are still encoded.
fn forwarded_headers(upstream: &HeaderMap, body_untouched: bool, keep_encoding: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for name in FORWARDED_RESPONSE_HEADERS.iter() {
        if !body_untouched && *name == header::CONTENT_LENGTH {
            continue;
        }
        for value in upstream.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    if keep_encoding {
        if let Some(encoding) = upstream.get(header::CONTENT_ENCODING) {
            headers.insert(header::CONTENT_ENCODING, encoding.clone());
        }
    }

    headers
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().extend(headers);
    response
}

/// Serve a cache entry, sliced when the client asked for a valid byte range.
pub fn cached_response(entry: &CacheEntry, range: Option<&str>, url: &str) -> (Response, u64) {
    let total = entry.len();
    let mut headers = HeaderMap::new();

    let content_type = entry
        .content_type
        .clone()
        .or_else(|| determine_content_type(&entry.body, None, url));
    if let Some(value) = content_type.as_deref().and_then(header_value) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    match range.and_then(|r| parse_range(r, total)) {
        Some(range) => {
            debug!("cache hit, serving {} of {} bytes", range.content_range(total), total);
            if let Some(value) = header_value(&range.content_range(total)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            let slice = entry.body.slice(range.start..=range.end);
            let len = slice.len() as u64;
            (
                build_response(StatusCode::PARTIAL_CONTENT, headers, Body::from(slice)),
                len,
            )
        }
        None => (
            build_response(StatusCode::OK, headers, Body::from(entry.body.clone())),
            total as u64,
        ),
    }
}

/// per request state shared by every branch
struct Exchange<'a> {
    services: &'a ProxyServices,
    url: Url,
    is_get: bool,
    // only set for GETs without a range, those are the only cacheable requests
    cache_key: Option<String>,
    deadline: tokio::time::Instant,
    timeout_ms: u64,
}

impl Exchange<'_> {
    fn url_str(&self) -> &str {
        self.url.as_str()
    }

    fn read_failed(&self, e: io::Error) -> Error {
        Error::Fetch {
            message: format!("Failed to read upstream body: {}", e),
            url: self.url.to_string(),
        }
    }

    fn timed_out(&self) -> Error {
        Error::UpstreamTimeout {
            timeout_ms: self.timeout_ms,
            url: self.url.to_string(),
        }
    }

    async fn collect(&self, mut body: BoxStream<'static, Result<Bytes, io::Error>>) -> AppResult<Bytes> {
        let read = async {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = body.next().await {
                buffer.extend_from_slice(&chunk?);
            }
            Ok::<_, io::Error>(buffer.freeze())
        };

        match timeout_at(self.deadline, read).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(self.read_failed(e)),
            Err(_) => Err(self.timed_out()),
        }
    }

    /// Leading bytes for signature checks, put back in front of the stream afterwards. Reads
    /// as many chunks as it takes to fill the sniff window, reads can end on any byte.
    async fn peek(
        &self,
        mut body: BoxStream<'static, Result<Bytes, io::Error>>,
    ) -> AppResult<(Bytes, BoxStream<'static, Result<Bytes, io::Error>>)> {
        let read = async {
            let mut buffer = BytesMut::new();
            let mut finished = false;
            while buffer.len() < SNIFF_LEN {
                match body.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => {
                        finished = true;
                        break;
                    }
                }
            }
            Ok::<_, io::Error>((buffer.freeze(), finished))
        };

        let (buffered, finished) = match timeout_at(self.deadline, read).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => return Err(self.read_failed(e)),
            Err(_) => return Err(self.timed_out()),
        };

        let head = buffered.slice(..buffered.len().min(SNIFF_LEN));
        let rebuilt = match (buffered.is_empty(), finished) {
            (true, true) => stream::empty().boxed(),
            (false, true) => stream::once(async move { Ok(buffered) }).boxed(),
            (true, false) => body,
            (false, false) => stream::once(async move { Ok(buffered) }).chain(body).boxed(),
        };
        Ok((head, rebuilt))
    }

    async fn decompress(&self, encoding: ContentEncoding, raw: Bytes) -> Result<Bytes, CompressionError> {
        if !encoding.is_compressed() {
            return Ok(raw);
        }
        let started = Instant::now();
        let result = self.services.decompression.decompress(encoding, raw).await;

        // worker results land back here before anything shared is touched
        match &result {
            Ok(done) => self.services.metrics.record_worker_task(done.duration, true),
            Err(_) => self
                .services
                .metrics
                .record_worker_task(started.elapsed(), false),
        }

        result.map(|done| done.body)
    }

    /// `None` leaves the body as it is (not utf-8, or a playlist without #EXTM3U)
    fn rewrite(&self, kind: RewriteKind, body: &[u8]) -> Option<String> {
        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                warn!("{} isn't utf-8 ({}), serving it unmodified", self.url, e);
                return None;
            }
        };
        let proxy_base = self.services.config.normalized_proxy_base();

        match kind {
            RewriteKind::Manifest => {
                let rewritten = rewrite_manifest(
                    text,
                    &self.url,
                    RewriteOptions {
                        proxy_base: &proxy_base,
                        preserve_query_params: true,
                    },
                );
                if !rewritten.has_header {
                    warn!("{} has no #EXTM3U header, serving it unmodified", self.url);
                    return None;
                }
                debug!("rewrote {} uris in {}", rewritten.rewritten_uris, self.url);
                Some(rewritten.text)
            }
            RewriteKind::Subtitle => Some(rewrite_subtitles(text, &self.url, &proxy_base)),
        }
    }

    fn store(&self, status: StatusCode, body: &Bytes, content_type: Option<&str>) {
        if status != StatusCode::OK {
            return;
        }
        if let Some(key) = &self.cache_key {
            if self
                .services
                .cache
                .set(key, body.clone(), content_type.map(str::to_string))
            {
                debug!("cached {} ({} bytes)", self.url, body.len());
            }
        }
    }

    /// headers every proxied response gets
    fn decorate(&self, headers: &mut HeaderMap, content_type: Option<&str>) {
        if self.is_get {
            headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
        }
        let audio = content_type.is_some_and(|ct| ct.starts_with("audio/"));
        if (audio || is_media_segment_url(self.url_str())) && !headers.contains_key(header::ACCEPT_RANGES) {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
    }

    fn buffered(&self, status: StatusCode, mut headers: HeaderMap, content_type: Option<String>, body: Bytes) -> Outcome {
        if let Some(value) = content_type.as_deref().and_then(header_value) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        self.decorate(&mut headers, content_type.as_deref());

        let bytes_out = body.len() as u64;
        Outcome {
            response: build_response(status, headers, Body::from(body)),
            bytes_out,
        }
    }

    /// Raw upstream bytes with the original encoding. Where every failed processing branch
    /// ends up, never cached.
    fn degraded(&self, upstream_status: StatusCode, upstream_headers: &HeaderMap, raw: Bytes) -> Outcome {
        let headers = forwarded_headers(upstream_headers, true, true);
        let content_type = upstream_headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.buffered(upstream_status, headers, content_type, raw)
    }

    /// A playlist or subtitle track served with a content-encoding that was never applied.
    /// The raw bytes are rewritten like an uncompressed body and go out without the encoding.
    fn plain_text_rewrite(&self, status: StatusCode, upstream_headers: &HeaderMap, raw: &Bytes) -> Option<Outcome> {
        let kind = match sniff(&raw[..raw.len().min(SNIFF_LEN)]) {
            Some(HLS_MIME) => RewriteKind::Manifest,
            Some(VTT_MIME) => RewriteKind::Subtitle,
            _ => return None,
        };
        let body = Bytes::from(self.rewrite(kind, raw)?);

        let headers = forwarded_headers(upstream_headers, false, false);
        self.store(status, &body, Some(kind.mime()));
        Some(self.buffered(status, headers, Some(kind.mime().to_string()), body))
    }

    async fn rewrite_branch(&self, upstream: UpstreamResponse, kind: RewriteKind, encoding: ContentEncoding) -> AppResult<Outcome> {
        let UpstreamResponse {
            status,
            headers: upstream_headers,
            body,
        } = upstream;
        let raw = self.collect(body).await?;

        let decoded = match self.decompress(encoding, raw.clone()).await {
            Ok(decoded) => decoded,
            Err(e) => {
                if let Some(outcome) = self.plain_text_rewrite(status, &upstream_headers, &raw) {
                    warn!(
                        "{} claims {} but is plain text ({}), rewrote it as is",
                        self.url,
                        encoding.as_header_value(),
                        e
                    );
                    return Ok(outcome);
                }
                warn!("failed to decompress {}: {}, sending it as received", self.url, e);
                return Ok(self.degraded(status, &upstream_headers, raw));
            }
        };

        let headers = forwarded_headers(&upstream_headers, false, false);
        match self.rewrite(kind, &decoded) {
            Some(text) => {
                let body = Bytes::from(text);
                self.store(status, &body, Some(kind.mime()));
                Ok(self.buffered(status, headers, Some(kind.mime().to_string()), body))
            }
            None => Ok(self.buffered(status, headers, Some(kind.mime().to_string()), decoded)),
        }
    }

    async fn decompress_branch(&self, upstream: UpstreamResponse, encoding: ContentEncoding) -> AppResult<Outcome> {
        let UpstreamResponse {
            status,
            headers: upstream_headers,
            body,
        } = upstream;
        let raw = self.collect(body).await?;

        let decoded = match self.decompress(encoding, raw.clone()).await {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("failed to decompress {}: {}, sending it as received", self.url, e);
                return Ok(self.degraded(status, &upstream_headers, raw));
            }
        };

        let headers = forwarded_headers(&upstream_headers, false, false);

        // some origins serve playlists from paths with no extension and a generic type
        if sniff(&decoded[..decoded.len().min(SNIFF_LEN)]) == Some(HLS_MIME) {
            if let Some(text) = self.rewrite(RewriteKind::Manifest, &decoded) {
                let body = Bytes::from(text);
                self.store(status, &body, Some(HLS_MIME));
                return Ok(self.buffered(status, headers, Some(HLS_MIME.to_string()), body));
            }
        }

        let declared = upstream_headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let content_type = determine_content_type(&decoded, declared, self.url_str());
        self.store(status, &decoded, content_type.as_deref());
        Ok(self.buffered(status, headers, content_type, decoded))
    }

    async fn passthrough_branch(&self, upstream: UpstreamResponse, cacheable: bool) -> AppResult<Outcome> {
        let UpstreamResponse {
            status,
            headers: upstream_headers,
            body,
        } = upstream;
        let content_length = upstream_headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let declared = upstream_headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cache_key = self.cache_key.clone().filter(|_| cacheable && status == StatusCode::OK);

        if !self.services.config.enable_streaming {
            let body = self.collect(body).await?;
            let headers = forwarded_headers(&upstream_headers, true, true);
            let content_type = if cacheable {
                determine_content_type(&body, declared.as_deref(), self.url_str())
            } else {
                declared
            };
            if cache_key.is_some() {
                self.store(status, &body, content_type.as_deref());
            }
            return Ok(self.buffered(status, headers, content_type, body));
        }

        if self
            .services
            .metrics
            .record_streaming_request(content_length.unwrap_or(0))
        {
            info!(
                "streaming {} bytes from {}",
                content_length.unwrap_or(0),
                self.url
            );
        }

        let max_entry = self.services.config.cache_max_entry_bytes;
        let body = match cache_key {
            Some(key) if content_length.is_none_or(|len| len <= max_entry as u64) => CacheTee {
                inner: body,
                buffer: Some(BytesMut::with_capacity(
                    content_length.unwrap_or(0).min(max_entry as u64) as usize,
                )),
                limit: max_entry,
                expected_len: content_length,
                cache: self.services.cache.clone(),
                key,
                content_type: declared.clone(),
            }
            .boxed(),
            _ => body,
        };

        let mut headers = forwarded_headers(&upstream_headers, true, true);
        headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
        self.decorate(&mut headers, declared.as_deref());

        Ok(Outcome {
            response: build_response(status, headers, Body::from_stream(body)),
            bytes_out: content_length.unwrap_or(0),
        })
    }

    async fn run(&self, request: ProxyRequest) -> AppResult<Outcome> {
        let services = self.services;

        let headers = build_upstream_headers(&request.headers, &self.url, &services.header_rules);
        let body = match request.method {
            Method::GET | Method::HEAD | Method::OPTIONS => None,
            _ => Some(request.body),
        };
        let is_head = request.method == Method::HEAD;

        let upstream = services
            .upstream
            .fetch(UpstreamRequest {
                method: request.method,
                url: self.url.clone(),
                headers,
                body,
            })
            .await?;

        if upstream.status.is_client_error() || upstream.status.is_server_error() {
            let status = upstream.status;
            let content_type = upstream
                .header_str(&header::CONTENT_TYPE)
                .map(str::to_string);
            // the error body is best effort, the status is what matters
            let body = self.collect(upstream.body).await.unwrap_or_default();
            warn!("{} answered {}", self.url, status);
            return Err(Error::Upstream {
                status,
                content_type,
                body,
            });
        }

        let declared_type = upstream
            .header_str(&header::CONTENT_TYPE)
            .map(str::to_string);
        let encoding = match upstream.header_str(&header::CONTENT_ENCODING) {
            Some(value) => ContentEncoding::from_header(value),
            None => Some(ContentEncoding::Identity),
        };
        let has_body = !is_head
            && upstream.status != StatusCode::NO_CONTENT
            && upstream.status != StatusCode::NOT_MODIFIED;

        let mut upstream = upstream;
        let mut head = Bytes::new();
        if has_body
            && upstream.status != StatusCode::PARTIAL_CONTENT
            && encoding.is_some_and(|e| e.is_compressed())
        {
            let body = std::mem::replace(&mut upstream.body, stream::empty().boxed());
            let (peeked, rebuilt) = self.peek(body).await?;
            upstream.body = rebuilt;
            head = peeked;
        }

        let traits = ResponseTraits {
            status: upstream.status,
            encoding,
            rewrite: rewrite_kind(self.url_str(), declared_type.as_deref()),
            obfuscated: encoding.is_some_and(|e| {
                is_obfuscated(self.url_str(), declared_type.as_deref(), e, &head)
            }),
            content_length: upstream.content_length(),
            has_body,
        };
        let plan = decide(&traits, services.config.stream_size_threshold);
        debug!("{} -> {:?} ({:?})", self.url, plan, traits);

        match plan {
            ProcessingPlan::Empty => {
                let mut headers = forwarded_headers(&upstream.headers, true, true);
                self.decorate(&mut headers, declared_type.as_deref());
                Ok(Outcome {
                    response: build_response(upstream.status, headers, Body::empty()),
                    bytes_out: 0,
                })
            }
            ProcessingPlan::Verbatim => {
                warn!(
                    "{} claims {} but the bytes say otherwise, passing it through untouched",
                    self.url,
                    encoding.map(|e| e.as_header_value()).unwrap_or("unknown")
                );
                self.passthrough_branch(upstream, false).await
            }
            ProcessingPlan::Passthrough => {
                let cacheable = traits.status == StatusCode::OK
                    && encoding == Some(ContentEncoding::Identity);
                self.passthrough_branch(upstream, cacheable).await
            }
            ProcessingPlan::Decompress => {
                let encoding = encoding.unwrap_or(ContentEncoding::Identity);
                self.decompress_branch(upstream, encoding).await
            }
            ProcessingPlan::Rewrite(kind) => {
                self.rewrite_branch(upstream, kind, ContentEncoding::Identity)
                    .await
            }
            ProcessingPlan::DecompressAndRewrite(kind) => {
                let encoding = encoding.unwrap_or(ContentEncoding::Identity);
                self.rewrite_branch(upstream, kind, encoding).await
            }
        }
    }
}

fn deadline(services: &ProxyServices) -> tokio::time::Instant {
    tokio::time::Instant::now()
        + std::time::Duration::from_millis(services.config.request_timeout_ms)
}

/// Run one proxied request through the whole pipeline.
pub async fn proxy_request(services: &ProxyServices, request: ProxyRequest) -> AppResult<Response> {
    let started = services.metrics.record_request();
    let bytes_in = request.body.len() as u64;
    let is_get = request.method == Method::GET;
    let range = request
        .headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let key = is_get.then(|| cache_key(request.target.as_str(), &request.headers));
    if let Some(key) = key.as_deref() {
        if let Some(entry) = services.cache.get(key) {
            services.metrics.record_cache_hit();
            let (response, bytes_out) = cached_response(&entry, range.as_deref(), request.target.as_str());
            services
                .metrics
                .record_response(started, true, bytes_in, bytes_out);
            return Ok(response);
        }
        services.metrics.record_cache_miss();
    }

    let exchange = Exchange {
        services,
        url: request.target.clone(),
        is_get,
        cache_key: key.filter(|_| range.is_none()),
        deadline: deadline(services),
        timeout_ms: services.config.request_timeout_ms,
    };

    match exchange.run(request).await {
        Ok(outcome) => {
            services
                .metrics
                .record_response(started, true, bytes_in, outcome.bytes_out);
            Ok(outcome.response)
        }
        Err(e) => {
            services.metrics.record_response(started, false, bytes_in, 0);
            Err(e)
        }
    }
}

fn image_headers(content_type: &str, cache_status: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = header_value(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(IMAGE_CACHE_CONTROL));
    headers.insert(X_CACHE, HeaderValue::from_static(cache_status));
    headers
}

/// Fetch an image for `<img>` tags, cached separately from the stream proxy and served with a
/// year long cache lifetime.
pub async fn proxy_image(services: &ProxyServices, url: Url) -> AppResult<Response> {
    let started = services.metrics.record_request();
    let result = fetch_image(services, url).await;

    match &result {
        Ok((_, bytes_out)) => services.metrics.record_response(started, true, 0, *bytes_out),
        Err(_) => services.metrics.record_response(started, false, 0, 0),
    }
    result.map(|(response, _)| response)
}

async fn fetch_image(services: &ProxyServices, url: Url) -> AppResult<(Response, u64)> {
    let mut client_headers = HeaderMap::new();
    client_headers.insert(header::ACCEPT, HeaderValue::from_static(IMAGE_ACCEPT));
    client_headers.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static(IMAGE_ACCEPT_ENCODING),
    );

    let mut key_headers = HeaderMap::new();
    key_headers.insert(header::ACCEPT, HeaderValue::from_static("image/*"));
    let key = cache_key(url.as_str(), &key_headers);

    if let Some(entry) = services.cache.get(&key) {
        services.metrics.record_cache_hit();
        let content_type = entry
            .content_type
            .clone()
            .unwrap_or_else(|| "image/jpeg".to_string());
        let bytes_out = entry.len() as u64;
        return Ok((
            build_response(
                StatusCode::OK,
                image_headers(&content_type, "HIT"),
                Body::from(entry.body.clone()),
            ),
            bytes_out,
        ));
    }
    services.metrics.record_cache_miss();

    let mut headers = build_upstream_headers(&client_headers, &url, &services.header_rules);
    // the rule overlay sets accept to */*, images want their own
    headers.insert(header::ACCEPT, HeaderValue::from_static(IMAGE_ACCEPT));

    let exchange = Exchange {
        services,
        url: url.clone(),
        is_get: true,
        cache_key: Some(key),
        deadline: deadline(services),
        timeout_ms: services.config.request_timeout_ms,
    };

    let upstream = services
        .upstream
        .fetch(UpstreamRequest {
            method: Method::GET,
            url: url.clone(),
            headers,
            body: None,
        })
        .await?;

    if !upstream.status.is_success() {
        let status = upstream.status;
        return Err(Error::ImageFetch {
            status: if status.is_client_error() || status.is_server_error() {
                status
            } else {
                StatusCode::BAD_GATEWAY
            },
            reason: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
            url: url.to_string(),
        });
    }

    let declared = upstream
        .header_str(&header::CONTENT_TYPE)
        .map(str::to_string);
    let encoding = upstream
        .header_str(&header::CONTENT_ENCODING)
        .map(ContentEncoding::from_header)
        .unwrap_or(Some(ContentEncoding::Identity));
    let status = upstream.status;
    let raw = exchange.collect(upstream.body).await?;

    let body = match encoding {
        Some(encoding) if encoding.is_compressed() => {
            match exchange.decompress(encoding, raw.clone()).await {
                Ok(decoded) => decoded,
                // no raw fallback here, a broken body would sit in browser caches for a year
                Err(e) => {
                    warn!("failed to decompress image {}: {}", url, e);
                    return Err(Error::Processing {
                        message: format!("Failed to decode image: {}", e),
                        url: url.to_string(),
                    });
                }
            }
        }
        _ => raw,
    };

    let content_type = sniff(&body[..body.len().min(SNIFF_LEN)])
        .filter(|mime| mime.starts_with("image/"))
        .map(str::to_string)
        .or_else(|| declared.filter(|ct| ct.starts_with("image/")))
        .unwrap_or_else(|| "image/jpeg".to_string());

    exchange.store(status, &body, Some(&content_type));

    let bytes_out = body.len() as u64;
    Ok((
        build_response(status, image_headers(&content_type, "MISS"), Body::from(body)),
        bytes_out,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::services::response_cache_services::{ResponseCacheService, ResponseCacheServiceTrait};

    fn traits() -> ResponseTraits {
        ResponseTraits {
            status: StatusCode::OK,
            encoding: Some(ContentEncoding::Identity),
            rewrite: None,
            obfuscated: false,
            content_length: Some(1000),
            has_body: true,
        }
    }

    const THRESHOLD: u64 = 1024 * 1024;

    #[test]
    fn compressed_playlists_are_decompressed_then_rewritten() {
        let t = ResponseTraits {
            encoding: Some(ContentEncoding::Gzip),
            rewrite: Some(RewriteKind::Manifest),
            ..traits()
        };
        assert_eq!(decide(&t, THRESHOLD), ProcessingPlan::DecompressAndRewrite(RewriteKind::Manifest));
    }

    #[test]
    fn plain_subtitles_are_only_rewritten() {
        let t = ResponseTraits {
            rewrite: Some(RewriteKind::Subtitle),
            ..traits()
        };
        assert_eq!(decide(&t, THRESHOLD), ProcessingPlan::Rewrite(RewriteKind::Subtitle));
    }

    #[test]
    fn compressed_segments_are_decompressed() {
        let t = ResponseTraits {
            encoding: Some(ContentEncoding::Zstd),
            ..traits()
        };
        assert_eq!(decide(&t, THRESHOLD), ProcessingPlan::Decompress);
    }

    #[test]
    fn obfuscated_bodies_go_out_verbatim() {
        let t = ResponseTraits {
            encoding: Some(ContentEncoding::Gzip),
            rewrite: Some(RewriteKind::Manifest),
            obfuscated: true,
            ..traits()
        };
        assert_eq!(decide(&t, THRESHOLD), ProcessingPlan::Verbatim);
    }

    #[test]
    fn large_bodies_stream_unless_they_need_rewriting() {
        let large = ResponseTraits {
            encoding: Some(ContentEncoding::Gzip),
            content_length: Some(THRESHOLD + 1),
            ..traits()
        };
        assert_eq!(decide(&large, THRESHOLD), ProcessingPlan::Passthrough);

        let large_playlist = ResponseTraits {
            rewrite: Some(RewriteKind::Manifest),
            ..large
        };
        assert_eq!(
            decide(&large_playlist, THRESHOLD),
            ProcessingPlan::DecompressAndRewrite(RewriteKind::Manifest)
        );
    }

    #[test]
    fn partial_content_unknown_encodings_and_empty_bodies() {
        let partial = ResponseTraits {
            status: StatusCode::PARTIAL_CONTENT,
            encoding: Some(ContentEncoding::Gzip),
            rewrite: Some(RewriteKind::Manifest),
            ..traits()
        };
        assert_eq!(decide(&partial, THRESHOLD), ProcessingPlan::Passthrough);

        let unknown = ResponseTraits {
            encoding: None,
            ..traits()
        };
        assert_eq!(decide(&unknown, THRESHOLD), ProcessingPlan::Passthrough);

        let empty = ResponseTraits {
            has_body: false,
            ..traits()
        };
        assert_eq!(decide(&empty, THRESHOLD), ProcessingPlan::Empty);

        assert_eq!(decide(&traits(), THRESHOLD), ProcessingPlan::Passthrough);
    }

    #[test]
    fn forwarded_headers_follow_the_body() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        upstream.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        upstream.insert(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        upstream.insert(header::ETAG, HeaderValue::from_static("\"e\""));

        let untouched = forwarded_headers(&upstream, true, true);
        assert_eq!(untouched[header::CONTENT_LENGTH], "10");
        assert_eq!(untouched[header::CONTENT_ENCODING], "gzip");
        assert!(untouched.get(header::SET_COOKIE).is_none());

        let decoded = forwarded_headers(&upstream, false, false);
        assert!(decoded.get(header::CONTENT_LENGTH).is_none());
        assert!(decoded.get(header::CONTENT_ENCODING).is_none());
        assert_eq!(decoded[header::ETAG], "\"e\"");
    }

    #[test]
    fn cache_hits_slice_valid_ranges() {
        let cache = ResponseCacheService::new(1024, 1024);
        cache.set("k", Bytes::from_static(b"0123456789abcdefghij"), Some("video/mp2t".into()));
        let entry = cache.get("k").unwrap();

        let (response, len) = cached_response(&entry, Some("bytes=0-9"), "https://a/seg.ts");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-9/20");
        assert_eq!(len, 10);

        let (response, len) = cached_response(&entry, Some("bytes=30-40"), "https://a/seg.ts");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(response.headers()[X_CACHE], "HIT");
        assert_eq!(len, 20);
    }

    #[tokio::test]
    async fn the_tee_stores_complete_bodies_only() {
        let cache: DynResponseCacheService = std::sync::Arc::new(ResponseCacheService::new(1024, 1024));
        let chunks = vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"def"))];

        let tee = CacheTee {
            inner: stream::iter(chunks).boxed(),
            buffer: Some(BytesMut::new()),
            limit: 1024,
            expected_len: Some(6),
            cache: cache.clone(),
            key: "full".to_string(),
            content_type: Some("video/mp2t".to_string()),
        };
        let sent: Vec<_> = tee.collect().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(&cache.get("full").unwrap().body[..], b"abcdef");

        let short = CacheTee {
            inner: stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed(),
            buffer: Some(BytesMut::new()),
            limit: 1024,
            expected_len: Some(6),
            cache: cache.clone(),
            key: "short".to_string(),
            content_type: None,
        };
        let _: Vec<_> = short.collect().await;
        assert!(cache.get("short").is_none());
    }
}
