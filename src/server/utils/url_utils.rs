// target url validation plus the reversible encodings we hand out to players
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Validate a client supplied target and return it normalized. Pure check, no io.
///
/// An empty `allowed_domains` disables the allow-list, otherwise the host has to equal an
/// entry or be a subdomain of one.
pub fn validate_target_url(
    raw: Option<&str>,
    max_length: usize,
    allowed_domains: &[String],
) -> Result<Url, ValidationError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::new("Missing URL parameter"))?;

    if raw.len() > max_length {
        return Err(ValidationError::new(format!(
            "URL exceeds maximum length of {} characters",
            max_length
        )));
    }

    let url = Url::parse(raw).map_err(|e| ValidationError::new(format!("Invalid URL format: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::new(
            "Only HTTP and HTTPS protocols are allowed",
        ));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ValidationError::new("URL must include a host"))?
        .to_ascii_lowercase();

    let allowed = allowed_domains
        .iter()
        .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>();

    if !allowed.is_empty()
        && !allowed
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    {
        return Err(ValidationError::new(format!("Domain not allowed: {}", host)));
    }

    Ok(url)
}

/// `<proxy_base>?url=<percent encoded absolute url>`
pub fn encode_proxy_url(proxy_base: &str, absolute_url: &str) -> String {
    format!("{}?url={}", proxy_base, urlencoding::encode(absolute_url))
}

/// reverse of [`encode_proxy_url`], returns the embedded target if there is one
pub fn decode_proxy_url(proxy_url: &str) -> Option<String> {
    let (_, query) = proxy_url.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned())
}

/// decode a base64 path segment, both alphabets and optional padding are accepted since players
/// and scripts don't agree on any of it
pub fn decode_base64_url(encoded: &str) -> Result<String, ValidationError> {
    let trimmed = encoded.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(ValidationError::new("Missing encoded URL"));
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| ValidationError::new(format!("Invalid base64 encoded URL: {}", e)))?;

    String::from_utf8(bytes)
        .map_err(|_| ValidationError::new("Invalid base64 encoded URL: not UTF-8"))
}

/// url safe, unpadded. Same shape the image route expects back
pub fn encode_image_url(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Rebuild a target out of a raw path like `/https://cdn.example/a.m3u8`.
///
/// The query string belongs to the target. Collapsed scheme slashes (`https:/host`) are
/// repaired and a missing scheme defaults to https.
pub fn target_from_raw_path(path: &str, query: Option<&str>) -> Option<String> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }

    // only a fully escaped target gets decoded, anything else keeps its own escapes intact
    let escaped = path.to_ascii_lowercase();
    let decoded = if escaped.starts_with("http%3a") || escaped.starts_with("https%3a") {
        urlencoding::decode(path)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| path.to_string())
    } else {
        path.to_string()
    };

    let lower = decoded.to_ascii_lowercase();
    let mut target = if lower.starts_with("http://") || lower.starts_with("https://") {
        decoded
    } else if lower.starts_with("http:/") || lower.starts_with("https:/") {
        decoded.replacen(":/", "://", 1)
    } else {
        format!("https://{}", decoded)
    };

    if let Some(q) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(q);
    }

    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_and_bad_schemes() {
        assert_eq!(
            validate_target_url(None, 2048, &[]).unwrap_err().reason,
            "Missing URL parameter"
        );
        assert_eq!(
            validate_target_url(Some("   "), 2048, &[]).unwrap_err().reason,
            "Missing URL parameter"
        );
        assert_eq!(
            validate_target_url(Some("ftp://cdn.example/a.ts"), 2048, &[])
                .unwrap_err()
                .reason,
            "Only HTTP and HTTPS protocols are allowed"
        );
        assert!(validate_target_url(Some("not a url"), 2048, &[]).is_err());
    }

    #[test]
    fn enforces_length() {
        let long = format!("https://cdn.example/{}", "a".repeat(100));
        let err = validate_target_url(Some(&long), 50, &[]).unwrap_err();
        assert!(err.reason.contains("maximum length of 50"));
    }

    #[test]
    fn allow_list_matches_subdomains() {
        let allowed = vec!["cdn.example".to_string()];
        assert!(validate_target_url(Some("https://cdn.example/a"), 2048, &allowed).is_ok());
        assert!(validate_target_url(Some("https://edge1.CDN.example/a"), 2048, &allowed).is_ok());

        let err = validate_target_url(Some("https://evilcdn.example/a"), 2048, &allowed).unwrap_err();
        assert_eq!(err.reason, "Domain not allowed: evilcdn.example");
    }

    #[test]
    fn proxy_url_round_trips_with_query() {
        let target = "https://cdn.example/path/seg 1.ts?token=a+b&exp=10#frag";
        let encoded = encode_proxy_url("/proxy", target);
        assert!(encoded.starts_with("/proxy?url=https%3A%2F%2F"));
        assert_eq!(decode_proxy_url(&encoded).as_deref(), Some(target));
    }

    #[test]
    fn base64_accepts_both_alphabets() {
        let url = "https://cdn.example/hls/master.m3u8?a=1&b=~x";
        let std = base64::engine::general_purpose::STANDARD.encode(url);
        let safe = encode_image_url(url);

        assert_eq!(decode_base64_url(&std).unwrap(), url);
        assert_eq!(decode_base64_url(&safe).unwrap(), url);
        assert!(decode_base64_url("%%%").is_err());
    }

    #[test]
    fn raw_paths() {
        assert_eq!(
            target_from_raw_path("/https://cdn.example/a.m3u8", Some("x=1")).as_deref(),
            Some("https://cdn.example/a.m3u8?x=1")
        );
        assert_eq!(
            target_from_raw_path("/https:/cdn.example/a.ts", None).as_deref(),
            Some("https://cdn.example/a.ts")
        );
        assert_eq!(
            target_from_raw_path("/cdn.example/a.ts", None).as_deref(),
            Some("https://cdn.example/a.ts")
        );
        assert_eq!(target_from_raw_path("/", None), None);
    }
}
