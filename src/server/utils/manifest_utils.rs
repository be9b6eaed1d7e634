// hls playlist rewriting, every uri in the playlist gets pointed back at the proxy
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::error;
use url::Url;

use super::url_utils::encode_proxy_url;

static URI_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"URI="([^"]*)""#).expect("URI attribute regex should compile"));

#[derive(Debug, Clone, Copy)]
pub struct RewriteOptions<'a> {
    pub proxy_base: &'a str,
    // keep the target's own query string (tokens, expiry) when re-encoding
    pub preserve_query_params: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLine<'a> {
    /// a bare segment / variant playlist reference
    Uri(&'a str),
    /// #EXT-X-KEY, #EXT-X-MAP, #EXT-X-MEDIA and friends carrying URI="..."
    TagWithUri(&'a str),
    Tag(&'a str),
    /// blank lines and plain comments
    Other(&'a str),
}

#[derive(Debug, Clone)]
pub struct RewrittenManifest {
    pub text: String,
    // false when the body never had #EXTM3U, the pipeline serves those untouched
    pub has_header: bool,
    pub rewritten_uris: usize,
}

pub fn classify_line(line: &str) -> ManifestLine<'_> {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        ManifestLine::Other(line)
    } else if trimmed.starts_with("#EXT") {
        if URI_ATTRIBUTE.is_match(trimmed) {
            ManifestLine::TagWithUri(line)
        } else {
            ManifestLine::Tag(line)
        }
    } else if trimmed.starts_with('#') {
        ManifestLine::Other(line)
    } else {
        ManifestLine::Uri(line)
    }
}

pub fn has_manifest_header(text: &str) -> bool {
    text.trim_start_matches('\u{feff}')
        .trim_start()
        .starts_with("#EXTM3U")
}

/// Resolve `uri` against the playlist's own url. Absolute http(s) references are kept byte for
/// byte, anything with another scheme (data:, skd:) is not ours to touch and returns `None`.
fn resolve_uri(base: &Url, uri: &str, preserve_query_params: bool) -> Option<String> {
    let lower = uri.to_ascii_lowercase();
    let absolute = if lower.starts_with("http://") || lower.starts_with("https://") {
        uri.to_string()
    } else {
        if let Ok(parsed) = Url::parse(uri) {
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return None;
            }
        }

        match base.join(uri) {
            Ok(resolved) => resolved.to_string(),
            Err(e) => {
                error!("Failed to resolve: {} - {}", uri, e);
                return None;
            }
        }
    };

    if preserve_query_params {
        Some(absolute)
    } else {
        Some(absolute.split('?').next().unwrap_or(&absolute).to_string())
    }
}

/// Rewrite every uri in a playlist to `<proxy_base>?url=<absolute>`.
///
/// Lines without a uri come back byte for byte and in the same order, line endings included.
pub fn rewrite_manifest(text: &str, source_url: &Url, options: RewriteOptions<'_>) -> RewrittenManifest {
    let mut rewritten_uris = 0;

    let lines: Vec<String> = text
        .split('\n')
        .map(|raw| {
            // keep \r so crlf playlists stay crlf
            let (line, cr) = match raw.strip_suffix('\r') {
                Some(stripped) => (stripped, "\r"),
                None => (raw, ""),
            };

            match classify_line(line) {
                ManifestLine::Uri(uri) => {
                    match resolve_uri(source_url, uri.trim(), options.preserve_query_params) {
                        Some(absolute) => {
                            rewritten_uris += 1;
                            format!("{}{}", encode_proxy_url(options.proxy_base, &absolute), cr)
                        }
                        None => raw.to_string(),
                    }
                }
                ManifestLine::TagWithUri(tag) => {
                    let replaced = URI_ATTRIBUTE.replace_all(tag, |caps: &Captures| {
                        match resolve_uri(source_url, &caps[1], options.preserve_query_params) {
                            Some(absolute) => {
                                rewritten_uris += 1;
                                format!(
                                    "URI=\"{}\"",
                                    encode_proxy_url(options.proxy_base, &absolute)
                                )
                            }
                            None => caps[0].to_string(),
                        }
                    });
                    format!("{}{}", replaced, cr)
                }
                ManifestLine::Tag(_) | ManifestLine::Other(_) => raw.to_string(),
            }
        })
        .collect();

    RewrittenManifest {
        text: lines.join("\n"),
        has_header: has_manifest_header(text),
        rewritten_uris,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::utils::url_utils::decode_proxy_url;

    const OPTIONS: RewriteOptions<'static> = RewriteOptions {
        proxy_base: "/proxy",
        preserve_query_params: true,
    };

    fn source() -> Url {
        Url::parse("https://cdn.example/path/master.m3u8?token=abc").unwrap()
    }

    #[test]
    fn rewrites_a_relative_segment() {
        let source = Url::parse("https://cdn.example/path/master.m3u8").unwrap();
        let out = rewrite_manifest("#EXTM3U\n#EXTINF:10,\nseg1.ts\n", &source, OPTIONS);
        let lines: Vec<&str> = out.text.split('\n').collect();

        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXTINF:10,");
        assert!(lines[2].starts_with("/proxy?url="));
        assert_eq!(
            decode_proxy_url(lines[2]).as_deref(),
            Some("https://cdn.example/path/seg1.ts")
        );
        assert_eq!(lines[3], "");
        assert!(out.has_header);
        assert_eq!(out.rewritten_uris, 1);
    }

    #[test]
    fn every_uri_round_trips_and_other_lines_survive() {
        let playlist = "#EXTM3U\r\n\
            #EXT-X-VERSION:7\r\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"../keys/k1.key?v=2\",IV=0x1\r\n\
            #EXT-X-MAP:URI=\"init.mp4\"\r\n\
            # plain comment\r\n\
            \r\n\
            #EXTINF:6.0,\r\n\
            /abs/path/seg-1.m4s\r\n\
            #EXTINF:6.0,\r\n\
            https://other.example/seg-2.m4s?sig=x%2By\r\n\
            #EXT-X-ENDLIST";
        let source = source();
        let out = rewrite_manifest(playlist, &source, OPTIONS);

        let before: Vec<&str> = playlist.split('\n').collect();
        let after: Vec<&str> = out.text.split('\n').collect();
        assert_eq!(before.len(), after.len());
        assert_eq!(out.rewritten_uris, 4);

        for (original, rewritten) in before.iter().zip(after.iter()) {
            match classify_line(original.trim_end_matches('\r')) {
                ManifestLine::Uri(uri) => {
                    let decoded = decode_proxy_url(rewritten.trim_end_matches('\r')).unwrap();
                    let expected = source.join(uri.trim()).unwrap();
                    assert_eq!(Url::parse(&decoded).unwrap(), expected);
                    assert!(rewritten.ends_with('\r'));
                }
                ManifestLine::TagWithUri(tag) => {
                    let original_uri = &URI_ATTRIBUTE.captures(tag).unwrap()[1];
                    let new_uri = &URI_ATTRIBUTE.captures(rewritten).unwrap()[1];
                    let decoded = decode_proxy_url(new_uri).unwrap();
                    assert_eq!(decoded, source.join(original_uri).unwrap().to_string());
                    // attributes around the uri are untouched
                    assert_eq!(
                        URI_ATTRIBUTE.replace(rewritten, ""),
                        URI_ATTRIBUTE.replace(original, "")
                    );
                }
                _ => assert_eq!(original, rewritten),
            }
        }
    }

    #[test]
    fn absolute_uris_are_kept_verbatim() {
        let out = rewrite_manifest(
            "#EXTM3U\nhttps://Other.example/a%20b.ts?x=1\n",
            &source(),
            OPTIONS,
        );
        let line = out.text.lines().nth(1).unwrap();
        assert_eq!(
            decode_proxy_url(line).as_deref(),
            Some("https://Other.example/a%20b.ts?x=1")
        );
    }

    #[test]
    fn query_is_dropped_when_not_preserved() {
        let options = RewriteOptions {
            preserve_query_params: false,
            ..OPTIONS
        };
        let out = rewrite_manifest("#EXTM3U\nseg.ts?token=1\n", &source(), options);
        let line = out.text.lines().nth(1).unwrap();
        assert_eq!(
            decode_proxy_url(line).as_deref(),
            Some("https://cdn.example/path/seg.ts")
        );
    }

    #[test]
    fn foreign_schemes_are_left_alone() {
        let playlist = "#EXTM3U\n#EXT-X-SESSION-KEY:METHOD=SAMPLE-AES,URI=\"skd://key-id\"\n#EXT-X-KEY:METHOD=AES-128,URI=\"data:text/plain;base64,AAAA\"\n";
        let out = rewrite_manifest(playlist, &source(), OPTIONS);
        assert_eq!(out.text, playlist);
        assert_eq!(out.rewritten_uris, 0);
    }

    #[test]
    fn missing_header_still_rewrites() {
        let out = rewrite_manifest("#EXTINF:4,\nseg.ts", &source(), OPTIONS);
        assert!(!out.has_header);
        assert_eq!(out.rewritten_uris, 1);
    }

    #[test]
    fn classifies_lines() {
        assert_eq!(classify_line("seg.ts"), ManifestLine::Uri("seg.ts"));
        assert_eq!(classify_line("#EXTINF:1,"), ManifestLine::Tag("#EXTINF:1,"));
        assert_eq!(
            classify_line("#EXT-X-MAP:URI=\"a.mp4\""),
            ManifestLine::TagWithUri("#EXT-X-MAP:URI=\"a.mp4\"")
        );
        assert_eq!(classify_line("## banner"), ManifestLine::Other("## banner"));
        assert_eq!(classify_line("  "), ManifestLine::Other("  "));
    }
}
