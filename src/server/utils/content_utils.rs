// content classification: extension first, then the declared type, then the bytes themselves
use super::compression_utils::ContentEncoding;

pub const HLS_MIME: &str = "application/vnd.apple.mpegurl";
pub const VTT_MIME: &str = "text/vtt";

/// bytes needed for every signature below (ts sync byte repeats at 188)
pub const SNIFF_LEN: usize = 189;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteKind {
    Manifest,
    Subtitle,
}

impl RewriteKind {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Manifest => HLS_MIME,
            Self::Subtitle => VTT_MIME,
        }
    }
}

/// lowercase extension of the last path segment, query and fragment ignored
pub fn url_extension(url: &str) -> Option<String> {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url);
    // skip past the scheme and authority so "https://host.ts" doesn't count as an extension
    let path = match path.find("://") {
        Some(idx) => path[idx + 3..].split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => path,
    };

    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn declared_mime(content_type: Option<&str>) -> Option<String> {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty())
}

/// Does this need a full-buffer rewrite? Decided from the url and headers only, before any
/// body bytes are read.
pub fn rewrite_kind(url: &str, content_type: Option<&str>) -> Option<RewriteKind> {
    match url_extension(url).as_deref() {
        Some("m3u8") | Some("m3u") => return Some(RewriteKind::Manifest),
        Some("vtt") | Some("webvtt") => return Some(RewriteKind::Subtitle),
        _ => {}
    }

    let declared = declared_mime(content_type)?;
    if declared.contains("mpegurl") {
        Some(RewriteKind::Manifest)
    } else if declared == VTT_MIME {
        Some(RewriteKind::Subtitle)
    } else {
        None
    }
}

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "m3u8" | "m3u" => HLS_MIME,
        "vtt" | "webvtt" => VTT_MIME,
        "srt" => "application/x-subrip",
        "ts" => "video/mp2t",
        "m4s" | "mp4" | "m4v" | "fmp4" | "cmfv" => "video/mp4",
        "m4a" | "cmfa" => "audio/mp4",
        "aac" => "audio/aac",
        "mp3" => "audio/mpeg",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mpd" => "application/dash+xml",
        "key" => "application/octet-stream",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "js" => "text/javascript",
        "css" => "text/css",
        _ => return None,
    };
    Some(mime)
}

fn skip_bom(head: &[u8]) -> &[u8] {
    head.strip_prefix(&[0xef, 0xbb, 0xbf]).unwrap_or(head)
}

/// Magic byte sniffing. Only formats we can recognise with confidence.
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    let text = skip_bom(head);
    let trimmed = text
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &text[i..])
        .unwrap_or(&[]);

    if trimmed.starts_with(b"#EXTM3U") {
        return Some(HLS_MIME);
    }
    if text.starts_with(b"WEBVTT") {
        return Some(VTT_MIME);
    }

    match head {
        // gif starts with the ts sync byte so it has to be checked first
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [0x47, ..] if head.len() < SNIFF_LEN || head[188] == 0x47 => Some("video/mp2t"),
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xff, 0xd8, 0xff, ..] => Some("image/jpeg"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [_, _, _, _, b'f', b't', b'y', b'p', b'a', b'v', b'i', b'f', ..] => Some("image/avif"),
        [_, _, _, _, b'f', b't', b'y', b'p', b'M', b'4', b'A', ..] => Some("audio/mp4"),
        [_, _, _, _, b'f', b't', b'y', b'p', ..]
        | [_, _, _, _, b's', b't', b'y', b'p', ..]
        | [_, _, _, _, b'm', b'o', b'o', b'f', ..]
        | [_, _, _, _, b's', b'i', b'd', b'x', ..] => Some("video/mp4"),
        [0x1a, 0x45, 0xdf, 0xa3, ..] => Some("video/webm"),
        [b'I', b'D', b'3', ..] => Some("audio/mpeg"),
        [0xff, b1, ..] if b1 & 0xf6 == 0xf0 => Some("audio/aac"),
        [0xff, b1, ..] if b1 & 0xe0 == 0xe0 => Some("audio/mpeg"),
        _ => {
            let lower = trimmed
                .iter()
                .take(15)
                .map(|b| b.to_ascii_lowercase())
                .collect::<Vec<_>>();
            if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
                Some("text/html")
            } else {
                None
            }
        }
    }
}

fn is_media_mime(mime: &str) -> bool {
    mime.starts_with("video/") || mime.starts_with("audio/")
}

fn top_level(mime: &str) -> &str {
    mime.split('/').next().unwrap_or(mime)
}

fn is_generic(mime: &str) -> bool {
    matches!(
        mime,
        "application/octet-stream" | "binary/octet-stream" | "application/unknown" | "text/plain"
    )
}

/// Effective content type of a fully buffered body.
///
/// Priority: manifest/subtitle extensions, then the declared type unless the bytes clearly say
/// otherwise, then the sniffed type, then the extension's generic mime.
pub fn determine_content_type(body: &[u8], declared: Option<&str>, url: &str) -> Option<String> {
    let ext = url_extension(url);
    if let Some(kind) = rewrite_kind(url, None) {
        return Some(kind.mime().to_string());
    }

    let sniffed = sniff(&body[..body.len().min(SNIFF_LEN)]);
    let declared = declared_mime(declared);

    match (declared, sniffed) {
        (Some(declared), Some(sniffed)) => {
            if is_generic(&declared) || top_level(&declared) != top_level(sniffed) {
                Some(sniffed.to_string())
            } else {
                Some(declared)
            }
        }
        (Some(declared), None) => Some(declared),
        (None, Some(sniffed)) => Some(sniffed.to_string()),
        (None, None) => ext
            .as_deref()
            .and_then(mime_for_extension)
            .map(str::to_string),
    }
}

pub fn is_media_segment_url(url: &str) -> bool {
    let media_ext = matches!(
        url_extension(url).as_deref(),
        Some(
            "ts" | "m4s" | "mp4" | "m4v" | "m4a" | "aac" | "mp3" | "fmp4" | "cmfv" | "cmfa"
                | "webm" | "mkv"
        )
    );
    let lower = url.to_ascii_lowercase();
    media_ext || lower.contains("/segment-") || lower.contains("/seg-")
}

/// A segment that claims compression it never had.
///
/// Needs some hint it's media (url, declared type, or the bytes) and a leading chunk that
/// doesn't carry the claimed encoding's signature. Encodings without a signature only count
/// when the bytes sniff as raw media.
pub fn is_obfuscated(
    url: &str,
    content_type: Option<&str>,
    encoding: ContentEncoding,
    head: &[u8],
) -> bool {
    if !encoding.is_compressed() || head.is_empty() {
        return false;
    }

    let signature = encoding.signature_matches(head);
    if signature == Some(true) {
        return false;
    }

    let sniffed_media = sniff(head).is_some_and(is_media_mime);
    let declared_media = declared_mime(content_type).is_some_and(|m| is_media_mime(&m));
    let looks_like_segment = is_media_segment_url(url) || declared_media || sniffed_media;

    looks_like_segment && (signature == Some(false) || sniffed_media)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_packet_pair() -> Vec<u8> {
        let mut body = vec![0u8; 376];
        body[0] = 0x47;
        body[188] = 0x47;
        body
    }

    #[test]
    fn extensions_ignore_query_and_host() {
        assert_eq!(url_extension("https://cdn.example/a/master.M3U8?x=1.ts").as_deref(), Some("m3u8"));
        assert_eq!(url_extension("https://cdn.example/a/seg.ts#t=1"), Some("ts".into()));
        assert_eq!(url_extension("https://host.ts"), None);
        assert_eq!(url_extension("https://cdn.example/dir.v2/file"), None);
    }

    #[test]
    fn rewrite_kind_prefers_extension_then_header() {
        assert_eq!(rewrite_kind("https://a/x.m3u8", Some("video/mp2t")), Some(RewriteKind::Manifest));
        assert_eq!(
            rewrite_kind("https://a/playlist", Some("application/x-mpegURL; charset=utf-8")),
            Some(RewriteKind::Manifest)
        );
        assert_eq!(rewrite_kind("https://a/subs", Some("text/vtt")), Some(RewriteKind::Subtitle));
        assert_eq!(rewrite_kind("https://a/seg.ts", Some("video/mp2t")), None);
    }

    #[test]
    fn sniffs_common_signatures() {
        assert_eq!(sniff(&ts_packet_pair()), Some("video/mp2t"));
        assert_eq!(sniff(b"\xef\xbb\xbf#EXTM3U\n"), Some(HLS_MIME));
        assert_eq!(sniff(b"WEBVTT\n\n"), Some(VTT_MIME));
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n"), Some("image/png"));
        assert_eq!(sniff(b"\x00\x00\x00\x18ftypisom"), Some("video/mp4"));
        assert_eq!(sniff(b"\x00\x00\x00\x18moof"), Some("video/mp4"));
        assert_eq!(sniff(b"ID3\x04\x00"), Some("audio/mpeg"));
        assert_eq!(sniff(b"\xff\xf1\x50\x80"), Some("audio/aac"));
        assert_eq!(sniff(b"  <!DOCTYPE html><html>"), Some("text/html"));
        assert_eq!(sniff(b"{\"a\":1}"), None);
    }

    #[test]
    fn disguised_segment_gets_its_real_type() {
        let body = ts_packet_pair();
        assert_eq!(
            determine_content_type(&body, Some("image/jpeg"), "https://a/frame.jpg").as_deref(),
            Some("video/mp2t")
        );
        assert_eq!(
            determine_content_type(&body, Some("application/octet-stream"), "https://a/x").as_deref(),
            Some("video/mp2t")
        );
        assert_eq!(
            determine_content_type(b"opaque", None, "https://a/x.aac").as_deref(),
            Some("audio/aac")
        );
        assert_eq!(
            determine_content_type(b"#EXTM3U\n", Some("text/plain"), "https://a/x.m3u8").as_deref(),
            Some(HLS_MIME)
        );
    }

    #[test]
    fn fake_gzip_on_a_segment_is_obfuscated() {
        let body = ts_packet_pair();
        assert!(is_obfuscated("https://a/seg1.ts", None, ContentEncoding::Gzip, &body));
        // real media bytes behind a disguised extension and an unsniffable encoding
        assert!(is_obfuscated("https://a/frame.png", Some("image/png"), ContentEncoding::Brotli, &body));
    }

    #[test]
    fn real_compression_is_not_obfuscated() {
        assert!(!is_obfuscated("https://a/seg1.ts", None, ContentEncoding::Gzip, b"\x1f\x8b\x08\x00"));
        assert!(!is_obfuscated("https://a/seg1.ts", None, ContentEncoding::Identity, &ts_packet_pair()));
        // no media hint anywhere, so a mismatch is just a broken response
        assert!(!is_obfuscated("https://a/data.json", Some("application/json"), ContentEncoding::Gzip, b"{}"));
        // brotli has no magic and the bytes aren't media
        assert!(!is_obfuscated("https://a/seg1.ts", None, ContentEncoding::Brotli, b"\x1b\x03\x00"));
    }
}
