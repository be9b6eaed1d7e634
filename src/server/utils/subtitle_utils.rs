use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::url_utils::encode_proxy_url;

// absolute image urls anywhere in a cue payload, the media fragment (#xywh=...) stays outside
static ABSOLUTE_IMAGE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?://[^\s"'<>?#]+\.(?:jpe?g|png|gif|webp|avif|bmp)(?:\?[^\s"'<>#]*)?"#)
        .expect("image url regex should compile")
});

// thumbnail tracks usually just list "sprite.jpg#xywh=0,0,160,90" relative to the vtt
static RELATIVE_IMAGE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^([^\s"'<>?#:]+\.(?:jpe?g|png|gif|webp|avif|bmp)(?:\?[^\s"'<>#]*)?)(#\S*)?$"#)
        .expect("relative image regex should compile")
});

/// Rewrite image urls inside WebVTT cue payloads to go through the proxy.
///
/// Header, NOTE/STYLE blocks, cue identifiers and timing lines are never touched.
pub fn rewrite_subtitles(text: &str, source_url: &Url, proxy_base: &str) -> String {
    let mut in_cue = false;

    text.split('\n')
        .map(|raw| {
            let trimmed = raw.trim();

            if trimmed.contains("-->") {
                in_cue = true;
                return raw.to_string();
            }
            if trimmed.is_empty() {
                in_cue = false;
                return raw.to_string();
            }
            if !in_cue {
                return raw.to_string();
            }

            if let Some(caps) = RELATIVE_IMAGE_LINE.captures(trimmed) {
                if let Ok(resolved) = source_url.join(&caps[1]) {
                    let fragment = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                    return raw.replacen(
                        trimmed,
                        &format!("{}{}", encode_proxy_url(proxy_base, resolved.as_str()), fragment),
                        1,
                    );
                }
            }

            ABSOLUTE_IMAGE_URL
                .replace_all(raw, |caps: &Captures| encode_proxy_url(proxy_base, &caps[0]))
                .into_owned()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::utils::url_utils::decode_proxy_url;

    fn source() -> Url {
        Url::parse("https://cdn.example/thumbs/track.vtt").unwrap()
    }

    #[test]
    fn rewrites_absolute_thumbnail_urls() {
        let vtt = "WEBVTT\n\n1\n00:00:00.000 --> 00:00:05.000\nhttps://img.example/sprite.jpg#xywh=0,0,160,90\n";
        let out = rewrite_subtitles(vtt, &source(), "/proxy");
        let lines: Vec<&str> = out.split('\n').collect();

        assert_eq!(lines[0], "WEBVTT");
        assert_eq!(lines[2], "1");
        assert_eq!(lines[3], "00:00:00.000 --> 00:00:05.000");

        let (proxied, fragment) = lines[4].split_once('#').unwrap();
        assert_eq!(fragment, "xywh=0,0,160,90");
        assert_eq!(
            decode_proxy_url(proxied).as_deref(),
            Some("https://img.example/sprite.jpg")
        );
    }

    #[test]
    fn resolves_lone_relative_images() {
        let vtt = "WEBVTT\n\n00:00.000 --> 00:05.000\nsprites/s1.png#xywh=160,0,160,90\n";
        let out = rewrite_subtitles(vtt, &source(), "/proxy");
        let cue = out.split('\n').nth(3).unwrap();
        let (proxied, fragment) = cue.split_once('#').unwrap();

        assert_eq!(fragment, "xywh=160,0,160,90");
        assert_eq!(
            decode_proxy_url(proxied).as_deref(),
            Some("https://cdn.example/thumbs/sprites/s1.png")
        );
    }

    #[test]
    fn leaves_text_cues_and_identifiers_alone() {
        let vtt = "WEBVTT\n\nNOTE see https://img.example/a.png\n\nhttps://img.example/id.png\n00:01.000 --> 00:02.000\nHello <b>there</b>, file.png is a word here\n";
        let out = rewrite_subtitles(vtt, &source(), "/proxy");
        // the NOTE block and cue identifier are outside a payload, and the prose line isn't a
        // lone image reference
        assert_eq!(out, vtt);
    }

    #[test]
    fn inline_urls_inside_markup_are_rewritten() {
        let vtt = "WEBVTT\n\n00:01.000 --> 00:02.000\n<img src=\"https://img.example/a.webp?w=2\">\n";
        let out = rewrite_subtitles(vtt, &source(), "/proxy");
        assert!(out.contains("<img src=\"/proxy?url=https%3A%2F%2Fimg.example%2Fa.webp%3Fw%3D2\">"));
    }
}
