use std::io::Read;

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Content encodings upstreams are allowed to send us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Brotli,
    Zstd,
    Identity,
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("failed to decode {encoding} body: {source}")]
    Decode {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported content-encoding: {0}")]
    Unsupported(String),
    #[error("decompression panicked")]
    Panicked,
}

impl ContentEncoding {
    /// parse a `content-encoding` header value, `None` for anything we can't decode.
    /// stacked encodings ("gzip, br") aren't something CDNs actually send so they're rejected
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            "zstd" => Some(Self::Zstd),
            "" | "identity" => Some(Self::Identity),
            _ => None,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
            Self::Zstd => "zstd",
            Self::Identity => "identity",
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != Self::Identity
    }

    /// Does the leading chunk carry this encoding's magic bytes?
    ///
    /// `None` when the format has no reliable signature (brotli, raw deflate), callers have to
    /// fall back on other evidence for those.
    pub fn signature_matches(&self, head: &[u8]) -> Option<bool> {
        match self {
            Self::Gzip => Some(head.starts_with(&GZIP_MAGIC)),
            Self::Zstd => Some(head.starts_with(&ZSTD_MAGIC)),
            // zlib wrapped deflate has a checksummed two byte header, raw deflate has nothing
            Self::Deflate => match head {
                [cmf, flg, ..] if cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0 => {
                    Some(true)
                }
                _ => None,
            },
            Self::Brotli => None,
            Self::Identity => Some(true),
        }
    }
}

/// Decode a complete body. This is CPU bound and is meant to run on a decompression worker,
/// the request loop only calls it directly as a fallback.
pub fn decompress(encoding: ContentEncoding, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(3));

    let result = match encoding {
        ContentEncoding::Identity => return Ok(data.to_vec()),
        // some origins concatenate gzip members, the multi decoder reads all of them
        ContentEncoding::Gzip => MultiGzDecoder::new(data).read_to_end(&mut out),
        ContentEncoding::Deflate => {
            // "deflate" is supposed to mean zlib but plenty of servers send raw deflate
            match ZlibDecoder::new(data).read_to_end(&mut out) {
                Ok(n) => Ok(n),
                Err(_) => {
                    out.clear();
                    DeflateDecoder::new(data).read_to_end(&mut out)
                }
            }
        }
        ContentEncoding::Brotli => brotli::Decompressor::new(data, 4096).read_to_end(&mut out),
        ContentEncoding::Zstd => zstd::decode_all(data).map(|decoded| {
            out = decoded;
            out.len()
        }),
    };

    result.map_err(|source| CompressionError::Decode {
        encoding: encoding.as_header_value(),
        source,
    })?;

    Ok(out)
}
