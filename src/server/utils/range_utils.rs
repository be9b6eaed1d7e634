/// inclusive byte range out of a `Range: bytes=start-end` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn content_range(&self, total_len: usize) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_len)
    }
}

/// Parse a single `bytes=start-end` range against a body of `total_len` bytes.
///
/// An open end means "to the last byte". Anything else (suffix ranges, multiple ranges, other
/// units, start past the end, end past the body) is `None` and callers serve the whole body.
pub fn parse_range(header: &str, total_len: usize) -> Option<ByteRange> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = match end.trim() {
        "" => total_len.checked_sub(1)?,
        value => value.parse().ok()?,
    };

    if start <= end && end < total_len {
        Some(ByteRange { start, end })
    } else {
        None
    }
}
