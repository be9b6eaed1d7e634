pub mod compression_utils;
pub mod content_utils;
pub mod manifest_utils;
pub mod range_utils;
pub mod subtitle_utils;
pub mod url_utils;
