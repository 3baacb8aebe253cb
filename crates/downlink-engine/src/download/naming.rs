//! Destination name derivation.

use std::path::{Path, PathBuf};

use url::Url;

/// Last non-empty path segment of `url`, percent-decoded.
pub fn basename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment)
        .map_or_else(|_| segment.to_string(), std::borrow::Cow::into_owned);
    sanitize_file_name(&decoded)
}

/// Staging path used while bytes are still arriving.
pub fn temp_path(file_path: &Path, suffix: &str) -> PathBuf {
    let mut name = file_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Extract the file name announced by a `Content-Disposition` header.
///
/// `filename*` (RFC 5987, percent-encoded) wins over plain `filename`.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "filename*" => {
                let encoded = value.split_once("''").map_or(value, |(_, rest)| rest);
                extended = urlencoding::decode(encoded).ok().map(|s| s.into_owned());
            }
            "filename" => plain = Some(value.trim_matches('"').to_string()),
            _ => {}
        }
    }

    extended.or(plain).and_then(|name| sanitize_file_name(&name))
}

/// Keep only the final component so a server cannot escape the directory.
fn sanitize_file_name(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}
