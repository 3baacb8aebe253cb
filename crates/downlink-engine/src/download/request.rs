//! Request construction for a download exchange.

use std::collections::BTreeMap;

use downlink_core::ports::Request;

const RANGE_HEADER: &str = "Range";
const ACCEPT_ENCODING_HEADER: &str = "Accept-Encoding";

/// Build the GET for one exchange.
///
/// Caller supplied `Range` and `Accept-Encoding` headers are dropped: the
/// engine owns both. The payload must arrive unencoded so the bytes on disk
/// match what a checksum was computed over, and the range is only set when
/// continuing a partial file.
pub fn build_request(
    url: &str,
    headers: &BTreeMap<String, String>,
    owner: &str,
    exchange: u64,
    resume_from: Option<u64>,
) -> Request {
    let mut request = Request::new(url, owner, exchange);

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(RANGE_HEADER)
            || name.eq_ignore_ascii_case(ACCEPT_ENCODING_HEADER)
        {
            continue;
        }
        request.headers.insert(name.clone(), value.clone());
    }

    request
        .headers
        .insert(ACCEPT_ENCODING_HEADER.to_string(), "identity".to_string());

    if let Some(offset) = resume_from {
        request
            .headers
            .insert(RANGE_HEADER.to_string(), format!("bytes={offset}-"));
    }

    request
}
