//! Network request port.
//!
//! A [`RequestFactory`] issues GET requests and hands back a
//! [`NetworkReply`] handle. The reply's asynchronous notifications
//! (progress, completion, errors) travel separately as [`ReplyMessage`]s so
//! they can be marshalled onto the engine's serialization point.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::NetworkErrorCode;

/// An outgoing GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Path of the transfer that issued the request.
    pub owner: String,
    /// Exchange id; replies tagged with an older id are stale.
    pub exchange: u64,
}

impl Request {
    pub fn new(url: impl Into<String>, owner: impl Into<String>, exchange: u64) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            owner: owner.into(),
            exchange,
        }
    }

    /// Header lookup, ignoring ASCII case of the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A TLS error reported while establishing the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslError {
    pub message: String,
    /// PEM of the offending certificate, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl SslError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            certificate: None,
        }
    }
}

/// Notification emitted by an in-flight reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// `total` is `None` when the server did not announce a length.
    DownloadProgress { received: u64, total: Option<u64> },
    Finished,
    Error(NetworkErrorCode),
    SslErrors(Vec<SslError>),
}

/// A reply event addressed to the transfer that owns the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    pub owner: String,
    pub exchange: u64,
    pub event: ReplyEvent,
}

impl ReplyMessage {
    pub fn new(owner: impl Into<String>, exchange: u64, event: ReplyEvent) -> Self {
        Self {
            owner: owner.into(),
            exchange,
            event,
        }
    }
}

/// Handle on one in-flight HTTP exchange.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait NetworkReply: Send {
    /// HTTP status, once headers arrived.
    fn status_code(&self) -> Option<u16>;

    fn reason_phrase(&self) -> Option<String>;

    /// Absolute target of a redirect response.
    fn redirect_target(&self) -> Option<String>;

    fn raw_header(&self, name: &str) -> Option<String>;

    /// Human readable description of the last transport error.
    fn error_string(&self) -> String;

    /// Drain every byte buffered so far.
    fn read_all(&mut self) -> Vec<u8>;

    fn abort(&mut self);

    /// Cap the read rate (bytes/sec, 0 = unlimited).
    fn set_read_buffer_size(&mut self, size: u64);

    /// Policy hook: whether the reported TLS errors may be ignored.
    fn can_ignore_ssl_errors(&self, errors: &[SslError]) -> bool;
}

/// Issues requests on behalf of transfers.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait RequestFactory: Send + Sync {
    fn get(&self, request: Request) -> Box<dyn NetworkReply>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut request = Request::new("http://example.com/a", "/transfer/1", 1);
        request
            .headers
            .insert("Accept-Encoding".to_string(), "identity".to_string());

        assert_eq!(request.header("accept-encoding"), Some("identity"));
        assert_eq!(request.header("range"), None);
    }
}
