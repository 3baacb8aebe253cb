//! GET requests over reqwest.
//!
//! Every request runs on its own tokio task. The task streams the body into
//! a buffer shared with the [`HttpReply`] handle and announces progress as
//! [`ReplyMessage`]s; the owner drains the buffer with `read_all`.
//! Redirects are never followed here, the engine decides what to do with
//! them.

use std::error::Error as _;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use downlink_core::ports::{
    NetworkReply, ReplyEvent, ReplyMessage, Request, RequestFactory, SslError,
};
use downlink_core::{EngineConfig, NetworkErrorCode};
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Shared reply state
// ============================================================================

#[derive(Debug, Default)]
struct ReplyState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    redirect: Option<String>,
    buffer: Vec<u8>,
    error: String,
    /// Read cap in bytes/sec, 0 = unlimited.
    throttle: u64,
}

#[derive(Debug, Clone, Default)]
struct Shared(Arc<Mutex<ReplyState>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ReplyState> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Reply handle
// ============================================================================

/// Handle on one in-flight GET. Dropping it aborts the exchange.
#[derive(Debug)]
pub struct HttpReply {
    shared: Shared,
    cancel: CancellationToken,
    accepted_certificates: Arc<[String]>,
}

impl NetworkReply for HttpReply {
    fn status_code(&self) -> Option<u16> {
        self.shared.lock().status.map(|s| s.as_u16())
    }

    fn reason_phrase(&self) -> Option<String> {
        self.shared
            .lock()
            .status
            .and_then(|s| s.canonical_reason())
            .map(str::to_string)
    }

    fn redirect_target(&self) -> Option<String> {
        self.shared.lock().redirect.clone()
    }

    fn raw_header(&self, name: &str) -> Option<String> {
        self.shared
            .lock()
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn error_string(&self) -> String {
        self.shared.lock().error.clone()
    }

    fn read_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().buffer)
    }

    fn abort(&mut self) {
        self.cancel.cancel();
    }

    fn set_read_buffer_size(&mut self, size: u64) {
        self.shared.lock().throttle = size;
    }

    fn can_ignore_ssl_errors(&self, errors: &[SslError]) -> bool {
        !errors.is_empty()
            && errors.iter().all(|error| {
                error.certificate.as_ref().is_some_and(|pem| {
                    self.accepted_certificates
                        .iter()
                        .any(|accepted| accepted.trim() == pem.trim())
                })
            })
    }
}

impl Drop for HttpReply {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Issues GET requests on a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpRequestFactory {
    client: Client,
    tx: UnboundedSender<ReplyMessage>,
    accepted_certificates: Arc<[String]>,
}

impl HttpRequestFactory {
    /// Build the client. Certificates in `accepted_certificates` are trusted
    /// on top of the system roots.
    pub fn new(config: &EngineConfig, tx: UnboundedSender<ReplyMessage>) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        for pem in &config.accepted_certificates {
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                .context("invalid accepted certificate")?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder.build().context("failed to create HTTP client")?;
        Ok(Self {
            client,
            tx,
            accepted_certificates: config.accepted_certificates.clone().into(),
        })
    }
}

impl RequestFactory for HttpRequestFactory {
    fn get(&self, request: Request) -> Box<dyn NetworkReply> {
        let shared = Shared::default();
        let cancel = CancellationToken::new();
        let reply = HttpReply {
            shared: shared.clone(),
            cancel: cancel.clone(),
            accepted_certificates: Arc::clone(&self.accepted_certificates),
        };

        let exchange = Exchange {
            client: self.client.clone(),
            tx: self.tx.clone(),
            shared,
            owner: request.owner.clone(),
            id: request.exchange,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (owner, id) = (exchange.owner.clone(), exchange.id);
                runtime.spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            tracing::debug!(target: "downlink.http", owner = %owner, exchange = id, "exchange aborted");
                        }
                        () = exchange.run(request) => {}
                    }
                });
            }
            Err(_) => {
                tracing::warn!(target: "downlink.http", owner = %request.owner, "no runtime to run the request on");
                exchange.shared.lock().error = "no async runtime available".to_string();
                exchange.send(ReplyEvent::Error(NetworkErrorCode::UnknownNetwork));
            }
        }
        Box::new(reply)
    }
}

// ============================================================================
// Exchange task
// ============================================================================

struct Exchange {
    client: Client,
    tx: UnboundedSender<ReplyMessage>,
    shared: Shared,
    owner: String,
    id: u64,
}

impl Exchange {
    fn send(&self, event: ReplyEvent) {
        if self.tx.send(ReplyMessage::new(&self.owner, self.id, event)).is_err() {
            tracing::debug!(target: "downlink.http", owner = %self.owner, "reply listener gone");
        }
    }

    async fn run(self, request: Request) {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                self.fail_transport(&err);
                return;
            }
        };

        let status = response.status();
        let redirect = if status.is_redirection() {
            response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(|location| resolve(&request.url, location))
        } else {
            None
        };
        {
            let mut state = self.shared.lock();
            state.status = Some(status);
            state.headers = response.headers().clone();
            state.redirect = redirect;
        }

        if status.is_redirection() {
            self.send(ReplyEvent::Finished);
            return;
        }
        if !status.is_success() {
            self.shared.lock().error = status.to_string();
            self.send(ReplyEvent::Error(status_error_code(status)));
            return;
        }

        let total = response.content_length();
        let mut received = 0u64;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let len = chunk.len() as u64;
                    received += len;
                    let throttle = {
                        let mut state = self.shared.lock();
                        state.buffer.extend_from_slice(&chunk);
                        state.throttle
                    };
                    self.send(ReplyEvent::DownloadProgress { received, total });
                    if throttle > 0 {
                        tokio::time::sleep(Duration::from_secs_f64(len as f64 / throttle as f64))
                            .await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.fail_transport(&err);
                    return;
                }
            }
        }

        tracing::debug!(target: "downlink.http", owner = %self.owner, exchange = self.id, received, "exchange finished");
        self.send(ReplyEvent::Finished);
    }

    fn fail_transport(&self, err: &reqwest::Error) {
        let message = error_chain(err);
        tracing::debug!(target: "downlink.http", owner = %self.owner, exchange = self.id, error = %message, "transport error");
        self.shared.lock().error.clone_from(&message);

        if is_tls_error(&message) {
            self.send(ReplyEvent::SslErrors(vec![SslError::new(message)]));
            self.send(ReplyEvent::Error(NetworkErrorCode::SslHandshakeFailed));
            return;
        }
        self.send(ReplyEvent::Error(transport_error_code(err)));
    }
}

fn resolve(base: &str, location: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(location))
        .map_or_else(|_| location.to_string(), String::from)
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn is_tls_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn transport_error_code(err: &reqwest::Error) -> NetworkErrorCode {
    if err.is_timeout() {
        NetworkErrorCode::Timeout
    } else if err.is_connect() {
        NetworkErrorCode::ConnectionRefused
    } else if err.is_body() || err.is_decode() {
        NetworkErrorCode::RemoteHostClosed
    } else if err.is_builder() {
        NetworkErrorCode::ProtocolUnknown
    } else {
        NetworkErrorCode::UnknownNetwork
    }
}

fn status_error_code(status: StatusCode) -> NetworkErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => NetworkErrorCode::AuthenticationRequired,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => NetworkErrorCode::ProxyAuthenticationRequired,
        StatusCode::FORBIDDEN => NetworkErrorCode::ContentAccessDenied,
        StatusCode::NOT_FOUND | StatusCode::GONE => NetworkErrorCode::ContentNotFound,
        StatusCode::METHOD_NOT_ALLOWED => NetworkErrorCode::ContentOperationNotPermitted,
        s if s.is_server_error() => NetworkErrorCode::ProtocolFailure,
        _ => NetworkErrorCode::UnknownContent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_location_is_resolved() {
        assert_eq!(
            resolve("http://example.com/files/a.bin", "../b.bin"),
            "http://example.com/b.bin"
        );
        assert_eq!(
            resolve("http://example.com/a", "https://mirror.example.org/a"),
            "https://mirror.example.org/a"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_error_code(StatusCode::NOT_FOUND),
            NetworkErrorCode::ContentNotFound
        );
        assert_eq!(
            status_error_code(StatusCode::UNAUTHORIZED),
            NetworkErrorCode::AuthenticationRequired
        );
        assert_eq!(
            status_error_code(StatusCode::SERVICE_UNAVAILABLE),
            NetworkErrorCode::ProtocolFailure
        );
        assert_eq!(
            status_error_code(StatusCode::IM_A_TEAPOT),
            NetworkErrorCode::UnknownContent
        );
    }

    #[test]
    fn test_tls_detection() {
        assert!(is_tls_error("invalid peer certificate: UnknownIssuer"));
        assert!(!is_tls_error("connection refused"));
    }
}
