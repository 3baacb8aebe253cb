//! Error taxonomy for transfers.
//!
//! Errors are serializable and never hold non-serializable types like
//! `std::io::Error`; I/O failures are captured as kind and message strings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::ports::SslError;

/// Transport-level failure codes reported by a network reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorCode {
    ConnectionRefused,
    RemoteHostClosed,
    HostNotFound,
    Timeout,
    OperationCanceled,
    SslHandshakeFailed,
    TemporaryNetworkFailure,
    NetworkSessionFailed,
    BackgroundRequestNotAllowed,
    ProxyConnectionRefused,
    ProxyConnectionClosed,
    ProxyNotFound,
    ProxyTimeout,
    ProxyAuthenticationRequired,
    ContentAccessDenied,
    ContentOperationNotPermitted,
    ContentNotFound,
    AuthenticationRequired,
    ContentReSend,
    ProtocolUnknown,
    ProtocolInvalidOperation,
    UnknownNetwork,
    UnknownProxy,
    UnknownContent,
    ProtocolFailure,
}

impl NetworkErrorCode {
    pub const fn description(self) -> &'static str {
        match self {
            Self::ConnectionRefused => "ConnectionRefusedError",
            Self::RemoteHostClosed => "RemoteHostClosedError",
            Self::HostNotFound => "HostNotFoundError",
            Self::Timeout => "TimeoutError",
            Self::OperationCanceled => "OperationCanceledError",
            Self::SslHandshakeFailed => "SslHandshakeFailedError",
            Self::TemporaryNetworkFailure => "TemporaryNetworkFailureError",
            Self::NetworkSessionFailed => "NetworkSessionFailedError",
            Self::BackgroundRequestNotAllowed => "BackgroundRequestNotAllowedError",
            Self::ProxyConnectionRefused => "ProxyConnectionRefusedError",
            Self::ProxyConnectionClosed => "ProxyConnectionClosedError",
            Self::ProxyNotFound => "ProxyNotFoundError",
            Self::ProxyTimeout => "ProxyTimeoutError",
            Self::ProxyAuthenticationRequired => "ProxyAuthenticationRequiredError",
            Self::ContentAccessDenied => "ContentAccessDenied",
            Self::ContentOperationNotPermitted => "ContentOperationNotPermittedError",
            Self::ContentNotFound => "ContentNotFoundError",
            Self::AuthenticationRequired => "AuthenticationRequiredError",
            Self::ContentReSend => "ContentReSendError",
            Self::ProtocolUnknown => "ProtocolUnknownError",
            Self::ProtocolInvalidOperation => "ProtocolInvalidOperationError",
            Self::UnknownNetwork => "UnknownNetworkError",
            Self::UnknownProxy => "UnknownProxyError",
            Self::UnknownContent => "UnknownContentError",
            Self::ProtocolFailure => "ProtocolFailure",
        }
    }
}

/// Which party asked for credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    Server,
    Proxy,
}

/// How a post-download command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessFailure {
    FailedToStart,
    Crashed,
    Timedout,
    ReadError,
    WriteError,
    /// The command ran to completion with a non-zero exit code.
    ErrorInProcess,
    Unknown,
}

/// A fatal transfer failure.
///
/// Each variant corresponds to one of the specific error events; the generic
/// message shown to users comes from [`TransferError::generic_message`].
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferError {
    /// Completed exchange with a non-2xx status.
    #[error("HTTP error {status}: {reason}")]
    Http { status: u16, reason: String },

    /// Transport failure.
    #[error("Network error ({}): {message}", .code.description())]
    Network {
        code: NetworkErrorCode,
        message: String,
    },

    /// Credentials required by the server or a proxy.
    #[error("Authentication required ({kind:?}): {message}")]
    Auth {
        kind: AuthErrorKind,
        message: String,
    },

    /// TLS errors the reply could not ignore.
    #[error("SSL errors: {}", format_ssl_errors(.errors))]
    Ssl { errors: Vec<SslError> },

    /// Checksum of the written file did not match.
    #[error("Hash mismatch ({algorithm}): expected {expected}, got {actual}")]
    Hash {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// Post-download command did not exit cleanly.
    #[error("Process error ({failure:?}, exit code {exit_code})")]
    Process {
        failure: ProcessFailure,
        exit_code: i32,
        standard_output: String,
        standard_error: String,
    },

    /// Post-download command was configured but unusable.
    #[error("Command error: {message}")]
    Command { message: String },

    /// Write or flush of the destination failed.
    #[error("File system error ({kind}): {message}")]
    FileSystem { kind: String, message: String },
}

fn format_ssl_errors(errors: &[SslError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl TransferError {
    pub fn http(status: u16, reason: impl Into<String>) -> Self {
        Self::Http {
            status,
            reason: reason.into(),
        }
    }

    pub fn network(code: NetworkErrorCode, message: impl Into<String>) -> Self {
        Self::Network {
            code,
            message: message.into(),
        }
    }

    pub fn auth(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self::Auth {
            kind,
            message: message.into(),
        }
    }

    pub fn hash_mismatch(
        algorithm: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Hash {
            algorithm: algorithm.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Capture a `std::io::Error` as a file system failure.
    #[must_use]
    pub fn from_io_error(err: &std::io::Error) -> Self {
        let kind = err.kind();
        Self::FileSystem {
            kind: format!("{kind:?}"),
            message: err.to_string(),
        }
    }

    /// The generic message published alongside the specific error.
    #[must_use]
    pub fn generic_message(&self) -> String {
        match self {
            Self::Http { .. } | Self::Network { .. } => "NETWORK ERROR".to_string(),
            Self::Auth {
                kind: AuthErrorKind::Server,
                ..
            } => "AUTHENTICATION ERROR".to_string(),
            Self::Auth {
                kind: AuthErrorKind::Proxy,
                ..
            } => "PROXY_AUTHENTICATION ERROR".to_string(),
            Self::Ssl { .. } => "SSL ERROR".to_string(),
            Self::Hash { .. } => "HASH ERROR".to_string(),
            Self::Process { .. } | Self::Command { .. } => "COMMAND ERROR".to_string(),
            Self::FileSystem { kind, .. } => format!("FILE SYSTEM ERROR: {kind}"),
        }
    }
}

/// Why a download or group was rejected at construction time.
///
/// Validation failures are permanent: the transfer reports
/// `is_valid() == false` and keeps this as its last error.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Invalid URL: '{url}'")]
    InvalidUrl { url: String },

    #[error("Invalid hash algorithm: '{algorithm}'")]
    InvalidHashAlgorithm { algorithm: String },

    #[error("Duplicated local path passed: {}", .path.display())]
    DuplicatedLocalPath { path: PathBuf },

    #[error("File already exists at: '{}'", .path.display())]
    FileExists { path: PathBuf },

    #[error("Invalid member {url}: {reason}")]
    InvalidMember { url: String, reason: String },
}

/// A configuration call rejected by a transfer.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetupError {
    #[error("Relative paths are not allowed: '{}'", .path.display())]
    RelativePath { path: PathBuf },

    #[error("Path does not exist: '{}'", .path.display())]
    NotFound { path: PathBuf },

    #[error("Path is not a directory: '{}'", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("Transfer already started ({state})")]
    AlreadyStarted { state: crate::TransferState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = TransferError::from_io_error(&io_err);
        assert_eq!(err.generic_message(), "FILE SYSTEM ERROR: PermissionDenied");
    }

    #[test]
    fn test_generic_messages() {
        assert_eq!(TransferError::http(404, "Not Found").generic_message(), "NETWORK ERROR");
        assert_eq!(
            TransferError::auth(AuthErrorKind::Proxy, "").generic_message(),
            "PROXY_AUTHENTICATION ERROR"
        );
        assert_eq!(
            TransferError::auth(AuthErrorKind::Server, "").generic_message(),
            "AUTHENTICATION ERROR"
        );
        assert_eq!(TransferError::command("empty").generic_message(), "COMMAND ERROR");
        assert_eq!(
            TransferError::hash_mismatch("md5", "a", "b").generic_message(),
            "HASH ERROR"
        );
    }

    #[test]
    fn test_transfer_error_serialization_is_tagged() {
        let err = TransferError::network(NetworkErrorCode::ContentNotFound, "loop");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "network");
        assert_eq!(json["code"], "content_not_found");

        let back: TransferError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_duplicated_path_message() {
        let err = ValidationError::DuplicatedLocalPath {
            path: PathBuf::from("/tmp/a"),
        };
        assert_eq!(err.to_string(), "Duplicated local path passed: /tmp/a");
    }
}
