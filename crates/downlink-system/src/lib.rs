//! Production adapters for the downlink ports.
//!
//! Each module implements one trait family from `downlink_core::ports`:
//!
//! - [`fs`] - local files ([`FsFileManager`])
//! - [`http`] - GET requests over reqwest ([`HttpRequestFactory`])
//! - [`process`] - post-download commands over tokio ([`TokioProcessFactory`])
//! - [`network`] - connectivity and bearer information ([`StaticNetworkInfo`])
//! - [`hash`] - checksums over the `RustCrypto` digests ([`DigestHashFactory`])
//!
//! Asynchronous notifications (reply progress, process exit) are pushed onto
//! the unbounded channels handed to the factories; the engine drains them on
//! its own task.

pub mod fs;
pub mod hash;
pub mod http;
pub mod network;
pub mod process;

pub use fs::{FsFile, FsFileManager};
pub use hash::{DigestHash, DigestHashFactory};
pub use http::{HttpReply, HttpRequestFactory};
pub use network::StaticNetworkInfo;
pub use process::{TokioProcess, TokioProcessFactory};
