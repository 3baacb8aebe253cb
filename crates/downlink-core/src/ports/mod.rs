//! Port definitions (trait abstractions) for external systems.
//!
//! Ports define the interfaces the transfer engine expects from
//! infrastructure. They contain no implementation details and use only
//! domain types.
//!
//! # Design Rules
//!
//! - No HTTP client, process or filesystem types in any signature
//! - Replies and processes report progress as events; the engine never blocks
//!   on them
//! - With the `mock` feature every trait gets a `mockall` mock (`MockX`)

pub mod file;
pub mod hash;
pub mod network;
pub mod process;
pub mod system;

pub use file::{File, FileManager, OpenMode};
pub use hash::{CryptographicHash, HashFactory};
pub use network::{NetworkReply, ReplyEvent, ReplyMessage, Request, RequestFactory, SslError};
pub use process::{ExitStatus, Process, ProcessErrorCode, ProcessEvent, ProcessFactory, ProcessMessage};
pub use system::SystemNetworkInfo;

#[cfg(feature = "mock")]
pub use file::{MockFile, MockFileManager};
#[cfg(feature = "mock")]
pub use hash::{MockCryptographicHash, MockHashFactory};
#[cfg(feature = "mock")]
pub use network::{MockNetworkReply, MockRequestFactory};
#[cfg(feature = "mock")]
pub use process::{MockProcess, MockProcessFactory};
#[cfg(feature = "mock")]
pub use system::MockSystemNetworkInfo;
