//! Filesystem port.

use std::io;
use std::path::{Path, PathBuf};

/// How a file handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read/write, positioned at the end; created when missing.
    Append,
    /// Read-only from the start.
    Read,
}

/// Handle on one file.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait File: Send {
    fn path(&self) -> PathBuf;

    fn open(&mut self, mode: OpenMode) -> io::Result<()>;

    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Size on disk, 0 when it cannot be determined.
    fn size(&self) -> u64;

    /// Rewind to the first byte.
    fn reset(&mut self) -> io::Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self);

    fn remove(&mut self) -> io::Result<()>;
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait FileManager: Send + Sync {
    fn create_file(&self, path: &Path) -> Box<dyn File>;

    fn exists(&self, path: &Path) -> bool;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}
