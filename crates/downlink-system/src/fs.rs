//! Local filesystem adapter.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use downlink_core::ports::{File, FileManager, OpenMode};

/// A file on the local disk, opened lazily.
#[derive(Debug)]
pub struct FsFile {
    path: PathBuf,
    handle: Option<fs::File>,
}

impl FsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: None,
        }
    }

    pub const fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&mut self) -> io::Result<&mut fs::File> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::other(format!("{} is not open", self.path.display())))
    }
}

impl File for FsFile {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn open(&mut self, mode: OpenMode) -> io::Result<()> {
        let handle = match mode {
            OpenMode::Append => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create(true)
                    .open(&self.path)?
            }
            OpenMode::Read => fs::File::open(&self.path)?,
        };
        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.handle()?.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }

    fn size(&self) -> u64 {
        fs::metadata(&self.path).map_or(0, |meta| meta.len())
    }

    fn reset(&mut self) -> io::Result<()> {
        self.handle()?.seek(SeekFrom::Start(0)).map(|_| ())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }

    fn close(&mut self) {
        self.handle = None;
    }

    fn remove(&mut self) -> io::Result<()> {
        self.close();
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// [`FileManager`] over `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFileManager;

impl FsFileManager {
    pub const fn new() -> Self {
        Self
    }
}

impl FileManager for FsFileManager {
    fn create_file(&self, path: &Path) -> Box<dyn File> {
        Box::new(FsFile::new(path))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/file.bin");
        let mut file = FsFile::new(&path);

        file.open(OpenMode::Append).unwrap();
        file.write(b"hello").unwrap();
        file.flush().unwrap();

        assert!(path.exists());
        assert_eq!(file.size(), 5);
    }

    #[test]
    fn test_append_keeps_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.tmp");
        fs::write(&path, b"abc").unwrap();

        let mut file = FsFile::new(&path);
        file.open(OpenMode::Append).unwrap();
        file.write(b"def").unwrap();
        file.flush().unwrap();
        file.close();

        assert_eq!(fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_reset_rewinds_for_reading() {
        let dir = TempDir::new().unwrap();
        let mut file = FsFile::new(dir.path().join("data"));
        file.open(OpenMode::Append).unwrap();
        file.write(b"payload").unwrap();
        file.flush().unwrap();

        file.reset().unwrap();
        let mut buf = [0u8; 16];
        let read = file.read(&mut buf).unwrap();

        assert_eq!(&buf[..read], b"payload");
    }

    #[test]
    fn test_io_on_closed_file_fails() {
        let dir = TempDir::new().unwrap();
        let mut file = FsFile::new(dir.path().join("never-opened"));

        assert!(file.write(b"x").is_err());
        assert!(file.flush().is_err());
        assert_eq!(file.size(), 0);
    }

    #[test]
    fn test_remove_closes_and_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        let mut file = FsFile::new(&path);
        file.open(OpenMode::Append).unwrap();

        file.remove().unwrap();
        assert!(!file.is_open());
        assert!(!path.exists());
        file.remove().unwrap();
    }

    #[test]
    fn test_manager_rename_and_exists() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.tmp");
        let to = dir.path().join("a");
        fs::write(&from, b"1").unwrap();
        let manager = FsFileManager::new();

        manager.rename(&from, &to).unwrap();

        assert!(!manager.exists(&from));
        assert!(manager.exists(&to));
        manager.remove(&to).unwrap();
        assert!(!manager.exists(&to));
    }
}
