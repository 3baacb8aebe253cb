//! Process-wide reservation table for destination file names.
//!
//! Two transfers must never write the same path. A transfer reserves its
//! destination when the name is first needed and releases it when it reaches
//! a terminal state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Thread-safe; I/O workers may call it directly.
#[derive(Debug, Default)]
pub struct FileNameMutex {
    reserved: Mutex<HashSet<PathBuf>>,
}

impl FileNameMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `candidate`, or the first free ` (n)` variant of it.
    ///
    /// A name is free when nobody reserved it and nothing exists on disk at
    /// that path. The counter goes before the complete suffix, so
    /// `archive.tar.gz` becomes `archive (1).tar.gz`.
    pub fn lock_file_name(&self, candidate: &Path) -> PathBuf {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);

        if !reserved.contains(candidate) && !candidate.exists() {
            reserved.insert(candidate.to_path_buf());
            return candidate.to_path_buf();
        }

        let (stem, suffix) = split_complete_suffix(candidate);
        let mut counter = 1u32;
        loop {
            let name = format!("{stem} ({counter}){suffix}");
            let path = candidate.with_file_name(name);
            if !reserved.contains(&path) && !path.exists() {
                tracing::debug!(
                    target: "downlink.mutex",
                    requested = %candidate.display(),
                    assigned = %path.display(),
                    "file name taken, using numbered variant"
                );
                reserved.insert(path.clone());
                return path;
            }
            counter += 1;
        }
    }

    /// Release a reservation. Releasing a name nobody holds is a no-op.
    pub fn unlock_file_name(&self, name: &Path) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if !reserved.remove(name) {
            tracing::warn!(
                target: "downlink.mutex",
                path = %name.display(),
                "unlock requested for a file name that is not reserved"
            );
        }
    }

    pub fn is_locked(&self, name: &Path) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Split a file name at its first dot, ignoring a leading one.
fn split_complete_suffix(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match name.char_indices().skip(1).find(|(_, c)| *c == '.') {
        Some((idx, _)) => (name[..idx].to_string(), name[idx..].to_string()),
        None => (name, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_free_name_is_returned_unchanged() {
        let dir = TempDir::new().unwrap();
        let mutex = FileNameMutex::new();
        let path = dir.path().join("photo.jpg");

        assert_eq!(mutex.lock_file_name(&path), path);
        assert!(mutex.is_locked(&path));
    }

    #[test]
    fn test_existing_file_gets_numbered_variants() {
        let dir = TempDir::new().unwrap();
        let mutex = FileNameMutex::new();
        let path = dir.path().join("x.jpg");
        std::fs::write(&path, b"taken").unwrap();

        assert_eq!(mutex.lock_file_name(&path), dir.path().join("x (1).jpg"));
        assert_eq!(mutex.lock_file_name(&path), dir.path().join("x (2).jpg"));
    }

    #[test]
    fn test_reserved_name_gets_numbered_variant() {
        let dir = TempDir::new().unwrap();
        let mutex = FileNameMutex::new();
        let path = dir.path().join("notes");

        assert_eq!(mutex.lock_file_name(&path), path);
        assert_eq!(mutex.lock_file_name(&path), dir.path().join("notes (1)"));
    }

    #[test]
    fn test_counter_goes_before_complete_suffix() {
        let dir = TempDir::new().unwrap();
        let mutex = FileNameMutex::new();
        let path = dir.path().join("archive.tar.gz");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(
            mutex.lock_file_name(&path),
            dir.path().join("archive (1).tar.gz")
        );
    }

    #[test]
    fn test_numbered_variant_skips_files_on_disk() {
        let dir = TempDir::new().unwrap();
        let mutex = FileNameMutex::new();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"").unwrap();

        assert_eq!(mutex.lock_file_name(&path), dir.path().join("a (2).txt"));
    }

    #[test]
    fn test_unlock_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mutex = FileNameMutex::new();
        let path = dir.path().join("data.bin");

        mutex.lock_file_name(&path);
        mutex.unlock_file_name(&path);
        mutex.unlock_file_name(&path);
        mutex.unlock_file_name(&dir.path().join("never-locked"));

        assert!(!mutex.is_locked(&path));
        assert_eq!(mutex.lock_file_name(&path), path);
    }

    #[test]
    fn test_split_ignores_leading_dot() {
        assert_eq!(
            split_complete_suffix(Path::new("/tmp/.config")),
            (".config".to_string(), String::new())
        );
        assert_eq!(
            split_complete_suffix(Path::new("/tmp/a.b.c")),
            ("a".to_string(), ".b.c".to_string())
        );
    }

    #[test]
    fn test_concurrent_reservations_are_distinct() {
        let dir = TempDir::new().unwrap();
        let mutex = Arc::new(FileNameMutex::new());
        let path = dir.path().join("shared.iso");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let path = path.clone();
                std::thread::spawn(move || mutex.lock_file_name(&path))
            })
            .collect();

        let names: HashSet<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(names.len(), 8);
        assert!(names.contains(&path));
    }
}
