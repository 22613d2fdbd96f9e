//! Atomic single-file store for the allocator's own state.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint has been written yet. First start on a node looks
    /// like this; callers treat it as an empty state.
    #[error("checkpoint not found")]
    NotFound,
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
}

/// Stores one blob in one file; every write replaces the whole file
/// atomically via a sibling temp file and rename.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
    file: String,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>, file: impl Into<String>) -> Result<Self, CheckpointError> {
        let directory = directory.into();
        ensure_directory(&directory)?;
        Ok(Self {
            directory,
            file: file.into(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), CheckpointError> {
        ensure_directory(&self.directory)?;

        let mut tmp = NamedTempFile::new_in(&self.directory)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path()).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<u8>, CheckpointError> {
        match fs::read(self.path()) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CheckpointError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn ensure_directory(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_before_write_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "state").unwrap();
        assert!(matches!(store.read(), Err(CheckpointError::NotFound)));
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "state").unwrap();

        store.write(b"first").unwrap();
        assert_eq!(store.read().unwrap(), b"first");

        // overwrite replaces the whole blob
        store.write(b"second, longer blob").unwrap();
        assert_eq!(store.read().unwrap(), b"second, longer blob");

        // no temp files left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state")]);
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let store = CheckpointStore::new(&nested, "state").unwrap();
        store.write(b"data").unwrap();
        assert_eq!(store.read().unwrap(), b"data");
    }

    #[test]
    fn delete_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "state").unwrap();
        store.delete().unwrap();
        store.write(b"data").unwrap();
        store.delete().unwrap();
        assert!(matches!(store.read(), Err(CheckpointError::NotFound)));
    }
}
