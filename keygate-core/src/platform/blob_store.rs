//! File system blob store with atomic replace semantics.
//!
//! Writes follow write-to-temp, fsync, rename, fsync-directory, so a reader
//! (or a process restarted after a crash) sees either the old record or the
//! new one, never a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{KeyStoreError, KeyStoreResult};

use super::AtomicBlobStore;

fn io_error(context: &str, path: &Path, err: &std::io::Error) -> KeyStoreError {
    KeyStoreError::BlobStore(format!("{context} '{}': {err}", path.display()))
}

/// [`AtomicBlobStore`] keeping one file per blob in a directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    directory: PathBuf,
}

impl FileBlobStore {
    /// Opens (creating if needed) a blob store rooted at `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new<P: AsRef<Path>>(directory: P) -> KeyStoreResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)
            .map_err(|e| io_error("failed to create blob directory", &directory, &e))?;
        Ok(Self { directory })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!(".{name}.tmp"))
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> KeyStoreResult<()> {
        File::open(&self.directory)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| io_error("failed to sync directory", &self.directory, &e))
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> KeyStoreResult<()> {
        // Directory handles cannot be synced here; rename is still atomic.
        Ok(())
    }
}

impl AtomicBlobStore for FileBlobStore {
    fn read(&self, name: &str) -> KeyStoreResult<Option<Vec<u8>>> {
        let path = self.blob_path(name);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("failed to read blob", &path, &e)),
        }
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> KeyStoreResult<()> {
        let final_path = self.blob_path(name);
        let temp_path = self.temp_path(name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| io_error("failed to create temporary file", &temp_path, &e))?;
        file.write_all(bytes)
            .map_err(|e| io_error("failed to write temporary file", &temp_path, &e))?;
        file.sync_all()
            .map_err(|e| io_error("failed to sync temporary file", &temp_path, &e))?;
        drop(file);

        fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            io_error("failed to publish blob", &final_path, &e)
        })?;
        self.sync_directory()
    }

    fn delete(&self, name: &str) -> KeyStoreResult<()> {
        let path = self.blob_path(name);
        match fs::remove_file(&path) {
            Ok(()) => self.sync_directory(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("failed to delete blob", &path, &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileBlobStore::new(dir.path()).expect("store");

        assert_eq!(store.read("record.bin").expect("read"), None);
        store.write_atomic("record.bin", b"first").expect("write");
        store.write_atomic("record.bin", b"second").expect("overwrite");
        assert_eq!(
            store.read("record.bin").expect("read").as_deref(),
            Some(&b"second"[..])
        );
        assert!(!dir.path().join(".record.bin.tmp").exists());

        store.delete("record.bin").expect("delete");
        store.delete("record.bin").expect("second delete is a no-op");
        assert_eq!(store.read("record.bin").expect("read"), None);
    }

    #[test]
    fn test_creates_nested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        let store = FileBlobStore::new(&nested).expect("store");
        store.write_atomic("x", b"1").expect("write");
        assert!(nested.join("x").exists());
    }
}
