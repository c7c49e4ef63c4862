//! Content-addressed object store.
//!
//! Blobs are keyed by the lowercase-hex SHA-256 of their bytes and laid
//! out in a sharded directory tree (`objects/<hh>/<hash>`). Writes stage
//! into a private `tmp/` directory and rename into place, so readers only
//! ever observe complete objects. Blobs are never deleted.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{self, StateError};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// Sharded on-disk blob store.
pub struct ObjectStore {
    root: PathBuf,
}

/// Lowercase-hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ObjectStore {
    /// Open or create an object store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the layout can't be created.
    pub fn open(root: &Path) -> error::Result<Self> {
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        let shard = if hash.len() >= 2 { &hash[..2] } else { hash };
        self.root.join(OBJECTS_DIR).join(shard).join(hash)
    }

    /// Whether a blob is stored under `hash`.
    #[must_use]
    pub fn exists(&self, hash: &str) -> bool {
        self.object_path(hash).is_file()
    }

    /// Store `bytes` under `hash`, fsyncing before rename. No-op when the
    /// blob already exists. The caller guarantees `hash == SHA256(bytes)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] on write failure.
    pub fn put(&self, hash: &str, bytes: &[u8]) -> error::Result<()> {
        self.write_object(hash, bytes, true)
    }

    /// Store several blobs, amortising fsync cost: individual objects are
    /// written without a per-file sync and the shard directories are
    /// synced once at the end.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] on write failure.
    pub fn put_batch(&self, objects: &HashMap<String, Vec<u8>>) -> error::Result<()> {
        for (hash, bytes) in objects {
            self.write_object(hash, bytes, false)?;
        }
        for hash in objects.keys() {
            if let Some(shard) = self.object_path(hash).parent() {
                File::open(shard)?.sync_all()?;
            }
        }
        Ok(())
    }

    fn write_object(&self, hash: &str, bytes: &[u8], sync: bool) -> error::Result<()> {
        let path = self.object_path(hash);
        if path.is_file() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut staged = tempfile::NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        staged.write_all(bytes)?;
        if sync {
            staged.as_file().sync_all()?;
        }
        // Concurrent puts of the same hash race on the rename; both write
        // identical bytes, so last-wins is safe.
        staged
            .persist(&path)
            .map_err(|e| StateError::Io(e.error))?;
        Ok(())
    }

    /// Read the full blob stored under `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ObjectMissing`] when absent, or
    /// [`StateError::Io`] on read failure.
    pub fn get(&self, hash: &str) -> error::Result<Vec<u8>> {
        let path = self.object_path(hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StateError::ObjectMissing {
                hash: hash.to_string(),
            }),
            Err(e) => Err(StateError::Io(e)),
        }
    }

    /// Stream the blob stored under `hash` into `dest` without buffering
    /// it whole.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ObjectMissing`] when absent, or
    /// [`StateError::Io`] on copy failure.
    pub fn copy_to(&self, hash: &str, dest: &mut dyn Write) -> error::Result<u64> {
        let path = self.object_path(hash);
        let mut src = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::ObjectMissing {
                    hash: hash.to_string(),
                })
            }
            Err(e) => return Err(StateError::Io(e)),
        };
        Ok(std::io::copy(&mut src, dest)?)
    }

    /// Size in bytes of the stored blob.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ObjectMissing`] when absent.
    pub fn size(&self, hash: &str) -> error::Result<u64> {
        let path = self.object_path(hash);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StateError::ObjectMissing {
                hash: hash.to_string(),
            }),
            Err(e) => Err(StateError::Io(e)),
        }
    }
}
