//! Content-addressed package store.
//!
//! Packaged artifact sets are archived (tar + zstd) into a store keyed by
//! the settings-derived package identity, so a later run with the same
//! identity restores the package instead of re-running the lifecycle.
//!
//! Layout under the store root:
//! - `blobs/sha256/<aa>/<digest>` - tar.zst package archives
//! - `index/<identity>.json` - identity -> blob mapping
//! - `locks/<identity>.lock` - advisory write locks
//! - `tmp/` - staging for atomic blob insertion

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fsutil::{atomic_move, recreate_dir, sha256_file};

/// Index entry mapping a package identity to its archived blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    pub identity: String,
    pub name: String,
    pub version: String,
    pub blob_sha256: String,
    pub size_bytes: u64,
}

/// Store rooted at `<work root>/store`.
#[derive(Debug, Clone)]
pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    /// Open (and create if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        for dir in [
            store.root.join("blobs/sha256"),
            store.root.join("index"),
            store.root.join("locks"),
            store.root.join("tmp"),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::path_io(&dir, e))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self, identity: &str) -> Result<PathBuf> {
        validate_identity(identity)?;
        Ok(self.root.join("index").join(format!("{}.json", identity)))
    }

    fn lock_path(&self, identity: &str) -> Result<PathBuf> {
        validate_identity(identity)?;
        Ok(self.root.join("locks").join(format!("{}.lock", identity)))
    }

    fn blob_path(&self, sha256: &str) -> PathBuf {
        self.root
            .join("blobs/sha256")
            .join(&sha256[..2])
            .join(sha256)
    }

    fn acquire_lock(&self, identity: &str) -> Result<File> {
        let path = self.lock_path(identity)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::path_io(&path, e))?;
        file.lock_exclusive().map_err(|e| Error::path_io(&path, e))?;
        Ok(file)
    }

    /// Look up a package by identity. A dangling index entry (blob removed
    /// out from under us) reads as a miss, not an error.
    pub fn get(&self, identity: &str) -> Result<Option<StoreEntry>> {
        let index_path = self.index_path(identity)?;
        if !index_path.is_file() {
            return Ok(None);
        }

        let bytes = fs::read(&index_path).map_err(|e| Error::path_io(&index_path, e))?;
        let entry: StoreEntry = serde_json::from_slice(&bytes).map_err(|e| Error::Parse {
            path: index_path.clone(),
            reason: e.to_string(),
        })?;

        if !self.blob_path(&entry.blob_sha256).is_file() {
            warn!(identity, "index entry without blob, treating as cache miss");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Archive a packaged directory under its identity.
    pub fn put(
        &self,
        identity: &str,
        name: &str,
        version: &str,
        package_dir: &Path,
    ) -> Result<StoreEntry> {
        let _lock = self.acquire_lock(identity)?;

        let tmp = self.root.join("tmp").join(format!("{}.tar.zst", identity));
        write_tar_zst(package_dir, &tmp)?;

        let (blob_sha256, size_bytes) = sha256_file(&tmp)?;
        let blob_path = self.blob_path(&blob_sha256);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::path_io(parent, e))?;
        }
        if blob_path.exists() {
            fs::remove_file(&tmp).map_err(|e| Error::path_io(&tmp, e))?;
        } else {
            atomic_move(&tmp, &blob_path)?;
        }

        let entry = StoreEntry {
            identity: identity.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            blob_sha256,
            size_bytes,
        };
        let index_path = self.index_path(identity)?;
        let body = serde_json::to_vec_pretty(&entry).map_err(|e| Error::Parse {
            path: index_path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&index_path, body).map_err(|e| Error::path_io(&index_path, e))?;

        debug!(identity, blob = %entry.blob_sha256, "stored package");
        Ok(entry)
    }

    /// Restore a stored package into `dest`, replacing whatever is there.
    /// Verifies the blob digest before unpacking.
    pub fn restore(&self, entry: &StoreEntry, dest: &Path) -> Result<()> {
        let blob_path = self.blob_path(&entry.blob_sha256);
        let (actual, _) = sha256_file(&blob_path)?;
        if actual != entry.blob_sha256 {
            return Err(Error::ChecksumMismatch {
                path: blob_path,
                expected: entry.blob_sha256.clone(),
                actual,
            });
        }

        recreate_dir(dest)?;
        let file = File::open(&blob_path).map_err(|e| Error::path_io(&blob_path, e))?;
        let decoder = zstd::stream::read::Decoder::new(file)?;
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(dest)
            .map_err(|e| Error::path_io(&blob_path, e))?;

        debug!(identity = %entry.identity, dest = %dest.display(), "restored package");
        Ok(())
    }
}

fn write_tar_zst(dir: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest).map_err(|e| Error::path_io(dest, e))?;
    let encoder = zstd::stream::write::Encoder::new(file, 0)?;
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| Error::path_io(dir, e))?;
    let encoder = builder.into_inner().map_err(|e| Error::path_io(dest, e))?;
    encoder.finish().map_err(|e| Error::path_io(dest, e))?;
    Ok(())
}

fn validate_identity(identity: &str) -> Result<()> {
    let ok = !identity.is_empty()
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(Error::Other(format!(
            "invalid store identity '{}'",
            identity
        )));
    }
    Ok(())
}
