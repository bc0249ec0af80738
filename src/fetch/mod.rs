//! Upstream artifact fetching, integrity checking, and unpacking.
//!
//! Downloads land in a shared cache directory keyed per recipe; a cached
//! archive whose digest still matches is reused without touching the
//! network. Integrity checking is fail-closed by default: a recipe that
//! declares no sha256 is rejected unless the policy is relaxed to `Warn`,
//! and an actual mismatch is fatal under either policy.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::fsutil::{atomic_move, sha256_file};
use crate::recipe::{Recipe, SourceSection};

/// What to do when a recipe declares no source checksum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Fail closed: an undeclared checksum is an error.
    #[default]
    Require,
    /// Log a warning and fetch anyway. Mismatches still fail.
    Warn,
}

/// Downloads upstream artifacts into a shared cache.
#[derive(Debug, Clone)]
pub struct Fetcher {
    cache_dir: PathBuf,
    policy: ChecksumPolicy,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>, policy: ChecksumPolicy) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            policy,
        }
    }

    /// Fetch a recipe's source artifact into the cache, verifying its
    /// digest, and return the cached path.
    pub fn fetch(&self, recipe: &Recipe) -> Result<PathBuf> {
        let source = &recipe.source;
        match (&source.sha256, self.policy) {
            (None, ChecksumPolicy::Require) => {
                return Err(Error::ChecksumMissing {
                    recipe: recipe.package.name.clone(),
                });
            }
            (None, ChecksumPolicy::Warn) => {
                warn!(
                    recipe = %recipe.package.name,
                    url = %source.url,
                    "no sha256 declared for source archive; fetching unverified"
                );
            }
            (Some(_), _) => {}
        }

        let dest_dir = self.cache_dir.join(&recipe.package.name);
        fs::create_dir_all(&dest_dir).map_err(|e| Error::path_io(&dest_dir, e))?;
        let dest = dest_dir.join(recipe.archive_filename());

        if dest.exists() {
            match self.verify(&dest, source) {
                Ok(()) => {
                    debug!(path = %dest.display(), "reusing cached source archive");
                    return Ok(dest);
                }
                Err(_) => {
                    // Stale or truncated cache entry; refetch once.
                    warn!(path = %dest.display(), "cached archive failed verification, refetching");
                    fs::remove_file(&dest).map_err(|e| Error::path_io(&dest, e))?;
                }
            }
        }

        self.download(&source.url, &dest)?;
        self.verify(&dest, source)?;
        info!(url = %source.url, path = %dest.display(), "fetched source archive");
        Ok(dest)
    }

    fn download(&self, raw_url: &str, dest: &Path) -> Result<()> {
        let fetch_err = |reason: String| Error::Fetch {
            url: raw_url.to_string(),
            reason,
        };

        let url = Url::parse(raw_url).map_err(|e| fetch_err(e.to_string()))?;
        let tmp = dest.with_extension("part");

        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| fetch_err("not a usable file path".to_string()))?;
                fs::copy(&path, &tmp)
                    .map_err(|e| fetch_err(format!("copying '{}': {}", path.display(), e)))?;
            }
            "http" | "https" => {
                let response = reqwest::blocking::get(url.clone())
                    .map_err(|e| fetch_err(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(fetch_err(format!("HTTP status {}", response.status())));
                }
                let bytes = response.bytes().map_err(|e| fetch_err(e.to_string()))?;
                fs::write(&tmp, &bytes).map_err(|e| Error::path_io(&tmp, e))?;
            }
            other => {
                return Err(fetch_err(format!("unsupported URL scheme '{}'", other)));
            }
        }

        atomic_move(&tmp, dest)
    }

    fn verify(&self, path: &Path, source: &SourceSection) -> Result<()> {
        let Some(expected) = &source.sha256 else {
            return Ok(());
        };
        let (actual, _) = sha256_file(path)?;
        if actual != expected.to_ascii_lowercase() {
            return Err(Error::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Unpack a fetched archive into `dest_dir`.
///
/// Archive kind is chosen by file name: `.tar.gz`/`.tgz`, `.tar.zst`, and
/// plain `.tar` unpack as tarballs; anything else is treated as a single
/// file and copied in as-is. When `declared_root` is set, the named
/// directory must exist after unpacking.
pub fn unpack(archive: &Path, dest_dir: &Path, declared_root: Option<&str>) -> Result<()> {
    fs::create_dir_all(dest_dir).map_err(|e| Error::path_io(dest_dir, e))?;

    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let open = || -> Result<BufReader<File>> {
        Ok(BufReader::new(
            File::open(archive).map_err(|e| Error::path_io(archive, e))?,
        ))
    };

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let mut tarball = tar::Archive::new(GzDecoder::new(open()?));
        tarball
            .unpack(dest_dir)
            .map_err(|e| Error::path_io(archive, e))?;
    } else if name.ends_with(".tar.zst") {
        let decoder = zstd::stream::read::Decoder::new(open()?)?;
        let mut tarball = tar::Archive::new(decoder);
        tarball
            .unpack(dest_dir)
            .map_err(|e| Error::path_io(archive, e))?;
    } else if name.ends_with(".tar") {
        let mut tarball = tar::Archive::new(open()?);
        tarball
            .unpack(dest_dir)
            .map_err(|e| Error::path_io(archive, e))?;
    } else {
        let dest = dest_dir.join(name);
        fs::copy(archive, &dest).map_err(|e| Error::path_io(&dest, e))?;
    }

    if let Some(root) = declared_root {
        let expected = dest_dir.join(root);
        if !expected.is_dir() {
            return Err(Error::SourceRootMissing {
                expected,
                archive: archive.to_path_buf(),
            });
        }
    }

    debug!(archive = %archive.display(), dest = %dest_dir.display(), "unpacked source");
    Ok(())
}
