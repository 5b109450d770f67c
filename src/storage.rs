//! # Content-Addressed Image Cache
//!
//! Stores container image files by their SHA-256 hash so that containers
//! sharing an image consume disk once.
//!
//! ## Storage Model
//!
//! ```text
//! ~/.cubexec/images/
//! ├── ab/
//! │   └── abcd1234...        (blob content)
//! ├── cd/
//! │   └── cdef5678...
//! └── locks/
//!     └── abcd1234....lock   (held while populating)
//!
//! ~/.cubexec/containers/<id>/image/container_image ──► images/ab/abcd1234...
//! ```
//!
//! The first two hex characters form a "shard" directory to prevent
//! filesystem performance degradation with many files.
//!
//! ## Concurrency
//!
//! Populating an entry happens under an exclusive advisory lock on
//! `locks/<hash>.lock` (see [`ImageCache::lock`]). Callers check for the
//! blob only after taking the lock, so concurrent first-time acquisitions of
//! one hash, from threads or processes, perform a single download.
//! Publication itself is a rename from a uniquely named temp file, so a
//! reader never observes a partial blob.
//!
//! ## Eviction
//!
//! Entries are immutable and never evicted automatically. A missing blob
//! means "download again", never an error.

use crate::constants::{IO_CHUNK_SIZE, LOCKS_DIR};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Shared, content-addressed store for image files.
///
/// ## Thread Safety
///
/// `ImageCache` holds no in-memory state beyond its base path and is safe
/// to share behind an `Arc`. Cross-process exclusion relies on `flock`.
#[derive(Debug, Clone)]
pub struct ImageCache {
    base_dir: PathBuf,
}

impl ImageCache {
    /// Creates a cache rooted at `base_dir`.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join(LOCKS_DIR)).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        info!("Image cache initialized at: {}", base_dir.display());

        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, hash: &str) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Gets a blob path without reading it.
    ///
    /// # Security
    ///
    /// Only hexadecimal characters survive into the path; an optional
    /// `sha256:` prefix is ignored.
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        let safe_hash = sanitize_hash(hash);
        if safe_hash.is_empty() {
            // A path that won't exist rather than a panic.
            return self.base_dir.join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(prefix).join(&safe_hash)
    }

    /// Takes the exclusive population lock for `hash`.
    ///
    /// Blocks (on a blocking-pool thread) until any other holder, in this
    /// process or another one, releases it.
    pub async fn lock(&self, hash: &str) -> Result<CacheLock> {
        let path = self
            .base_dir
            .join(LOCKS_DIR)
            .join(format!("{}.lock", sanitize_hash(hash)));
        tokio::task::spawn_blocking(move || CacheLock::acquire(path))
            .await
            .map_err(|e| Error::Internal(format!("lock task failed: {}", e)))?
    }

    /// Moves `src` into the cache under `hash`.
    ///
    /// An existing blob wins; `src` is then discarded.
    pub fn publish(&self, hash: &str, src: &Path) -> Result<PathBuf> {
        let path = self.blob_path(hash);
        if path.is_file() {
            debug!("Blob {} already exists", hash);
            remove_path(src)?;
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        publish_file(src, &path)?;
        debug!("Stored blob {}", hash);
        Ok(path)
    }

    /// Points `link_path` at the blob for `hash`, replacing any stale link.
    pub fn link(&self, hash: &str, link_path: &Path) -> Result<()> {
        let target = self.blob_path(hash);
        if !target.is_file() {
            return Err(Error::Internal(format!("cannot link missing blob {}", hash)));
        }
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Ok(existing) = fs::read_link(link_path)
            && existing == target
        {
            return Ok(());
        }
        remove_path(link_path)?;
        symlink(&target, link_path)?;
        debug!("Linked {} -> {}", link_path.display(), target.display());
        Ok(())
    }

    /// Removes a blob.
    pub fn remove_blob(&self, hash: &str) -> Result<()> {
        remove_path(&self.blob_path(hash))
    }

    /// Lists all blob hashes.
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        for shard in fs::read_dir(&self.base_dir)? {
            let shard = shard?.path();
            if !shard.is_dir() || shard.file_name().is_some_and(|n| n == LOCKS_DIR) {
                continue;
            }
            for entry in fs::read_dir(&shard)? {
                let path = entry?.path();
                if path.is_file()
                    && let Some(hash) = path.file_name().and_then(|n| n.to_str())
                    && hash.chars().all(|c| c.is_ascii_hexdigit())
                {
                    hashes.push(hash.to_string());
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}

/// Exclusive advisory lock on one cache entry.
///
/// Released when dropped.
#[derive(Debug)]
pub struct CacheLock {
    _file: fs::File,
    path: PathBuf,
}

impl CacheLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::StorageWriteFailed(format!("{}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is owned by `file` for the lifetime of the guard.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(Error::StorageWriteFailed(format!(
                    "flock {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
        }

        debug!("Acquired cache lock {}", path.display());
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sanitize_hash(hash: &str) -> String {
    let hash = hash.strip_prefix("sha256:").unwrap_or(hash);
    let safe: String = hash
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if safe.len() != hash.len() {
        warn!("Hash contained non-hex characters, sanitized: {} -> {}", hash, safe);
    }
    safe
}

// =============================================================================
// File Helpers
// =============================================================================

/// Computes the hex SHA-256 of a file, streaming it in chunks.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Removes a file, symlink or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Moves `src` to `dst` atomically.
///
/// Across filesystems the content is first copied next to `dst` under a
/// unique name and then renamed, so `dst` is never partially written.
pub fn publish_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let temp_path = dst.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::copy(src, &temp_path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    fs::rename(&temp_path, dst).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::StorageWriteFailed(e.to_string())
    })?;
    remove_path(src)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    fs::copy(target, link)?;
    Ok(())
}
