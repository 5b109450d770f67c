//! # Resource Acquisition
//!
//! Resolves a resource string to a [`Source`], downloads it into scratch
//! space, verifies its hash and publishes it with a rename.
//!
//! ## Flow
//!
//! ```text
//! "direct:https://.../img.tar"
//!        │ parse_resource (first source whose validate_resource matches)
//!        ▼
//!   Source::authenticate ─► Source::download ─► tmp/download.<uuid>
//!                                                    │ sha256
//!                                    expected hash? ─┤ mismatch ─► InvalidEntity, tmp removed
//!                                                    ▼
//!                                      rename ─► permanent output path
//! ```
//!
//! Container images take one more step: the file is stored once in the
//! shared [`ImageCache`] under its hash and each container gets a symlink
//! (see [`ResourceFetcher::get_image`]).

pub mod retry;
pub mod sources;

pub use self::retry::RetryPolicy;
pub use self::sources::{
    DataCommonsClient, DataCommonsSource, DirectLinkSource, InMemorySource, LocalFileSource,
    Source,
};

use crate::config::EngineConfig;
use crate::constants::{
    ADDITIONAL_FILES_DIR, CACHE_METADATA_FILE, CONTAINER_IMAGE_DIR, CONTAINER_IMAGE_LINK,
    CONTAINER_MANIFEST_FILE, PARAMETERS_FILE,
};
use crate::error::{Error, Result};
use crate::storage::{ImageCache, file_hash, publish_file, remove_path};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const TARBALL_FILE: &str = "additional_files.tar.gz";

/// An image file stored in the shared cache and linked into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    /// Per-container symlink.
    pub path: PathBuf,
    /// SHA-256 of the image file.
    pub hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheMetadata {
    #[serde(default)]
    additional_files_cached_hash: Option<String>,
}

/// Downloads resources through registered sources into verified storage.
pub struct ResourceFetcher {
    sources: Vec<Arc<dyn Source>>,
    tmp_dir: PathBuf,
    cache: ImageCache,
}

impl ResourceFetcher {
    /// Creates a fetcher with no sources.
    pub fn new(tmp_dir: PathBuf, cache: ImageCache) -> Result<Self> {
        fs::create_dir_all(&tmp_dir).map_err(|e| Error::StorageInitFailed {
            path: tmp_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            sources: Vec::new(),
            tmp_dir,
            cache,
        })
    }

    /// Creates a fetcher with the direct-link and local-file sources.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let cache = ImageCache::with_path(config.images_dir.clone())?;
        let direct = DirectLinkSource::new(config.download.clone(), config.download_timeout)?;
        Ok(Self::new(config.tmp_dir.clone(), cache)?
            .with_source(Arc::new(direct))
            .with_source(Arc::new(LocalFileSource)))
    }

    /// Appends a source. Sources are tried in registration order.
    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Returns the first source recognizing `resource` and its identifier.
    pub fn parse_resource(&self, resource: &str) -> Result<(Arc<dyn Source>, String)> {
        self.sources
            .iter()
            .find_map(|source| {
                source
                    .validate_resource(resource)
                    .map(|id| (Arc::clone(source), id))
            })
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "resource '{}' is not recognized by any source ({})",
                    resource,
                    self.sources
                        .iter()
                        .map(|s| s.name().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    /// Downloads `resource` to `output` and returns its hash.
    ///
    /// The download lands in scratch space first. With `expected_hash` set,
    /// a mismatch fails with [`Error::InvalidEntity`] and `output` is never
    /// touched.
    pub async fn download_resource(
        &self,
        resource: &str,
        output: &Path,
        expected_hash: Option<&str>,
    ) -> Result<String> {
        let (source, identifier) = self.parse_resource(resource)?;
        source.authenticate().await?;

        let tmp = self.tmp_path("download");
        if let Err(e) = source.download(&identifier, &tmp).await {
            remove_path(&tmp)?;
            return Err(e);
        }

        let hash = match hash_file(tmp.clone()).await {
            Ok(hash) => hash,
            Err(e) => {
                remove_path(&tmp)?;
                return Err(e);
            }
        };
        if let Some(expected) = expected_hash
            && !hashes_match(expected, &hash)
        {
            remove_path(&tmp)?;
            return Err(Error::InvalidEntity {
                subject: resource.to_string(),
                expected: expected.to_string(),
                found: hash,
            });
        }

        publish_file(&tmp, output)?;
        debug!("Fetched {} -> {} ({})", resource, output.display(), hash);
        Ok(hash)
    }

    /// Downloads a small file unless `output` already matches `expected_hash`.
    pub async fn get_regular_file(
        &self,
        resource: &str,
        output: &Path,
        expected_hash: Option<&str>,
    ) -> Result<String> {
        if let Some(expected) = expected_hash
            && output.is_file()
        {
            let found = hash_file(output.to_path_buf()).await?;
            if hashes_match(expected, &found) {
                debug!("{} exists and is up to date", output.display());
                return Ok(found);
            }
            debug!("{} exists but is out of date", output.display());
        }
        remove_path(output)?;
        self.download_resource(resource, output, expected_hash).await
    }

    /// Fetches a container's manifest into its storage directory.
    pub async fn get_container_manifest(
        &self,
        resource: &str,
        container_dir: &Path,
        expected_hash: Option<&str>,
    ) -> Result<(PathBuf, String)> {
        let output = container_dir.join(CONTAINER_MANIFEST_FILE);
        let hash = self.get_regular_file(resource, &output, expected_hash).await?;
        Ok((output, hash))
    }

    /// Fetches a container's parameters file into its workspace.
    pub async fn get_parameters_file(
        &self,
        resource: &str,
        container_dir: &Path,
        expected_hash: Option<&str>,
    ) -> Result<(PathBuf, String)> {
        let output = container_dir.join("workspace").join(PARAMETERS_FILE);
        let hash = self.get_regular_file(resource, &output, expected_hash).await?;
        Ok((output, hash))
    }

    /// Fetches an image file through the shared cache.
    ///
    /// The blob is downloaded at most once per hash; the container's
    /// `image/container_image` link is (re)created to point at it.
    pub async fn get_image(
        &self,
        resource: &str,
        container_dir: &Path,
        expected_hash: Option<&str>,
    ) -> Result<CachedImage> {
        let link = container_dir
            .join(CONTAINER_IMAGE_DIR)
            .join(CONTAINER_IMAGE_LINK);
        // Possibly a broken link from a previous hash.
        if fs::symlink_metadata(&link).is_ok_and(|m| m.file_type().is_symlink()) {
            fs::remove_file(&link)?;
        }

        let hash = match expected_hash.filter(|h| !h.is_empty()) {
            Some(expected) => {
                let hash = normalize_hash(expected);
                let _lock = self.cache.lock(&hash).await?;
                if self.cache.has_blob(&hash) {
                    debug!("Image {} already cached", hash);
                } else {
                    let blob = self.cache.blob_path(&hash);
                    self.download_resource(resource, &blob, Some(&hash)).await?;
                }
                hash
            }
            None => {
                let tmp = self.tmp_path("image");
                let hash = self.download_resource(resource, &tmp, None).await?;
                let _lock = self.cache.lock(&hash).await?;
                self.cache.publish(&hash, &tmp)?;
                hash
            }
        };

        self.cache.link(&hash, &link)?;
        info!("Image {} linked into {}", hash, container_dir.display());
        Ok(CachedImage { path: link, hash })
    }

    /// Fetches and extracts a container's additional files tarball.
    ///
    /// Skipped when the extracted folder exists and the recorded tarball
    /// hash matches `expected_hash`.
    pub async fn get_additional_files(
        &self,
        resource: &str,
        container_dir: &Path,
        expected_hash: Option<&str>,
    ) -> Result<String> {
        let folder = container_dir.join(ADDITIONAL_FILES_DIR);
        let metadata_path = container_dir.join(CACHE_METADATA_FILE);

        if let Some(expected) = expected_hash
            && folder.exists()
            && read_cache_metadata(&metadata_path)?
                .additional_files_cached_hash
                .is_some_and(|cached| hashes_match(expected, &cached))
        {
            debug!("{} exists and is up to date", folder.display());
            return Ok(expected.to_string());
        }

        let (staging, hash) = self.fetch_and_extract(resource, expected_hash).await?;
        remove_path(&folder)?;
        fs::create_dir_all(container_dir)?;
        fs::rename(&staging, &folder)?;

        let metadata = CacheMetadata {
            additional_files_cached_hash: Some(hash.clone()),
        };
        fs::write(&metadata_path, serde_yaml::to_string(&metadata)?)?;
        Ok(hash)
    }

    /// Fetches and extracts a demo dataset tarball into `demo_root/<hash>`.
    pub async fn get_demo_dataset(
        &self,
        resource: &str,
        demo_root: &Path,
        expected_hash: Option<&str>,
    ) -> Result<(PathBuf, String)> {
        if let Some(expected) = expected_hash {
            let folder = demo_root.join(normalize_hash(expected));
            if folder.is_dir() {
                return Ok((folder, expected.to_string()));
            }
        }

        let (staging, hash) = self.fetch_and_extract(resource, expected_hash).await?;
        let folder = demo_root.join(&hash);
        remove_path(&folder)?;
        fs::create_dir_all(demo_root)?;
        fs::rename(&staging, &folder)?;
        Ok((folder, hash))
    }

    async fn fetch_and_extract(
        &self,
        resource: &str,
        expected_hash: Option<&str>,
    ) -> Result<(PathBuf, String)> {
        let staging = self.tmp_path("extract");
        fs::create_dir_all(&staging)?;
        let tarball = staging.join(TARBALL_FILE);

        let result = async {
            let hash = self
                .download_resource(resource, &tarball, expected_hash)
                .await?;
            let (dir, archive) = (staging.clone(), tarball.clone());
            tokio::task::spawn_blocking(move || untar(&archive, &dir))
                .await
                .map_err(|e| Error::Internal(format!("extract task failed: {}", e)))??;
            Ok::<String, Error>(hash)
        }
        .await;

        match result {
            Ok(hash) => Ok((staging, hash)),
            Err(e) => {
                remove_path(&staging)?;
                Err(e)
            }
        }
    }

    fn tmp_path(&self, label: &str) -> PathBuf {
        self.tmp_dir
            .join(format!("{}.{}", label, uuid::Uuid::now_v7()))
    }
}

/// Extracts a gzip tarball next to itself and removes the tarball.
fn untar(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest)
        .map_err(|e| Error::InvalidEntity {
            subject: archive_path.display().to_string(),
            expected: "gzip tarball".to_string(),
            found: e.to_string(),
        })?;
    remove_path(archive_path)
}

fn read_cache_metadata(path: &Path) -> Result<CacheMetadata> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(serde_yaml::from_str(&text).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheMetadata::default()),
        Err(e) => Err(e.into()),
    }
}

async fn hash_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || file_hash(&path))
        .await
        .map_err(|e| Error::Internal(format!("hash task failed: {}", e)))?
}

fn normalize_hash(hash: &str) -> String {
    hash.strip_prefix("sha256:")
        .unwrap_or(hash)
        .to_ascii_lowercase()
}

/// Compares hashes ignoring case and an optional `sha256:` prefix.
pub fn hashes_match(expected: &str, found: &str) -> bool {
    normalize_hash(expected) == normalize_hash(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashes_match_ignores_prefix_and_case() {
        assert!(hashes_match("sha256:ABCD", "abcd"));
        assert!(!hashes_match("abcd", "abce"));
    }
}
