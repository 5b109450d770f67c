//! Pluggable resource sources.
//!
//! | Source | Resource string | Notes |
//! |--------|-----------------|-------|
//! | [`DirectLinkSource`] | `https://...` or `direct:https://...` | streamed, retried |
//! | [`LocalFileSource`] | existing path, no prefix | copied |
//! | [`InMemorySource`] | `memory:<name>` | registered buffers |
//! | [`DataCommonsSource`] | `synapse:syn<digits>` | authenticated client |

use super::RetryPolicy;
use crate::constants::{DATA_COMMONS_SOURCE_PREFIX, DIRECT_SOURCE_PREFIX, MEMORY_SOURCE_PREFIX};
use crate::error::{Error, Result};
use crate::storage::{publish_file, remove_path};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A place resources can be downloaded from.
#[async_trait]
pub trait Source: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Returns the source-specific identifier if the resource string
    /// belongs to this source.
    fn validate_resource(&self, resource: &str) -> Option<String>;

    /// Establishes a session. A no-op for anonymous sources.
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    /// Writes the resource to `output`.
    async fn download(&self, identifier: &str, output: &Path) -> Result<()>;
}

/// Splits `prefix:rest`, returning `rest` only for a matching prefix.
fn strip_source_prefix<'a>(resource: &'a str, prefix: &str) -> Option<&'a str> {
    resource
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
}

// =============================================================================
// Direct Link
// =============================================================================

/// Plain HTTP(S) download with bounded retries.
pub struct DirectLinkSource {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl DirectLinkSource {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Communication(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn download_once(&self, url: &str, output: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Communication(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Communication(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(output).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| Error::Communication(format!("reading body of {}: {}", url, e)))?;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Source for DirectLinkSource {
    fn name(&self) -> &str {
        "direct link"
    }

    fn validate_resource(&self, resource: &str) -> Option<String> {
        let candidate = strip_source_prefix(resource, DIRECT_SOURCE_PREFIX).unwrap_or(resource);
        let url = reqwest::Url::parse(candidate).ok()?;
        (matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
            .then(|| candidate.to_string())
    }

    async fn download(&self, identifier: &str, output: &Path) -> Result<()> {
        info!("Downloading {}", identifier);
        self.policy
            .retry(identifier, output, |_| self.download_once(identifier, output))
            .await
    }
}

// =============================================================================
// Local File
// =============================================================================

/// An existing file on this machine, referenced by bare path.
#[derive(Debug, Default)]
pub struct LocalFileSource;

#[async_trait]
impl Source for LocalFileSource {
    fn name(&self) -> &str {
        "local file"
    }

    fn validate_resource(&self, resource: &str) -> Option<String> {
        if resource.is_empty() || has_scheme_prefix(resource) {
            return None;
        }
        Path::new(resource).is_file().then(|| resource.to_string())
    }

    async fn download(&self, identifier: &str, output: &Path) -> Result<()> {
        debug!("Copying local file {}", identifier);
        tokio::fs::copy(identifier, output).await?;
        Ok(())
    }
}

fn has_scheme_prefix(resource: &str) -> bool {
    match resource.split_once(':') {
        Some((prefix, _)) => {
            prefix.len() > 1 && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
        }
        None => false,
    }
}

// =============================================================================
// In-Memory
// =============================================================================

/// Buffers registered by name, addressed as `memory:<name>`.
#[derive(Debug, Default)]
pub struct InMemorySource {
    buffers: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a buffer and returns its resource string.
    pub fn register(&self, name: &str, data: impl Into<Vec<u8>>) -> String {
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(data.into()));
        format!("{}:{}", MEMORY_SOURCE_PREFIX, name)
    }

    fn get(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl Source for InMemorySource {
    fn name(&self) -> &str {
        "in-memory buffer"
    }

    fn validate_resource(&self, resource: &str) -> Option<String> {
        let name = strip_source_prefix(resource, MEMORY_SOURCE_PREFIX)?;
        self.get(name).map(|_| name.to_string())
    }

    async fn download(&self, identifier: &str, output: &Path) -> Result<()> {
        let data = self.get(identifier).ok_or_else(|| Error::CommunicationRetrieval {
            resource: format!("{}:{}", MEMORY_SOURCE_PREFIX, identifier),
            attempts: 1,
            reason: "buffer is no longer registered".to_string(),
        })?;
        tokio::fs::write(output, data.as_slice()).await?;
        Ok(())
    }
}

// =============================================================================
// Data Commons
// =============================================================================

/// Client of the external data-commons platform.
#[async_trait]
pub trait DataCommonsClient: Send + Sync {
    /// Opens an authenticated session.
    async fn login(&self) -> Result<()>;

    /// Downloads entity `id` into `dir`, returning the file name the
    /// platform chose.
    async fn get(&self, id: &str, dir: &Path) -> Result<String>;
}

/// `synapse:syn<digits>` entities fetched through a [`DataCommonsClient`].
pub struct DataCommonsSource {
    client: Arc<dyn DataCommonsClient>,
    authenticated: Mutex<bool>,
}

impl DataCommonsSource {
    pub fn new(client: Arc<dyn DataCommonsClient>) -> Self {
        Self {
            client,
            authenticated: Mutex::new(false),
        }
    }
}

#[async_trait]
impl Source for DataCommonsSource {
    fn name(&self) -> &str {
        "synapse"
    }

    fn validate_resource(&self, resource: &str) -> Option<String> {
        let id = strip_source_prefix(resource, DATA_COMMONS_SOURCE_PREFIX)?;
        let digits = id.strip_prefix("syn")?;
        (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
    }

    async fn authenticate(&self) -> Result<()> {
        let mut authenticated = self.authenticated.lock().await;
        if *authenticated {
            return Ok(());
        }
        self.client
            .login()
            .await
            .map_err(|e| Error::CommunicationAuthentication {
                source_name: self.name().to_string(),
                reason: e.to_string(),
            })?;
        *authenticated = true;
        Ok(())
    }

    async fn download(&self, identifier: &str, output: &Path) -> Result<()> {
        let dir: PathBuf = output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = self.client.get(identifier, &dir).await?;
        let downloaded = dir.join(&file_name);
        if !downloaded.is_file() {
            return Err(Error::CommunicationRetrieval {
                resource: identifier.to_string(),
                attempts: 1,
                reason: format!("expected downloaded file {} is missing", downloaded.display()),
            });
        }
        if downloaded != output {
            remove_path(output)?;
            publish_file(&downloaded, output)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_link_accepts_urls() {
        let source = DirectLinkSource::new(RetryPolicy::default(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            source.validate_resource("https://example.com/a.tar"),
            Some("https://example.com/a.tar".to_string())
        );
        assert_eq!(
            source.validate_resource("direct:https://example.com/a.tar"),
            Some("https://example.com/a.tar".to_string())
        );
        assert_eq!(source.validate_resource("direct:some string"), None);
        assert_eq!(source.validate_resource("direct:syn4444"), None);
    }

    #[test]
    fn test_scheme_prefix_detection() {
        assert!(has_scheme_prefix("synapse:syn1"));
        assert!(!has_scheme_prefix("/tmp/file"));
        assert!(!has_scheme_prefix("C:/file"));
    }

    #[test]
    fn test_memory_source_survives_poisoned_lock() {
        let source = Arc::new(InMemorySource::new());
        let poisoner = Arc::clone(&source);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.buffers.write().unwrap();
            panic!("poison the buffer map");
        })
        .join();
        assert!(source.buffers.is_poisoned());

        let resource = source.register("weights", b"data".to_vec());

        assert_eq!(resource, "memory:weights");
        assert_eq!(source.validate_resource(&resource).as_deref(), Some("weights"));
    }
}
