//! # Docker Hub Manifest Digests
//!
//! The Singularity backend never pulls through a Docker daemon, so it cannot
//! ask one for the digest of a `docker-image` container. Instead the digest
//! is read from the registry API before the image is converted:
//!
//! 1. `GET auth.docker.io/token?service=registry.docker.io&scope=repository:<name>:pull`
//! 2. `GET registry-1.docker.io/v2/<name>/manifests/<tag>` with the bearer token
//! 3. the `docker-content-digest` response header is the digest
//!
//! ## Reference Validation
//!
//! References are checked before any request is built:
//! - Length check against `MAX_IMAGE_REF_LEN` (512 bytes)
//! - Character allowlist (alphanumeric + `/:.-_@`)
//!
//! Official images (`ubuntu:22.04`) are addressed as `library/ubuntu`.

use crate::constants::{
    DOCKER_HUB_AUTH_URL, DOCKER_HUB_REGISTRY_URL, MANIFEST_ACCEPT, MAX_IMAGE_REF_LEN,
    REGISTRY_REQUEST_TIMEOUT,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DIGEST_HEADER: &str = "docker-content-digest";
const DEFAULT_TAG: &str = "latest";

/// Repository and tag of a Docker Hub image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository path, including `library/` for official images.
    pub repository: String,
    /// Tag or `sha256:` digest.
    pub tag: String,
}

impl ImageReference {
    /// Parses and validates `name[:tag]` or `name@sha256:<hex>`.
    pub fn parse(reference: &str) -> Result<Self> {
        validate_reference(reference)?;

        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            (name, digest)
        } else {
            match reference.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => (name, tag),
                _ => (reference, DEFAULT_TAG),
            }
        };

        if name.is_empty() || tag.is_empty() {
            return Err(Error::InvalidContainerSpec(format!(
                "invalid image reference '{}'",
                reference
            )));
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok(Self {
            repository,
            tag: tag.to_string(),
        })
    }
}

fn validate_reference(reference: &str) -> Result<()> {
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidContainerSpec(format!(
            "image reference exceeds {} bytes",
            MAX_IMAGE_REF_LEN
        )));
    }
    if reference.is_empty()
        || !reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidContainerSpec(format!(
            "image reference '{}' contains invalid characters",
            reference
        )));
    }
    Ok(())
}

/// Looks up the content digest of a registry image.
#[async_trait]
pub trait DigestLookup: Send + Sync {
    async fn manifest_digest(&self, image: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Anonymous Docker Hub client.
pub struct DockerHubClient {
    client: reqwest::Client,
    auth_url: String,
    registry_url: String,
}

impl DockerHubClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(REGISTRY_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Communication(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            auth_url: DOCKER_HUB_AUTH_URL.to_string(),
            registry_url: DOCKER_HUB_REGISTRY_URL.to_string(),
        })
    }

    /// Points the client at another token service and registry.
    pub fn with_endpoints(mut self, auth_url: impl Into<String>, registry_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self.registry_url = registry_url.into();
        self
    }

    async fn pull_token(&self, repository: &str) -> Result<String> {
        let scope = format!("repository:{}:pull", repository);
        let response = self
            .client
            .get(&self.auth_url)
            .query(&[("service", "registry.docker.io"), ("scope", scope.as_str())])
            .send()
            .await
            .map_err(|e| Error::Communication(format!("token request for {}: {}", repository, e)))?;
        if !response.status().is_success() {
            return Err(Error::Communication(format!(
                "failed to get token for {}: {}",
                repository,
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Communication(format!("unexpected token response: {}", e)))?;
        Ok(body.token)
    }
}

#[async_trait]
impl DigestLookup for DockerHubClient {
    async fn manifest_digest(&self, image: &str) -> Result<String> {
        let reference = ImageReference::parse(image)?;
        debug!("Resolving digest of {}", image);

        let token = self.pull_token(&reference.repository).await?;
        let url = format!(
            "{}/{}/manifests/{}",
            self.registry_url, reference.repository, reference.tag
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| Error::Communication(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Communication(format!(
                "failed to get manifest of {}: {}",
                image,
                response.status()
            )));
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::Communication(format!("manifest response for {} has no digest", image))
            })?;
        if !digest.starts_with("sha256:") {
            return Err(Error::Communication(format!(
                "unexpected digest format '{}' for {}",
                digest, image
            )));
        }
        debug!("Digest of {} is {}", image, digest);
        Ok(digest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_image_gets_library_prefix() {
        let r = ImageReference::parse("ubuntu:22.04").unwrap();
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.tag, "22.04");
    }

    #[test]
    fn test_default_tag_and_registry_port() {
        let r = ImageReference::parse("mlcommons/hello").unwrap();
        assert_eq!(r.tag, "latest");

        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.repository, "localhost:5000/app");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_digest_reference() {
        let r = ImageReference::parse("org/app@sha256:abcd").unwrap();
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, "sha256:abcd");
    }

    #[test]
    fn test_reference_validation() {
        assert!(ImageReference::parse("nginx :latest").is_err());
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }
}
