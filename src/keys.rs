//! Key resolution for encrypted containers.
//!
//! A [`KeyResolver`] decides where the content key of an encrypted image
//! comes from, and whether the encrypted image must be deleted after use:
//!
//! | Order | Source | Delete encrypted image after run |
//! |-------|--------|----------------------------------|
//! | 1 | key supplied by the caller | yes |
//! | 2 | owner key at `keys/<authority>/<container>.key` | no (the owner already has the plaintext) |
//! | 3 | registry record unwrapped with the user's private key | yes |
//!
//! A caller-supplied key is never proof of ownership, so it is treated
//! like a registry key.

use crate::constants::{OWNER_KEY_EXTENSION, PRIVATE_KEY_FILE};
use crate::crypto::{DecryptionKey, SymmetricKeyMaterial};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Reference to key material kept per (authority, container) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedContainerKeyRef {
    /// Certificate authority that issued the user's key pair.
    pub authority: String,
    /// Identifier of the user's certificate registered with the authority.
    pub certificate: Option<String>,
}

/// Identity of a container as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub id: String,
    pub image: String,
    pub image_hash: Option<String>,
    pub key_ref: Option<EncryptedContainerKeyRef>,
}

impl ContainerIdentity {
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            image_hash: None,
            key_ref: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.image_hash = Some(hash.into());
        self
    }

    pub fn with_key_ref(mut self, key_ref: EncryptedContainerKeyRef) -> Self {
        self.key_ref = Some(key_ref);
        self
    }
}

/// Registry lookup of wrapped container keys.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Returns the wrapped key associated with this user's certificate,
    /// or `None` when the container owner never approved the association.
    async fn container_key(
        &self,
        container_id: &str,
        key_ref: &EncryptedContainerKeyRef,
    ) -> Result<Option<SymmetricKeyMaterial>>;
}

/// Access to the current user's private keys.
pub trait IdentityStore: Send + Sync {
    /// PEM private key issued by `authority`, if the user has one.
    fn private_key_pem(&self, authority: &str) -> Result<Option<Zeroizing<String>>>;
}

/// Private keys stored as `<pki_dir>/<authority>/key.pem`.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    pki_dir: PathBuf,
}

impl FileIdentityStore {
    pub fn new(pki_dir: impl Into<PathBuf>) -> Self {
        Self {
            pki_dir: pki_dir.into(),
        }
    }

    pub fn key_path(&self, authority: &str) -> PathBuf {
        self.pki_dir.join(sanitize_component(authority)).join(PRIVATE_KEY_FILE)
    }
}

impl IdentityStore for FileIdentityStore {
    fn private_key_pem(&self, authority: &str) -> Result<Option<Zeroizing<String>>> {
        let path = self.key_path(authority);
        match std::fs::read_to_string(&path) {
            Ok(pem) => Ok(Some(Zeroizing::new(pem))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Supplied,
    OwnerLocal,
    Registry,
}

/// A usable content key plus the cleanup policy it implies.
#[derive(Debug)]
pub struct ResolvedKey {
    pub key: DecryptionKey,
    pub source: KeySource,
    pub delete_encrypted_after_use: bool,
}

/// Resolves content keys for encrypted containers.
pub struct KeyResolver {
    keys_dir: PathBuf,
    registry: Arc<dyn KeyRegistry>,
    identity: Arc<dyn IdentityStore>,
}

impl KeyResolver {
    pub fn new(
        keys_dir: impl Into<PathBuf>,
        registry: Arc<dyn KeyRegistry>,
        identity: Arc<dyn IdentityStore>,
    ) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            registry,
            identity,
        }
    }

    /// Path of the owner's local key for a container.
    pub fn owner_key_path(&self, authority: &str, container_id: &str) -> PathBuf {
        self.keys_dir
            .join(sanitize_component(authority))
            .join(format!("{}.{}", sanitize_component(container_id), OWNER_KEY_EXTENSION))
    }

    /// Stores an owner key so later runs skip the registry.
    pub fn store_owner_key(&self, authority: &str, container_id: &str, key: &DecryptionKey) -> Result<PathBuf> {
        let path = self.owner_key_path(authority, container_id);
        key.write_to(&path)?;
        info!("Stored owner key for container {}", container_id);
        Ok(path)
    }

    /// Resolves the content key for `identity`.
    pub async fn resolve(
        &self,
        identity: &ContainerIdentity,
        supplied: Option<DecryptionKey>,
    ) -> Result<ResolvedKey> {
        if let Some(key) = supplied {
            debug!("Using caller-supplied key for container {}", identity.id);
            return Ok(ResolvedKey {
                key,
                source: KeySource::Supplied,
                delete_encrypted_after_use: true,
            });
        }

        let key_ref = identity.key_ref.as_ref().ok_or_else(|| Error::MissingContainerKey {
            container: identity.id.clone(),
            guidance: "the container has no issuing authority on record; ask the container \
                       owner to register it for encrypted access"
                .to_string(),
        })?;

        let owner_key = self.owner_key_path(&key_ref.authority, &identity.id);
        if owner_key.is_file() {
            debug!("Using owner key {}", owner_key.display());
            return Ok(ResolvedKey {
                key: DecryptionKey::from_file(&owner_key)?,
                source: KeySource::OwnerLocal,
                delete_encrypted_after_use: false,
            });
        }

        let material = self
            .registry
            .container_key(&identity.id, key_ref)
            .await?
            .ok_or_else(|| Error::MissingContainerKey {
                container: identity.id.clone(),
                guidance: format!(
                    "no key is associated with your certificate from '{}'; request access \
                     from the container owner and wait for approval",
                    key_ref.authority
                ),
            })?;

        let pem = self
            .identity
            .private_key_pem(&key_ref.authority)?
            .ok_or_else(|| Error::MissingContainerKey {
                container: identity.id.clone(),
                guidance: format!(
                    "no private key found for authority '{}'; obtain a client certificate \
                     for this container first",
                    key_ref.authority
                ),
            })?;

        let key = material.unwrap_with(&pem)?;
        debug!("Unwrapped registry key for container {}", identity.id);
        Ok(ResolvedKey {
            key,
            source: KeySource::Registry,
            delete_encrypted_after_use: true,
        })
    }
}

fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
