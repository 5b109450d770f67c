//! # Private Runner
//!
//! Runs encrypted images by composing the decryption engine with any
//! [`ImageBackend`]:
//!
//! ```text
//! download():  get_image ──► <container>/image/container_image ──► shared cache blob
//!
//! run():       KeyResolver::resolve
//!                  │
//!                  ▼
//!              AES-GCM stream ──► container_image_decrypted
//!                  │
//!                  ▼
//!              backend.stage ──► backend.run_image
//!                  │
//!                  ▼ (always)
//!              cleanup: decrypted file, staged artifacts,
//!                       encrypted image link unless the key is the owner's
//! ```
//!
//! Cleanup runs on every exit path. Missing files are not errors.

use super::RunnerContext;
use crate::constants::DECRYPTED_SUFFIX;
use crate::crypto::{self, DecryptionKey};
use crate::error::{Error, Result};
use crate::keys::{ContainerIdentity, KeyResolver};
use crate::resources::CachedImage;
use crate::runtime::{
    ArchiveFormat, ExecutionPlan, ImageBackend, ImageHashes, RunRequest, Runner, RunnerState,
    StagedImage,
};
use crate::storage::remove_path;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key context of an encrypted container.
pub struct PrivateContext {
    pub identity: ContainerIdentity,
    pub keys: Arc<KeyResolver>,
    /// Key handed over directly by the caller, used once.
    pub supplied_key: Option<DecryptionKey>,
}

impl PrivateContext {
    pub fn new(identity: ContainerIdentity, keys: Arc<KeyResolver>) -> Self {
        Self {
            identity,
            keys,
            supplied_key: None,
        }
    }

    pub fn with_supplied_key(mut self, key: DecryptionKey) -> Self {
        self.supplied_key = Some(key);
        self
    }
}

/// Artifacts to remove once a run is over.
#[derive(Debug)]
struct Cleanup {
    decrypted: PathBuf,
    staged: Option<StagedImage>,
    delete_encrypted: bool,
}

/// Runner for encrypted container types.
pub struct PrivateRunner<B: ImageBackend> {
    ctx: RunnerContext,
    backend: B,
    private: PrivateContext,
    format: ArchiveFormat,
    state: RunnerState,
    image: Option<CachedImage>,
}

impl<B: ImageBackend> PrivateRunner<B> {
    pub fn new(ctx: RunnerContext, backend: B, private: PrivateContext, format: ArchiveFormat) -> Self {
        Self {
            ctx,
            backend,
            private,
            format,
            state: RunnerState::Uninitialized,
            image: None,
        }
    }

    /// The downloaded encrypted image, if any.
    pub fn encrypted_image(&self) -> Option<&CachedImage> {
        self.image.as_ref()
    }

    async fn decrypt_and_run(
        &mut self,
        encrypted: &Path,
        task: &str,
        request: &RunRequest,
        cleanup: &mut Cleanup,
    ) -> Result<()> {
        // Validate the task before any plaintext exists.
        let plan = ExecutionPlan::prepare(&self.ctx.manifest, &self.ctx.engine, task, request)?;

        // Until a key proves ownership, the caller is not the owner.
        cleanup.delete_encrypted = true;
        let resolved = self
            .private
            .keys
            .resolve(&self.private.identity, self.private.supplied_key.take())
            .await?;
        cleanup.delete_encrypted = resolved.delete_encrypted_after_use;
        debug!(
            "Key for {} resolved from {:?}",
            self.private.identity.id, resolved.source
        );

        let (input, output) = (encrypted.to_path_buf(), cleanup.decrypted.clone());
        tokio::task::spawn_blocking(move || crypto::decrypt_file(resolved.key, &input, &output))
            .await
            .map_err(|e| Error::Internal(format!("decryption task failed: {}", e)))??;
        info!("Decrypted image of {}", self.private.identity.id);

        let staged = self.backend.stage(&cleanup.decrypted, self.format).await?;
        let reference = staged.reference.clone();
        cleanup.staged = Some(staged);

        // The staged form is all the backend needs from here on.
        if reference != cleanup.decrypted.display().to_string() {
            remove_path(&cleanup.decrypted)?;
        }

        self.backend.run_image(&reference, &plan).await
    }

    async fn clean_up(&self, image: &CachedImage, cleanup: Cleanup) {
        if let Err(e) = remove_path(&cleanup.decrypted) {
            warn!("Failed to remove {}: {}", cleanup.decrypted.display(), e);
        }
        if let Some(staged) = &cleanup.staged {
            self.backend.unstage(staged).await;
        }
        // Only this container's link goes; the cached blob may back others.
        if cleanup.delete_encrypted {
            debug!("Unlinking encrypted image {}", image.hash);
            if let Err(e) = remove_path(&image.path) {
                warn!("Failed to remove {}: {}", image.path.display(), e);
            }
        }
    }
}

#[async_trait]
impl<B: ImageBackend> Runner for PrivateRunner<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn state(&self) -> RunnerState {
        self.state
    }

    async fn download(&mut self, hashes: &ImageHashes) -> Result<String> {
        let cached = self.ctx.fetch_image_file(hashes).await?;
        let hash = cached.hash.clone();
        self.image = Some(cached);
        self.state = RunnerState::Downloaded;
        Ok(hash)
    }

    async fn run(&mut self, task: &str, request: &RunRequest) -> Result<()> {
        let image = self
            .image
            .clone()
            .ok_or_else(|| Error::Internal("run called before download".to_string()))?;
        self.state = RunnerState::Running;

        let mut decrypted = image.path.clone().into_os_string();
        decrypted.push(DECRYPTED_SUFFIX);
        let mut cleanup = Cleanup {
            decrypted: PathBuf::from(decrypted),
            staged: None,
            delete_encrypted: false,
        };

        let result = self
            .decrypt_and_run(&image.path, task, request, &mut cleanup)
            .await;
        let deleted = cleanup.delete_encrypted;
        self.clean_up(&image, cleanup).await;
        if deleted {
            // A later run needs a fresh download.
            self.image = None;
        }

        self.state = if result.is_ok() {
            RunnerState::Completed
        } else {
            RunnerState::Failed
        };
        result
    }
}
