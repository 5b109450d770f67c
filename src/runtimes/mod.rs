//! Runner backends and the runner factory.
//!
//! | Container type | docker | singularity |
//! |----------------|--------|-------------|
//! | `docker-image` | [`DockerRunner`] | [`SingularityRunner`] |
//! | `docker-archive` | [`DockerRunner`] | [`SingularityRunner`] |
//! | `encrypted-docker-archive` | [`PrivateRunner`]<[`DockerCli`]> | [`PrivateRunner`]<[`SingularityCli`]> |
//! | `singularity-file` | rejected | [`SingularityRunner`] |
//! | `encrypted-singularity-file` | rejected | [`PrivateRunner`]<[`SingularityCli`]> |

pub mod docker;
pub mod private;
pub mod singularity;

pub use self::docker::{DockerCli, DockerRunner};
pub use self::private::{PrivateContext, PrivateRunner};
pub use self::singularity::{SingularityCli, SingularityFamily, SingularityInstall, SingularityRunner};

use crate::config::{EngineConfig, RuntimeKind};
use crate::error::{Error, Result};
use crate::manifest::ContainerConfig;
use crate::process::{CommandExecutor, ProcessExecutor};
use crate::registry::{DigestLookup, DockerHubClient};
use crate::resources::{CachedImage, ResourceFetcher};
use crate::runtime::{ArchiveFormat, ImageHashes, Runner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Everything a runner needs besides its backend.
#[derive(Clone)]
pub struct RunnerContext {
    pub manifest: Arc<ContainerConfig>,
    pub engine: Arc<EngineConfig>,
    pub fetcher: Arc<ResourceFetcher>,
    pub executor: Arc<dyn CommandExecutor>,
    pub digests: Arc<dyn DigestLookup>,
    /// Per-container storage root.
    pub container_dir: PathBuf,
}

impl RunnerContext {
    /// Context running real subprocesses against Docker Hub.
    pub fn new(
        manifest: Arc<ContainerConfig>,
        engine: Arc<EngineConfig>,
        fetcher: Arc<ResourceFetcher>,
        container_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            manifest,
            engine,
            fetcher,
            executor: Arc::new(ProcessExecutor::new()),
            digests: Arc::new(DockerHubClient::new()?),
            container_dir: container_dir.into(),
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_digest_lookup(mut self, digests: Arc<dyn DigestLookup>) -> Self {
        self.digests = digests;
        self
    }

    /// Fetches the manifest's image file through the shared cache.
    pub(crate) async fn fetch_image_file(&self, hashes: &ImageHashes) -> Result<CachedImage> {
        let resource = self.manifest.setup_args()?;
        self.fetcher
            .get_image(&resource, &self.container_dir, hashes.expected.as_deref())
            .await
    }
}

/// Builds the runner for the manifest's container type and the configured
/// runtime.
///
/// Encrypted container types need a [`PrivateContext`].
pub async fn create_runner(
    ctx: RunnerContext,
    private: Option<PrivateContext>,
) -> Result<Box<dyn Runner>> {
    let container_type = ctx.manifest.container_type();
    let runtime = ctx.engine.runtime;

    if !container_type.supports(runtime) {
        return Err(Error::InvalidArgument(format!(
            "container type '{}' cannot run on {}",
            container_type, runtime
        )));
    }
    debug!("Creating {} runner for {}", runtime, container_type);

    let format = if container_type.is_docker_archive() {
        ArchiveFormat::DockerArchive
    } else {
        ArchiveFormat::SingularityFile
    };

    let private = match (container_type.is_encrypted(), private) {
        (false, _) => None,
        (true, Some(private)) => Some(private),
        (true, None) => {
            return Err(Error::InvalidArgument(format!(
                "container type '{}' is encrypted but no key context was provided",
                container_type
            )));
        }
    };

    let runner: Box<dyn Runner> = match (runtime, private) {
        (RuntimeKind::Docker, None) => Box::new(DockerRunner::new(ctx)),
        (RuntimeKind::Docker, Some(private)) => {
            let cli = DockerCli::from_context(&ctx);
            Box::new(PrivateRunner::new(ctx, cli, private, format))
        }
        (RuntimeKind::Singularity, None) => Box::new(SingularityRunner::new(ctx).await?),
        (RuntimeKind::Singularity, Some(private)) => {
            let cli = SingularityCli::from_context(&ctx).await?;
            Box::new(PrivateRunner::new(ctx, cli, private, format))
        }
    };
    Ok(runner)
}
