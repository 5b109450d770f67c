//! # Docker Backend
//!
//! Drives the `docker` CLI. The daemon does the isolation; this module only
//! translates an [`ExecutionPlan`] into an argument vector:
//!
//! ```text
//! docker run --rm -u <uid:gid>
//!     --volume <host>:<mount>:ro ...   (inputs)
//!     --volume <host>:<mount>:rw ...   (outputs, /tmp)
//!     [--network none] [--gpus <spec>] [--shm-size <n>]
//!     [--env K=V ...] [--entrypoint <e>] [-p <port> ...]
//!     <image> <command...>
//! ```
//!
//! ## Image Verification
//!
//! After `docker pull`, `docker inspect` reports the image `Id` and its
//! `RepoDigests`. Either may be recorded as the container hash depending on
//! the docker version that registered it, so all of them are candidates.
//!
//! ## Archives
//!
//! `docker save` archives are loaded with `docker load`; the image to run
//! is the first `RepoTags` entry of the archive's `manifest.json`.

use super::RunnerContext;
use crate::constants::DOCKER_ARCHIVE_MANIFEST;
use crate::error::{Error, Result};
use crate::manifest::{ContainerType, GpuRequest};
use crate::process::{CommandExecutor, Invocation, run_checked};
use crate::runtime::{
    ArchiveFormat, ExecutionPlan, ImageBackend, ImageHashes, RunRequest, Runner, RunnerState,
    StagedImage,
};
use crate::storage::remove_path;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds the `docker` arguments (without the executable) for a plan.
pub fn docker_run_args(plan: &ExecutionPlan, image: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "-u".into(), plan.user.clone()];

    for volume in &plan.volumes {
        args.push("--volume".into());
        args.push(volume.bind_spec());
    }

    if let Some(network) = &plan.network {
        args.push("--network".into());
        args.push(network.clone());
    }

    if let Some(gpus) = &plan.run_args.gpus {
        args.push("--gpus".into());
        args.push(match gpus {
            // docker parses --gpus as CSV; a device list must be quoted
            GpuRequest::Devices(ids) if ids.len() > 1 => format!("\"{}\"", gpus.docker_arg()),
            _ => gpus.docker_arg(),
        });
    }

    if let Some(shm_size) = &plan.run_args.shm_size {
        args.push("--shm-size".into());
        args.push(shm_size.clone());
    }

    for (key, value) in &plan.run_args.environment {
        args.push("--env".into());
        args.push(format!("{}={}", key, value));
    }

    if let Some(entrypoint) = &plan.run_args.entrypoint {
        args.push("--entrypoint".into());
        args.push(entrypoint.clone());
    }

    for port in &plan.ports {
        args.push("-p".into());
        args.push(port.clone());
    }

    args.push(image.to_string());
    args.extend(plan.run_args.command.iter().cloned());
    args
}

#[derive(Deserialize)]
struct InspectOutput {
    #[serde(rename = "Id", default)]
    id: Option<String>,
    #[serde(rename = "RepoDigests", default)]
    repo_digests: Vec<String>,
}

#[derive(Deserialize)]
struct ArchiveManifestEntry {
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
}

/// Hash candidates from `docker inspect --format '{{json .}}'` output.
///
/// Repo digests come first (`repo@sha256:...` reduced to the digest),
/// followed by the image id.
pub fn parse_inspect_hashes(output: &str) -> Result<Vec<String>> {
    let inspect: InspectOutput = serde_json::from_str(output.trim())?;
    let mut candidates: Vec<String> = inspect
        .repo_digests
        .iter()
        .filter_map(|d| d.rsplit_once('@').map(|(_, digest)| digest.to_string()))
        .collect();
    candidates.extend(inspect.id);
    Ok(candidates)
}

/// Repo tags listed in a `docker save` archive.
pub fn archive_repo_tags(archive: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(file);
    for entry in tar.entries()? {
        let entry = entry?;
        if &*entry.path()? == Path::new(DOCKER_ARCHIVE_MANIFEST) {
            let manifests: Vec<ArchiveManifestEntry> = serde_json::from_reader(entry)?;
            return Ok(manifests
                .into_iter()
                .flat_map(|m| m.repo_tags.unwrap_or_default())
                .collect());
        }
    }
    Err(Error::InvalidContainerSpec(format!(
        "{} has no {}",
        archive.display(),
        DOCKER_ARCHIVE_MANIFEST
    )))
}

// =============================================================================
// Docker CLI
// =============================================================================

/// Thin wrapper over the `docker` executable.
#[derive(Clone)]
pub struct DockerCli {
    executable: String,
    executor: Arc<dyn CommandExecutor>,
    pull_timeout: Duration,
}

impl DockerCli {
    pub fn new(executable: impl Into<String>, executor: Arc<dyn CommandExecutor>, pull_timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            executor,
            pull_timeout,
        }
    }

    pub fn from_context(ctx: &RunnerContext) -> Self {
        Self::new(
            ctx.engine.docker_executable.clone(),
            Arc::clone(&ctx.executor),
            ctx.engine.download_timeout,
        )
    }

    fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(&self.executable).args(args)
    }

    pub async fn pull(&self, image: &str) -> Result<()> {
        info!("Pulling {}", image);
        let inv = self.invocation(["pull", image]).timeout(self.pull_timeout);
        run_checked(self.executor.as_ref(), &inv).await?;
        Ok(())
    }

    /// Hash candidates of a local image.
    pub async fn image_hashes(&self, image: &str) -> Result<Vec<String>> {
        let inv = self.invocation(["inspect", "--format", "{{json .}}", image]);
        let output = run_checked(self.executor.as_ref(), &inv).await?;
        parse_inspect_hashes(&output.output)
    }

    /// Loads a `docker save` archive and returns its repo tags.
    pub async fn load(&self, archive: &Path) -> Result<Vec<String>> {
        let path = archive.to_path_buf();
        let tags = tokio::task::spawn_blocking(move || archive_repo_tags(&path))
            .await
            .map_err(|e| Error::Internal(format!("archive inspection failed: {}", e)))??;
        if tags.is_empty() {
            return Err(Error::InvalidContainerSpec(format!(
                "{} declares no RepoTags",
                archive.display()
            )));
        }

        debug!("Loading {} ({})", archive.display(), tags.join(", "));
        let inv = self
            .invocation(["load", "-i"])
            .arg(archive.display().to_string())
            .timeout(self.pull_timeout);
        run_checked(self.executor.as_ref(), &inv).await?;
        Ok(tags)
    }

    /// Force-removes images from the daemon. Failures are only logged.
    pub async fn remove_images(&self, images: &[String]) {
        if images.is_empty() {
            return;
        }
        let inv = self
            .invocation(["rmi", "-f"])
            .args(images.iter().cloned());
        if let Err(e) = run_checked(self.executor.as_ref(), &inv).await {
            warn!("Failed to delete docker images {}: {}", images.join(", "), e);
        }
    }
}

#[async_trait]
impl ImageBackend for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    async fn stage(&self, archive: &Path, format: ArchiveFormat) -> Result<StagedImage> {
        match format {
            ArchiveFormat::DockerArchive => {
                let tags = self.load(archive).await?;
                Ok(StagedImage {
                    reference: tags[0].clone(),
                    daemon_images: tags,
                    ..StagedImage::default()
                })
            }
            ArchiveFormat::SingularityFile => Err(Error::InvalidArgument(
                "docker cannot run singularity image files".to_string(),
            )),
        }
    }

    async fn run_image(&self, image: &str, plan: &ExecutionPlan) -> Result<()> {
        let mut inv = self
            .invocation(docker_run_args(plan, image))
            .output_log(plan.output_log.clone());
        inv.timeout = plan.timeout;
        info!("Running {} with docker", image);
        run_checked(self.executor.as_ref(), &inv).await?;
        Ok(())
    }

    async fn unstage(&self, staged: &StagedImage) {
        self.remove_images(&staged.daemon_images).await;
        for file in &staged.files {
            if let Err(e) = remove_path(file) {
                warn!("Failed to remove {}: {}", file.display(), e);
            }
        }
    }
}

// =============================================================================
// Docker Runner
// =============================================================================

/// Runner for plain `docker-image` and `docker-archive` containers.
pub struct DockerRunner {
    ctx: RunnerContext,
    cli: DockerCli,
    state: RunnerState,
    image: Option<String>,
}

impl DockerRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        let cli = DockerCli::from_context(&ctx);
        Self {
            ctx,
            cli,
            state: RunnerState::Uninitialized,
            image: None,
        }
    }

    /// Image reference `run()` will use, once downloaded.
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    async fn fetch(&mut self, hashes: &ImageHashes) -> Result<String> {
        match self.ctx.manifest.container_type() {
            ContainerType::DockerImage => {
                let image = self.ctx.manifest.setup_args()?;
                self.cli.pull(&image).await?;
                let candidates = self.cli.image_hashes(&image).await?;
                let hash = hashes.check(&image, &candidates)?;
                self.image = Some(image);
                Ok(hash)
            }
            ContainerType::DockerArchive => {
                let cached = self.ctx.fetch_image_file(hashes).await?;
                let tags = self.cli.load(&cached.path).await?;
                self.image = tags.into_iter().next();
                Ok(cached.hash)
            }
            other => Err(Error::InvalidArgument(format!(
                "docker runner cannot handle container type '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl Runner for DockerRunner {
    fn name(&self) -> &str {
        "docker"
    }

    fn state(&self) -> RunnerState {
        self.state
    }

    async fn download(&mut self, hashes: &ImageHashes) -> Result<String> {
        let hash = self.fetch(hashes).await?;
        self.state = RunnerState::Downloaded;
        Ok(hash)
    }

    async fn run(&mut self, task: &str, request: &RunRequest) -> Result<()> {
        let image = self
            .image
            .clone()
            .ok_or_else(|| Error::Internal("run called before download".to_string()))?;
        self.state = RunnerState::Running;

        let result = match ExecutionPlan::prepare(&self.ctx.manifest, &self.ctx.engine, task, request) {
            Ok(plan) => self.cli.run_image(&image, &plan).await,
            Err(e) => Err(e),
        };
        self.state = if result.is_ok() {
            RunnerState::Completed
        } else {
            RunnerState::Failed
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_hashes() {
        let out = r#"{"Id":"sha256:1111","RepoDigests":["org/app@sha256:2222"]}"#;
        assert_eq!(
            parse_inspect_hashes(out).unwrap(),
            vec!["sha256:2222".to_string(), "sha256:1111".to_string()]
        );
    }

    #[test]
    fn test_parse_inspect_without_digests() {
        let out = r#"{"Id":"sha256:1111"}"#;
        assert_eq!(parse_inspect_hashes(out).unwrap(), vec!["sha256:1111".to_string()]);
    }
}
