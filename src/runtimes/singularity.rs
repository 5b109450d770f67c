//! # Singularity / Apptainer Backend
//!
//! Drives `singularity` or `apptainer`, whichever answers `--version` first.
//!
//! ## Differences From Docker
//!
//! | Concern | Translation |
//! |---------|-------------|
//! | volumes | `--bind host:mount:ro\|rw` |
//! | user | implicit (the calling user) |
//! | network disabled | `--net --network none` |
//! | ports, shm size | ignored (host network, host `/dev/shm`) |
//! | environment | `SINGULARITYENV_<K>` / `APPTAINERENV_<K>` in the child environment |
//! | gpus | `--nv`; device lists add `--nvccli -c --writable-tmpfs` and `NVIDIA_VISIBLE_DEVICES` |
//! | entrypoint | subcommand `exec <image> <entrypoint> <command...>` |
//!
//! A GPU count has no meaning here and is rejected. Device selection needs
//! `--nvccli`, available from singularity 3.10 and in every apptainer.
//!
//! Every value that reaches the runtime through the environment is placed in
//! the per-invocation environment map; the engine's own environment is never
//! modified.
//!
//! ## Images
//!
//! Docker images and docker archives are converted once to
//! `<container>/image/<hash>.sif` and reused while the file exists.

use super::RunnerContext;
use crate::constants::{
    APPTAINER_ENV_PREFIX, APPTAINER_VERSION_PREFIX, CONTAINER_IMAGE_DIR, GPU_VISIBILITY_ENV,
    MIN_SINGULARITY_NVCCLI_VERSION, NETWORK_NONE, SIF_EXTENSION, SINGULARITY_CE_VERSION_PREFIX,
    SINGULARITY_ENV_PREFIX, SINGULARITY_VERSION_PREFIX, VERSION_PROBE_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::manifest::{ContainerType, GpuRequest};
use crate::process::{CommandExecutor, Invocation, run_checked};
use crate::runtime::{
    ArchiveFormat, ExecutionPlan, ImageBackend, ImageHashes, RunRequest, Runner, RunnerState,
    StagedImage,
};
use crate::storage::remove_path;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Installation Detection
// =============================================================================

/// Runtime family of the installed executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingularityFamily {
    /// SingularityPRO or SingularityCE.
    Singularity,
    Apptainer,
}

/// The detected runtime executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingularityInstall {
    pub executable: String,
    pub family: SingularityFamily,
    /// `(major, minor, patch)`.
    pub version: (u32, u32, u32),
}

impl SingularityInstall {
    /// Parses `<exe> --version` output.
    pub fn parse_version_output(executable: &str, output: &str) -> Result<Self> {
        let output = output.trim();
        let prefixes = [
            (SINGULARITY_VERSION_PREFIX, SingularityFamily::Singularity),
            (SINGULARITY_CE_VERSION_PREFIX, SingularityFamily::Singularity),
            (APPTAINER_VERSION_PREFIX, SingularityFamily::Apptainer),
        ];
        let (family, raw) = prefixes
            .iter()
            .find_map(|(prefix, family)| output.strip_prefix(prefix).map(|rest| (*family, rest)))
            .ok_or_else(|| {
                Error::Execution(format!(
                    "unrecognized version output from {}: '{}'",
                    executable, output
                ))
            })?;

        Ok(Self {
            executable: executable.to_string(),
            family,
            version: parse_version(raw).ok_or_else(|| {
                Error::Execution(format!("unparseable {} version '{}'", executable, raw))
            })?,
        })
    }

    /// Probes each candidate executable in order.
    pub async fn detect(executor: &dyn CommandExecutor, candidates: &[String]) -> Result<Self> {
        for executable in candidates {
            let inv = Invocation::new(executable)
                .arg("--version")
                .timeout(VERSION_PROBE_TIMEOUT);
            match executor.execute(&inv).await {
                Ok(out) if out.success() => {
                    let install = Self::parse_version_output(executable, &out.output)?;
                    debug!(
                        "Detected {} {:?} {:?}",
                        install.executable, install.family, install.version
                    );
                    return Ok(install);
                }
                Ok(out) => debug!("{} --version exited with {}", executable, out.exit_code),
                Err(e) => debug!("{} --version failed: {}", executable, e),
            }
        }
        Err(Error::Execution(format!(
            "singularity executable not found (tried {})",
            candidates.join(", ")
        )))
    }

    /// Whether `--nvccli` (per-device GPU isolation) is available.
    pub fn supports_nvccli(&self) -> bool {
        match self.family {
            SingularityFamily::Apptainer => true,
            SingularityFamily::Singularity => {
                let (major, minor) = MIN_SINGULARITY_NVCCLI_VERSION;
                (self.version.0, self.version.1) >= (major, minor)
            }
        }
    }

    /// Prefix that forwards a variable into the container.
    pub fn env_prefix(&self) -> &'static str {
        match self.family {
            SingularityFamily::Singularity => SINGULARITY_ENV_PREFIX,
            SingularityFamily::Apptainer => APPTAINER_ENV_PREFIX,
        }
    }
}

/// `3.10.4`, `1.2.5-1.el8`, `4.1.0+jammy` → numeric triple.
fn parse_version(raw: &str) -> Option<(u32, u32, u32)> {
    let core = raw
        .trim()
        .split(['-', '+', ' '])
        .next()
        .unwrap_or_default();
    let mut parts = core.split('.').map(|p| p.parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().map(|p| p.ok()).unwrap_or(Some(0))?;
    let patch = parts.next().map(|p| p.ok()).unwrap_or(Some(0))?;
    Some((major, minor, patch))
}

// =============================================================================
// Argument Translation
// =============================================================================

/// Builds the runtime arguments (without the executable) and the extra
/// child environment for a plan.
pub fn singularity_run_args(
    plan: &ExecutionPlan,
    image: &str,
    install: &SingularityInstall,
) -> Result<(Vec<String>, BTreeMap<String, String>)> {
    let mut args: Vec<String> = vec!["run".into(), "-eC".into()];
    let mut env = BTreeMap::new();

    for volume in &plan.volumes {
        args.push("--bind".into());
        args.push(volume.bind_spec());
    }

    match &plan.run_args.gpus {
        None => {}
        Some(GpuRequest::Count(n)) => {
            return Err(Error::InvalidArgument(format!(
                "cannot request a GPU count ({}) with {}; use \"all\" or a device list",
                n, install.executable
            )));
        }
        Some(GpuRequest::All) => args.push("--nv".into()),
        Some(GpuRequest::Devices(ids)) => {
            if !install.supports_nvccli() {
                return Err(Error::InvalidArgument(format!(
                    "cannot select GPU devices {} with {} {}.{}; singularity 3.10+ or apptainer is required",
                    ids.join(","),
                    install.executable,
                    install.version.0,
                    install.version.1
                )));
            }
            args.extend(["--nv", "--nvccli", "-c", "--writable-tmpfs"].map(String::from));
            env.insert(GPU_VISIBILITY_ENV.to_string(), ids.join(","));
        }
    }

    for (key, value) in &plan.run_args.environment {
        env.insert(format!("{}{}", install.env_prefix(), key), value.clone());
    }

    if plan.network.as_deref() == Some(NETWORK_NONE) {
        args.extend(["--net", "--network", "none"].map(String::from));
    }

    args.push(image.to_string());

    if let Some(entrypoint) = &plan.run_args.entrypoint {
        args[0] = "exec".into();
        args.push(entrypoint.clone());
    }

    args.extend(plan.run_args.command.iter().cloned());
    Ok((args, env))
}

// =============================================================================
// Singularity CLI
// =============================================================================

/// Wrapper over the detected singularity/apptainer executable.
#[derive(Clone)]
pub struct SingularityCli {
    install: SingularityInstall,
    executor: Arc<dyn CommandExecutor>,
    prepare_timeout: Duration,
}

impl SingularityCli {
    pub fn new(install: SingularityInstall, executor: Arc<dyn CommandExecutor>, prepare_timeout: Duration) -> Self {
        Self {
            install,
            executor,
            prepare_timeout,
        }
    }

    /// Detects the executable configured for the engine.
    pub async fn from_context(ctx: &RunnerContext) -> Result<Self> {
        let install =
            SingularityInstall::detect(ctx.executor.as_ref(), &ctx.engine.singularity_executables)
                .await?;
        Ok(Self::new(
            install,
            Arc::clone(&ctx.executor),
            ctx.engine.image_prepare_timeout,
        ))
    }

    pub fn install(&self) -> &SingularityInstall {
        &self.install
    }

    /// Builds `sif` from `source` (`docker://...` or `docker-archive://...`).
    ///
    /// The image is written under a temporary name and renamed into place.
    pub async fn build_sif(&self, source: &str, sif: &Path) -> Result<()> {
        if let Some(parent) = sif.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = sif.with_file_name(format!(
            ".{}.{}",
            sif.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::now_v7()
        ));

        info!("Converting {} to {}", source, sif.display());
        let inv = Invocation::new(&self.install.executable)
            .arg("build")
            .arg(partial.display().to_string())
            .arg(source)
            .timeout(self.prepare_timeout);
        if let Err(e) = run_checked(self.executor.as_ref(), &inv).await {
            if let Err(cleanup) = remove_path(&partial) {
                warn!("Failed to remove {}: {}", partial.display(), cleanup);
            }
            return Err(e);
        }
        if !partial.is_file() {
            return Err(Error::Execution(format!(
                "'{}' succeeded but did not produce {}",
                inv.display(),
                sif.display()
            )));
        }
        tokio::fs::rename(&partial, sif).await?;
        Ok(())
    }

    /// Builds `sif` unless it already exists.
    async fn ensure_sif(&self, source: &str, sif: &Path) -> Result<()> {
        if sif.is_file() {
            debug!("{} already exists", sif.display());
            return Ok(());
        }
        self.build_sif(source, sif).await
    }

    /// Empties the runtime's build cache. Failures are only logged.
    pub async fn clean_cache(&self) {
        let inv = Invocation::new(&self.install.executable).args(["cache", "clean", "-f"]);
        if let Err(e) = run_checked(self.executor.as_ref(), &inv).await {
            warn!("Failed to clean {} cache: {}", self.install.executable, e);
        }
    }
}

#[async_trait]
impl ImageBackend for SingularityCli {
    fn name(&self) -> &str {
        &self.install.executable
    }

    async fn stage(&self, archive: &Path, format: ArchiveFormat) -> Result<StagedImage> {
        match format {
            ArchiveFormat::SingularityFile => Ok(StagedImage {
                reference: archive.display().to_string(),
                ..StagedImage::default()
            }),
            ArchiveFormat::DockerArchive => {
                let sif = archive.with_extension(SIF_EXTENSION);
                let staged = StagedImage {
                    reference: sif.display().to_string(),
                    files: vec![sif.clone()],
                    daemon_images: Vec::new(),
                    clean_build_cache: true,
                };
                let source = format!("docker-archive://{}", archive.display());
                self.build_sif(&source, &sif).await.map(|_| staged)
            }
        }
    }

    async fn run_image(&self, image: &str, plan: &ExecutionPlan) -> Result<()> {
        let (args, env) = singularity_run_args(plan, image, &self.install)?;
        let mut inv = Invocation::new(&self.install.executable)
            .args(args)
            .envs(env)
            .output_log(plan.output_log.clone());
        inv.timeout = plan.timeout;
        info!("Running {} with {}", image, self.install.executable);
        run_checked(self.executor.as_ref(), &inv).await?;
        Ok(())
    }

    async fn unstage(&self, staged: &StagedImage) {
        for file in &staged.files {
            if let Err(e) = remove_path(file) {
                warn!("Failed to remove {}: {}", file.display(), e);
            }
        }
        if staged.clean_build_cache {
            self.clean_cache().await;
        }
    }
}

// =============================================================================
// Singularity Runner
// =============================================================================

/// Runner for plain container types on singularity/apptainer.
pub struct SingularityRunner {
    ctx: RunnerContext,
    cli: SingularityCli,
    state: RunnerState,
    image: Option<PathBuf>,
}

impl SingularityRunner {
    pub async fn new(ctx: RunnerContext) -> Result<Self> {
        let cli = SingularityCli::from_context(&ctx).await?;
        Ok(Self::with_cli(ctx, cli))
    }

    pub fn with_cli(ctx: RunnerContext, cli: SingularityCli) -> Self {
        Self {
            ctx,
            cli,
            state: RunnerState::Uninitialized,
            image: None,
        }
    }

    /// Image file `run()` will use, once downloaded.
    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    fn sif_path(&self, hash: &str) -> PathBuf {
        let name = hash.strip_prefix("sha256:").unwrap_or(hash);
        self.ctx
            .container_dir
            .join(CONTAINER_IMAGE_DIR)
            .join(format!("{}.{}", name, SIF_EXTENSION))
    }

    async fn fetch(&mut self, hashes: &ImageHashes) -> Result<String> {
        match self.ctx.manifest.container_type() {
            ContainerType::DockerImage => {
                let image = self.ctx.manifest.setup_args()?;
                let digest = self.ctx.digests.manifest_digest(&image).await?;
                let hash = hashes.check(&image, &[digest])?;
                let sif = self.sif_path(&hash);
                self.cli
                    .ensure_sif(&format!("docker://{}", image), &sif)
                    .await?;
                self.image = Some(sif);
                Ok(hash)
            }
            ContainerType::DockerArchive => {
                let cached = self.ctx.fetch_image_file(hashes).await?;
                let sif = self.sif_path(&cached.hash);
                let source = format!("docker-archive://{}", cached.path.display());
                self.cli.ensure_sif(&source, &sif).await?;
                self.image = Some(sif);
                Ok(cached.hash)
            }
            ContainerType::SingularityFile => {
                let cached = self.ctx.fetch_image_file(hashes).await?;
                self.image = Some(cached.path);
                Ok(cached.hash)
            }
            other => Err(Error::InvalidArgument(format!(
                "singularity runner cannot handle container type '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl Runner for SingularityRunner {
    fn name(&self) -> &str {
        &self.cli.install.executable
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
            .as_ref()
            .map(|p| p.display().to_string())
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
    fn test_parse_version_shapes() {
        assert_eq!(parse_version("3.10.4"), Some((3, 10, 4)));
        assert_eq!(parse_version("1.2.5-1.el8"), Some((1, 2, 5)));
        assert_eq!(parse_version("4.1"), Some((4, 1, 0)));
        assert_eq!(parse_version("x.y"), None);
    }

    #[test]
    fn test_detect_family_from_prefix() {
        let ce = SingularityInstall::parse_version_output(
            "singularity",
            "singularity-ce version 3.11.4-jammy\n",
        )
        .unwrap();
        assert_eq!(ce.family, SingularityFamily::Singularity);
        assert_eq!(ce.version, (3, 11, 4));
        assert!(ce.supports_nvccli());

        let old =
            SingularityInstall::parse_version_output("singularity", "singularity version 3.8.7")
                .unwrap();
        assert!(!old.supports_nvccli());

        let app =
            SingularityInstall::parse_version_output("apptainer", "apptainer version 1.1.0").unwrap();
        assert_eq!(app.env_prefix(), APPTAINER_ENV_PREFIX);
        assert!(app.supports_nvccli());
    }
}
