//! Runner trait and the shared execution model.
//!
//! Every backend goes through the same lifecycle:
//!
//! ```text
//! Uninitialized ──download()──► Downloaded ──run()──► Running ──► Completed
//!                                                          └────► Failed
//! ```
//!
//! `run()` before a successful `download()` is an internal error.
//!
//! Manifest run arguments and caller-injected options are merged once, in
//! [`ExecutionPlan::prepare`]; backends only translate a plan into a command
//! line. Backends that can execute a local image archive additionally
//! implement [`ImageBackend`], which is what the private runner composes
//! with.

use crate::config::EngineConfig;
use crate::constants::{
    CONTAINER_LOGLEVEL_ENV, DEFAULT_CONTAINER_LOGLEVEL, NETWORK_NONE, TMP_MOUNT_PATH,
};
use crate::error::{Error, Result};
use crate::manifest::{ContainerConfig, GpuRequest, MountBindings, RunArgs, Volume, VolumeKind};
use crate::resources::hashes_match;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Runner State
// =============================================================================

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Uninitialized,
    Downloaded,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Downloaded => write!(f, "downloaded"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Image Hashes
// =============================================================================

/// Hash values an image is allowed to have.
///
/// Some docker versions report an image ID where a digest is expected, so
/// a container may record one alternative value next to the expected one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageHashes {
    pub expected: Option<String>,
    pub alternative: Option<String>,
}

impl ImageHashes {
    /// No expectation; any image is accepted.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn expect(hash: impl Into<String>) -> Self {
        Self {
            expected: Some(hash.into()),
            alternative: None,
        }
    }

    pub fn with_alternative(mut self, hash: impl Into<String>) -> Self {
        self.alternative = Some(hash.into());
        self
    }

    fn expected(&self) -> Option<&str> {
        self.expected.as_deref().filter(|h| !h.is_empty())
    }

    /// Picks the computed hash to report out of `candidates`.
    ///
    /// Without an expected value the first candidate is returned. Otherwise
    /// the first candidate equal to the expected or the alternative value
    /// wins, and no match is [`Error::InvalidEntity`].
    pub fn check(&self, subject: &str, candidates: &[String]) -> Result<String> {
        let Some(expected) = self.expected() else {
            return candidates.first().cloned().ok_or_else(|| {
                Error::Execution(format!("could not determine the hash of {}", subject))
            });
        };

        let accepted = |candidate: &String| {
            hashes_match(expected, candidate)
                || self
                    .alternative
                    .as_deref()
                    .is_some_and(|alt| !alt.is_empty() && hashes_match(alt, candidate))
        };

        candidates
            .iter()
            .find(|c| accepted(c))
            .cloned()
            .ok_or_else(|| Error::InvalidEntity {
                subject: subject.to_string(),
                expected: match &self.alternative {
                    Some(alt) => format!("{} (or {})", expected, alt),
                    None => expected.to_string(),
                },
                found: candidates.join(", "),
            })
    }
}

// =============================================================================
// Run Request
// =============================================================================

/// Caller-side options of one `run()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Logical mount name to host path.
    pub mounts: MountBindings,
    /// Environment merged over the manifest's.
    pub env: BTreeMap<String, String>,
    /// `interface:host_port:container_port` publications.
    pub ports: Vec<String>,
    pub disable_network: bool,
    /// Host folder mounted read-write at `/tmp`.
    pub tmp_folder: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub output_log: Option<PathBuf>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            mounts: MountBindings::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            disable_network: true,
            tmp_folder: None,
            timeout: None,
            output_log: None,
        }
    }
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(mut self, name: impl Into<String>, host_path: impl AsRef<Path>) -> Self {
        self.mounts
            .insert(name.into(), host_path.as_ref().display().to_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Publishes ports and enables networking.
    pub fn ports(mut self, ports: Vec<String>) -> Self {
        self.ports = ports;
        self.disable_network = false;
        self
    }

    pub fn network(mut self, enabled: bool) -> Self {
        self.disable_network = !enabled;
        self
    }

    pub fn tmp_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmp_folder = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn output_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_log = Some(path.into());
        self
    }
}

// =============================================================================
// Execution Plan
// =============================================================================

/// Fully resolved options of one container execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// `uid:gid` of the calling user.
    pub user: String,
    /// Inputs first, then outputs. Host paths already exist.
    pub volumes: Vec<Volume>,
    pub run_args: RunArgs,
    /// `Some("none")` when networking is disabled.
    pub network: Option<String>,
    pub ports: Vec<String>,
    pub timeout: Option<Duration>,
    pub output_log: Option<PathBuf>,
}

impl ExecutionPlan {
    /// Merges the manifest task with engine and caller options.
    ///
    /// Output paths are created on the host as a side effect.
    pub fn prepare(
        manifest: &ContainerConfig,
        engine: &EngineConfig,
        task: &str,
        request: &RunRequest,
    ) -> Result<Self> {
        manifest.check_task_schema(task)?;
        let descriptor = manifest.describe(task, &request.mounts)?;
        let mut run_args = descriptor.run_args;

        run_args.environment.insert(
            CONTAINER_LOGLEVEL_ENV.to_string(),
            engine
                .container_loglevel
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTAINER_LOGLEVEL.to_string()),
        );
        run_args.environment.extend(request.env.clone());

        if let Some(shm_size) = &engine.shm_size {
            run_args.shm_size = Some(shm_size.clone());
        }
        if let Some(gpus) = &engine.gpus {
            run_args.gpus = GpuRequest::from_value(gpus)?;
        }

        let mut volumes = descriptor.input_volumes;
        volumes.extend(descriptor.output_volumes);
        if let Some(tmp) = &request.tmp_folder {
            volumes.push(Volume::output(tmp, TMP_MOUNT_PATH, VolumeKind::Directory));
        }
        for volume in &volumes {
            volume.prepare()?;
        }

        let network = network_mode(request.disable_network, &request.ports)?;

        debug!("Prepared task {} with {} volume(s)", task, volumes.len());
        Ok(Self {
            user: current_user(),
            volumes,
            run_args,
            network,
            ports: request.ports.clone(),
            timeout: request.timeout,
            output_log: request.output_log.clone(),
        })
    }
}

fn network_mode(disable_network: bool, ports: &[String]) -> Result<Option<String>> {
    if disable_network && !ports.is_empty() {
        return Err(Error::Internal(
            "ports cannot be published while the network is disabled".to_string(),
        ));
    }
    if let Some(bad) = ports.iter().find(|p| p.matches(':').count() != 2) {
        return Err(Error::Internal(format!(
            "port '{}' should be interface:host_port:container_port",
            bad
        )));
    }
    Ok(disable_network.then(|| NETWORK_NONE.to_string()))
}

fn current_user() -> String {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    format!("{}:{}", uid, gid)
}

// =============================================================================
// Runner Traits
// =============================================================================

/// A container runner bound to one manifest.
#[async_trait]
pub trait Runner: Send {
    /// Backend name for logs.
    fn name(&self) -> &str;

    fn state(&self) -> RunnerState;

    /// Fetches and verifies the image, returning its computed hash.
    async fn download(&mut self, hashes: &ImageHashes) -> Result<String>;

    /// Runs a manifest task to completion.
    async fn run(&mut self, task: &str, request: &RunRequest) -> Result<()>;
}

/// Packaging of a local plaintext image archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    DockerArchive,
    SingularityFile,
}

/// A local archive made runnable by [`ImageBackend::stage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedImage {
    /// What to hand to the runtime: an image tag or an image file path.
    pub reference: String,
    /// Intermediate files to remove afterwards.
    pub files: Vec<PathBuf>,
    /// Images loaded into a daemon, removed afterwards.
    pub daemon_images: Vec<String>,
    /// The runtime build cache holds intermediate layers.
    pub clean_build_cache: bool,
}

/// A runtime able to execute local image archives.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Makes `archive` runnable.
    async fn stage(&self, archive: &Path, format: ArchiveFormat) -> Result<StagedImage>;

    /// Runs `image` with a prepared plan.
    async fn run_image(&self, image: &str, plan: &ExecutionPlan) -> Result<()>;

    /// Removes everything `stage` produced. Failures are logged.
    async fn unstage(&self, staged: &StagedImage);
}
