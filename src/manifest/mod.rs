//! # Container Manifests
//!
//! Normalizes the two manifest dialects into one execution model.
//!
//! ## Dialects
//!
//! | Dialect | Detected by | Parser |
//! |---------|-------------|--------|
//! | Simple | top-level `container_type` | [`simple::SimpleManifest`] |
//! | Legacy cube | `docker` / `singularity` section, no `container_type` | [`cube::CubeManifest`] |
//!
//! Both produce a [`TaskDescriptor`] for a task name and a set of
//! [`MountBindings`] supplied by the caller:
//!
//! ```text
//! manifest.yaml ──► ContainerConfig::load ──► check_schema
//!                                   │
//!      task + MountBindings ────────┴──► TaskDescriptor { volumes, run_args }
//! ```
//!
//! ## Volume Policy
//!
//! Input volumes are always mounted read-only and must exist on the host.
//! Output volumes are always mounted read-write; missing directories are
//! created and missing files are created empty before the runtime starts.

pub mod cube;
pub mod gpu;
pub mod simple;

pub use self::cube::CubeManifest;
pub use self::gpu::GpuRequest;
pub use self::simple::SimpleManifest;

use crate::config::RuntimeKind;
use crate::constants::{
    ALLOWED_RUN_ARGS, CONTAINER_TYPE_DOCKER_ARCHIVE, CONTAINER_TYPE_DOCKER_IMAGE,
    CONTAINER_TYPE_ENCRYPTED_DOCKER_ARCHIVE, CONTAINER_TYPE_ENCRYPTED_SINGULARITY_FILE,
    CONTAINER_TYPE_SINGULARITY_FILE, CONTAINER_TYPES,
};
use crate::error::{Error, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Caller-supplied mapping from logical mount names to host paths.
pub type MountBindings = BTreeMap<String, String>;

// =============================================================================
// Container Type
// =============================================================================

/// Declared image packaging of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerType {
    DockerImage,
    DockerArchive,
    EncryptedDockerArchive,
    SingularityFile,
    EncryptedSingularityFile,
}

impl ContainerType {
    /// Parses a `container_type` value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            CONTAINER_TYPE_DOCKER_IMAGE => Ok(Self::DockerImage),
            CONTAINER_TYPE_DOCKER_ARCHIVE => Ok(Self::DockerArchive),
            CONTAINER_TYPE_ENCRYPTED_DOCKER_ARCHIVE => Ok(Self::EncryptedDockerArchive),
            CONTAINER_TYPE_SINGULARITY_FILE => Ok(Self::SingularityFile),
            CONTAINER_TYPE_ENCRYPTED_SINGULARITY_FILE => Ok(Self::EncryptedSingularityFile),
            other => Err(Error::InvalidContainerSpec(format!(
                "unsupported container_type '{}': expected one of {}",
                other,
                CONTAINER_TYPES.join(", ")
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DockerImage => CONTAINER_TYPE_DOCKER_IMAGE,
            Self::DockerArchive => CONTAINER_TYPE_DOCKER_ARCHIVE,
            Self::EncryptedDockerArchive => CONTAINER_TYPE_ENCRYPTED_DOCKER_ARCHIVE,
            Self::SingularityFile => CONTAINER_TYPE_SINGULARITY_FILE,
            Self::EncryptedSingularityFile => CONTAINER_TYPE_ENCRYPTED_SINGULARITY_FILE,
        }
    }

    /// True when the image must be decrypted before it can run.
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            Self::EncryptedDockerArchive | Self::EncryptedSingularityFile
        )
    }

    /// True for `docker save` archives, plain or encrypted.
    pub fn is_docker_archive(&self) -> bool {
        matches!(self, Self::DockerArchive | Self::EncryptedDockerArchive)
    }

    /// True for SIF files, plain or encrypted.
    pub fn is_singularity_file(&self) -> bool {
        matches!(self, Self::SingularityFile | Self::EncryptedSingularityFile)
    }

    /// True when the image is a downloadable file rather than a registry reference.
    pub fn is_image_file(&self) -> bool {
        !matches!(self, Self::DockerImage)
    }

    /// Whether the runtime can execute this packaging.
    pub fn supports(&self, runtime: RuntimeKind) -> bool {
        match runtime {
            RuntimeKind::Singularity => true,
            RuntimeKind::Docker => !self.is_singularity_file(),
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// Whether a mount is a single file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    File,
    Directory,
}

impl VolumeKind {
    pub(crate) fn parse(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            other => Err(Error::InvalidContainerSpec(format!(
                "mount type '{}' should be either file or directory",
                other
            ))),
        }
    }
}

/// Data direction of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Input,
    Output,
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host_path: PathBuf,
    pub mount_path: String,
    pub kind: VolumeKind,
    pub io: IoType,
}

impl Volume {
    pub fn input(host_path: impl Into<PathBuf>, mount_path: impl Into<String>, kind: VolumeKind) -> Self {
        Self {
            host_path: host_path.into(),
            mount_path: mount_path.into(),
            kind,
            io: IoType::Input,
        }
    }

    pub fn output(host_path: impl Into<PathBuf>, mount_path: impl Into<String>, kind: VolumeKind) -> Self {
        Self {
            host_path: host_path.into(),
            mount_path: mount_path.into(),
            kind,
            io: IoType::Output,
        }
    }

    /// Bind specification `<host>:<mount>:<ro|rw>`.
    pub fn bind_spec(&self) -> String {
        let mode = match self.io {
            IoType::Input => "ro",
            IoType::Output => "rw",
        };
        format!("{}:{}:{}", self.host_path.display(), self.mount_path, mode)
    }

    /// Makes the host side ready for binding.
    ///
    /// Inputs must already exist. Output directories are created; output
    /// files are created empty along with their parent directory.
    pub fn prepare(&self) -> Result<()> {
        match (self.io, self.kind) {
            (IoType::Input, _) => {
                if !self.host_path.exists() {
                    return Err(Error::Internal(format!(
                        "input volume should exist: {}",
                        self.host_path.display()
                    )));
                }
            }
            (IoType::Output, VolumeKind::Directory) => {
                fs::create_dir_all(&self.host_path)?;
            }
            (IoType::Output, VolumeKind::File) => {
                if let Some(parent) = self.host_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                if !self.host_path.exists() {
                    fs::File::create(&self.host_path)?;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Run Arguments
// =============================================================================

/// Allow-listed run arguments declared by a manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    pub shm_size: Option<String>,
    pub gpus: Option<GpuRequest>,
    pub entrypoint: Option<String>,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl RunArgs {
    /// Builds run arguments from a manifest `run_args` mapping.
    ///
    /// Keys outside the allow-list are rejected, naming every offender.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(map) => map,
            other => {
                return Err(Error::InvalidContainerSpec(format!(
                    "run_args should be a mapping, got {:?}",
                    other
                )));
            }
        };

        let mut rejected: Vec<String> = map
            .keys()
            .map(scalar_to_string)
            .filter(|key| !ALLOWED_RUN_ARGS.contains(&key.as_str()))
            .collect();
        if !rejected.is_empty() {
            rejected.sort();
            return Err(Error::InvalidContainerSpec(format!(
                "run args {} are not allowed",
                rejected.join(", ")
            )));
        }

        let mut args = Self::default();
        if let Some(shm) = map.get("shm_size").filter(|v| !v.is_null()) {
            args.shm_size = Some(scalar_to_string(shm));
        }
        if let Some(gpus) = map.get("gpus") {
            args.gpus = GpuRequest::from_value(gpus)?;
        }
        if let Some(entrypoint) = map.get("entrypoint").filter(|v| !v.is_null()) {
            args.entrypoint = Some(scalar_to_string(entrypoint));
        }
        if let Some(command) = map.get("command") {
            args.command = parse_command(command)?;
        }
        if let Some(env) = map.get("environment") {
            args.environment = parse_environment(env)?;
        }
        Ok(args)
    }
}

/// Command as a list or as a shell-quoted string.
pub(crate) fn parse_command(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => split_command(s),
        Value::Sequence(items) => Ok(items.iter().map(scalar_to_string).collect()),
        other => Err(Error::InvalidContainerSpec(format!(
            "command should be a string or a list, got {:?}",
            other
        ))),
    }
}

pub(crate) fn split_command(s: &str) -> Result<Vec<String>> {
    shlex::split(s).ok_or_else(|| {
        Error::InvalidContainerSpec(format!("unbalanced quotes in command '{}'", s))
    })
}

fn parse_environment(value: &Value) -> Result<BTreeMap<String, String>> {
    match value {
        Value::Null => Ok(BTreeMap::new()),
        Value::Mapping(map) => Ok(map
            .iter()
            .map(|(k, v)| (scalar_to_string(k), scalar_to_string(v)))
            .collect()),
        other => Err(Error::InvalidContainerSpec(format!(
            "environment should be a mapping, got {:?}",
            other
        ))),
    }
}

/// Renders a YAML scalar the way it was written.
pub(crate) fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

// =============================================================================
// Task Descriptor
// =============================================================================

/// Normalized execution model of one manifest task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub task: String,
    /// Image reference or image file URL.
    pub setup_args: String,
    pub input_volumes: Vec<Volume>,
    pub output_volumes: Vec<Volume>,
    pub run_args: RunArgs,
}

impl TaskDescriptor {
    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.input_volumes.iter().chain(self.output_volumes.iter())
    }
}

// =============================================================================
// Container Config
// =============================================================================

/// A parsed manifest in either dialect.
#[derive(Debug, Clone)]
pub enum ContainerConfig {
    Cube(CubeManifest),
    Simple(SimpleManifest),
}

impl ContainerConfig {
    /// Loads and validates a manifest file.
    ///
    /// Relative legacy parameters resolve against a `workspace` directory
    /// next to the manifest unless overridden with [`Self::with_workspace`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let value: Value = serde_yaml::from_str(&text)
            .map_err(|e| Error::InvalidContainerSpec(format!("{}: {}", path.display(), e)))?;
        let workspace = path
            .parent()
            .map(|p| p.join("workspace"))
            .unwrap_or_else(|| PathBuf::from("workspace"));
        let config = Self::from_value(value, workspace)?;
        debug!(
            "Loaded {} manifest from {}",
            config.container_type(),
            path.display()
        );
        Ok(config)
    }

    /// Detects the dialect and validates the schema.
    pub fn from_value(value: Value, workspace: PathBuf) -> Result<Self> {
        if !value.is_mapping() {
            return Err(Error::InvalidContainerSpec(
                "container config should be a mapping".to_string(),
            ));
        }

        let config = if let Some(raw) = value.get("container_type") {
            let ty = raw.as_str().ok_or_else(|| {
                Error::InvalidContainerSpec(format!(
                    "container_type should be a string: expected one of {}",
                    CONTAINER_TYPES.join(", ")
                ))
            })?;
            Self::Simple(SimpleManifest::new(ContainerType::parse(ty)?, value))
        } else if value.get("docker").is_some() || value.get("singularity").is_some() {
            Self::Cube(CubeManifest::new(value, workspace))
        } else {
            return Err(Error::InvalidContainerSpec(format!(
                "missing container_type: expected one of {}",
                CONTAINER_TYPES.join(", ")
            )));
        };

        config.check_schema()?;
        Ok(config)
    }

    /// Overrides the workspace used by legacy relative parameters.
    pub fn with_workspace(self, workspace: impl Into<PathBuf>) -> Self {
        match self {
            Self::Cube(cube) => Self::Cube(cube.with_workspace(workspace.into())),
            other => other,
        }
    }

    pub fn container_type(&self) -> ContainerType {
        match self {
            Self::Cube(_) => ContainerType::DockerImage,
            Self::Simple(simple) => simple.container_type(),
        }
    }

    pub fn check_schema(&self) -> Result<()> {
        match self {
            Self::Cube(cube) => cube.check_schema(),
            Self::Simple(simple) => simple.check_schema(),
        }
    }

    pub fn check_task_schema(&self, task: &str) -> Result<()> {
        match self {
            Self::Cube(cube) => cube.check_task_schema(task),
            Self::Simple(simple) => simple.check_task_schema(task),
        }
    }

    /// Image reference or image file URL.
    pub fn setup_args(&self) -> Result<String> {
        match self {
            Self::Cube(cube) => cube.setup_args(),
            Self::Simple(simple) => simple.setup_args(),
        }
    }

    /// Returns `(inputs, outputs)` for a task.
    pub fn volumes(&self, task: &str, mounts: &MountBindings) -> Result<(Vec<Volume>, Vec<Volume>)> {
        self.check_task_schema(task)?;
        match self {
            Self::Cube(cube) => cube.volumes(task, mounts),
            Self::Simple(simple) => simple.volumes(task, mounts),
        }
    }

    pub fn run_args(&self, task: &str, mounts: &MountBindings) -> Result<RunArgs> {
        self.check_task_schema(task)?;
        match self {
            Self::Cube(cube) => cube.run_args(task, mounts),
            Self::Simple(simple) => simple.run_args(task),
        }
    }

    /// Builds the full descriptor of a task.
    pub fn describe(&self, task: &str, mounts: &MountBindings) -> Result<TaskDescriptor> {
        let (input_volumes, output_volumes) = self.volumes(task, mounts)?;
        Ok(TaskDescriptor {
            task: task.to_string(),
            setup_args: self.setup_args()?,
            input_volumes,
            output_volumes,
            run_args: self.run_args(task, mounts)?,
        })
    }

    /// Whether the `prepare` task writes a report file.
    pub fn is_report_specified(&self) -> bool {
        self.prepare_declares_output("report_file")
    }

    /// Whether the `prepare` task writes a metadata directory.
    pub fn is_metadata_specified(&self) -> bool {
        self.prepare_declares_output("metadata_path")
    }

    fn prepare_declares_output(&self, name: &str) -> bool {
        match self {
            Self::Cube(cube) => cube.prepare_declares_output(name),
            Self::Simple(simple) => simple.prepare_declares_output(name),
        }
    }
}

pub(crate) fn task_names(value: &Value) -> Vec<String> {
    value
        .get("tasks")
        .and_then(|t| t.as_mapping())
        .map(|m| m.keys().map(scalar_to_string).collect())
        .unwrap_or_default()
}
