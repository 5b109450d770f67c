//! Legacy cube manifest dialect.
//!
//! Cube manifests describe tasks as named parameters rather than volumes:
//!
//! ```yaml
//! docker:
//!   image: vendor/prep:0.1
//!   gpu_args: --shm-size 2g
//! tasks:
//!   prepare:
//!     parameters:
//!       inputs:
//!         data_path: data/
//!         labels_path: { type: file, default: labels.csv }
//!       outputs:
//!         output_path: prepped/
//! ```
//!
//! Every distinct host directory becomes one mount named `/mlcube_io<n>`,
//! numbered in declaration order with inputs first. Each parameter is then
//! passed to the container as `--<name>=<mount>/<file>`. A file parameter
//! mounts its parent directory, so two files in the same directory share a
//! mount.
//!
//! Parameter kinds come from an explicit `type`, a trailing path separator
//! (directory) or, for inputs only, the host filesystem. An output whose
//! kind cannot be determined is rejected.

use super::{
    IoType, MountBindings, RunArgs, Volume, VolumeKind, scalar_to_string, split_command, task_names,
};
use crate::constants::CUBE_MOUNT_PREFIX;
use crate::error::{Error, Result};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

/// Legacy manifest with a `docker` section and parameterized tasks.
#[derive(Debug, Clone)]
pub struct CubeManifest {
    raw: Value,
    workspace: PathBuf,
}

/// Everything derived from one task's parameters.
struct ParsedTask {
    inputs: Vec<Volume>,
    outputs: Vec<Volume>,
    run_args: RunArgs,
}

impl CubeManifest {
    pub(crate) fn new(raw: Value, workspace: PathBuf) -> Self {
        Self { raw, workspace }
    }

    pub(crate) fn with_workspace(self, workspace: PathBuf) -> Self {
        Self { workspace, ..self }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn check_schema(&self) -> Result<()> {
        if self
            .raw
            .get("docker")
            .and_then(|d| d.get("image"))
            .and_then(|i| i.as_str())
            .is_none()
        {
            return Err(Error::InvalidContainerSpec(
                "cube manifest with only a singularity section is not supported".to_string(),
            ));
        }
        let tasks = self.raw.get("tasks").and_then(|t| t.as_mapping()).ok_or_else(|| {
            Error::InvalidContainerSpec("cube manifest doesn't have a 'tasks' key".to_string())
        })?;
        for (name, task) in tasks {
            if task.get("parameters").is_none() {
                return Err(Error::InvalidContainerSpec(format!(
                    "cube task '{}' doesn't have a 'parameters' key",
                    scalar_to_string(name)
                )));
            }
        }
        Ok(())
    }

    pub fn check_task_schema(&self, task: &str) -> Result<()> {
        if self.task(task).is_none() {
            return Err(Error::InvalidContainerSpec(format!(
                "task '{}' is not found in container config (declared: {})",
                task,
                task_names(&self.raw).join(", ")
            )));
        }
        Ok(())
    }

    pub fn setup_args(&self) -> Result<String> {
        self.raw
            .get("docker")
            .and_then(|d| d.get("image"))
            .and_then(|i| i.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidContainerSpec("missing 'docker.image' field".to_string()))
    }

    pub fn volumes(&self, task: &str, mounts: &MountBindings) -> Result<(Vec<Volume>, Vec<Volume>)> {
        let parsed = self.parse_task(task, mounts)?;
        Ok((parsed.inputs, parsed.outputs))
    }

    pub fn run_args(&self, task: &str, mounts: &MountBindings) -> Result<RunArgs> {
        Ok(self.parse_task(task, mounts)?.run_args)
    }

    pub(crate) fn prepare_declares_output(&self, name: &str) -> bool {
        self.task("prepare")
            .and_then(|t| t.get("parameters"))
            .and_then(|p| p.get("outputs"))
            .and_then(|o| o.get(name))
            .is_some()
    }

    fn task(&self, task: &str) -> Option<&Value> {
        self.raw.get("tasks").and_then(|t| t.get(task))
    }

    fn parse_task(&self, task: &str, mounts: &MountBindings) -> Result<ParsedTask> {
        let task_info = self.task(task).ok_or_else(|| {
            Error::InvalidContainerSpec(format!("task '{}' is not found in container config", task))
        })?;

        let (entrypoint, mut command) = parse_entrypoint(task_info)?;
        if entrypoint.is_none() {
            command.push(task.to_string());
        }

        let mut volumes: Vec<Volume> = Vec::new();
        let params = task_info.get("parameters");
        for (section, io) in [("inputs", IoType::Input), ("outputs", IoType::Output)] {
            let Some(section) = params.and_then(|p| p.get(section)).and_then(|s| s.as_mapping())
            else {
                continue;
            };
            for (name, value) in section {
                let name = scalar_to_string(name);
                let (kind, path) = self.resolve_parameter(&name, value, mounts, io)?;
                let (host_dir, file_name) = match kind {
                    VolumeKind::File => split_file(&path)?,
                    VolumeKind::Directory => (path, String::new()),
                };

                let mount_path = match volumes.iter().find(|v| v.host_path == host_dir) {
                    Some(existing) => existing.mount_path.clone(),
                    None => {
                        let mount_path = format!("{}{}", CUBE_MOUNT_PREFIX, volumes.len());
                        volumes.push(Volume {
                            host_path: host_dir,
                            mount_path: mount_path.clone(),
                            kind: VolumeKind::Directory,
                            io,
                        });
                        mount_path
                    }
                };
                command.push(format!("--{}={}/{}", name, mount_path, file_name));
            }
        }

        let (inputs, outputs) = volumes.into_iter().partition(|v| v.io == IoType::Input);
        Ok(ParsedTask {
            inputs,
            outputs,
            run_args: RunArgs {
                shm_size: self.shm_size(),
                entrypoint,
                command,
                ..RunArgs::default()
            },
        })
    }

    fn resolve_parameter(
        &self,
        name: &str,
        value: &Value,
        mounts: &MountBindings,
        io: IoType,
    ) -> Result<(VolumeKind, PathBuf)> {
        let (mut kind, mut raw) = match value {
            Value::Mapping(_) => {
                let kind = value.get("type").and_then(|t| t.as_str()).map(VolumeKind::parse);
                let default = value.get("default").map(scalar_to_string).unwrap_or_default();
                (kind.transpose()?, default)
            }
            other => (None, scalar_to_string(other)),
        };

        if has_trailing_separator(&raw) {
            kind = Some(VolumeKind::Directory);
        }
        if let Some(bound) = mounts.get(name) {
            raw = bound.clone();
        }
        if has_trailing_separator(&raw) {
            kind = Some(VolumeKind::Directory);
        }

        let path = self.make_absolute(&raw);
        let kind = match (kind, io) {
            (Some(kind), _) => kind,
            (None, IoType::Output) => {
                return Err(Error::InvalidContainerSpec(format!(
                    "cannot determine whether output parameter '{}' ({}) is a file or a directory",
                    name, raw
                )));
            }
            (None, IoType::Input) if path.is_file() => VolumeKind::File,
            (None, IoType::Input) if path.is_dir() => VolumeKind::Directory,
            (None, IoType::Input) => {
                return Err(Error::InvalidContainerSpec(format!(
                    "input parameter '{}' points to a missing path: {}",
                    name,
                    path.display()
                )));
            }
        };
        Ok((kind, path))
    }

    fn make_absolute(&self, raw: &str) -> PathBuf {
        let expanded = match raw.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(raw)),
            None => PathBuf::from(raw),
        };
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            self.workspace.join(expanded)
        };
        // Drop the trailing separator so equal directories dedupe.
        absolute.components().collect()
    }

    fn shm_size(&self) -> Option<String> {
        let gpu_args = self.raw.get("docker")?.get("gpu_args")?.as_str()?;
        let mut tokens = gpu_args.split_whitespace();
        tokens.find(|t| *t == "--shm-size")?;
        tokens.next().map(str::to_string)
    }
}

fn parse_entrypoint(task_info: &Value) -> Result<(Option<String>, Vec<String>)> {
    let Some(raw) = task_info.get("entrypoint").and_then(|e| e.as_str()) else {
        return Ok((None, Vec::new()));
    };
    let mut parts = split_command(raw)?.into_iter();
    match parts.next() {
        Some(entrypoint) => Ok((Some(entrypoint), parts.collect())),
        None => Ok((None, Vec::new())),
    }
}

fn has_trailing_separator(s: &str) -> bool {
    s.ends_with('/') || s.ends_with('\\')
}

fn split_file(path: &Path) -> Result<(PathBuf, String)> {
    let parent = path.parent().map(Path::to_path_buf);
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    match (parent, name) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(Error::InvalidContainerSpec(format!(
            "file parameter has no file name: {}",
            path.display()
        ))),
    }
}
