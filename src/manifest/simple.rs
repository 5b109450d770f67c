//! Simple manifest dialect.
//!
//! ```yaml
//! container_type: docker-image
//! image: vendor/model:1.0
//! tasks:
//!   infer:
//!     input_volumes:
//!       data_path: { type: directory, mount_path: /data }
//!     output_volumes:
//!       output_path: { type: directory, mount_path: /out }
//!     run_args:
//!       gpus: all
//!       command: ["python", "infer.py"]
//! ```

use super::{ContainerType, MountBindings, RunArgs, Volume, VolumeKind, scalar_to_string, task_names};
use crate::error::{Error, Result};
use serde_yaml::Value;

const VOLUME_SECTIONS: [&str; 2] = ["input_volumes", "output_volumes"];

/// Manifest declaring `container_type` explicitly.
#[derive(Debug, Clone)]
pub struct SimpleManifest {
    container_type: ContainerType,
    raw: Value,
}

impl SimpleManifest {
    pub(crate) fn new(container_type: ContainerType, raw: Value) -> Self {
        Self {
            container_type,
            raw,
        }
    }

    pub fn container_type(&self) -> ContainerType {
        self.container_type
    }

    pub fn check_schema(&self) -> Result<()> {
        if self.raw.get("image").and_then(|v| v.as_str()).is_none() {
            return Err(Error::InvalidContainerSpec(
                "container config should have an 'image' field".to_string(),
            ));
        }
        let tasks = self.raw.get("tasks").and_then(|t| t.as_mapping()).ok_or_else(|| {
            Error::InvalidContainerSpec("container config should have a 'tasks' field".to_string())
        })?;

        for (name, task) in tasks {
            for section in VOLUME_SECTIONS {
                let Some(volumes) = task.get(section) else {
                    continue;
                };
                let Some(volumes) = volumes.as_mapping() else {
                    return Err(Error::InvalidContainerSpec(format!(
                        "task '{}' {} should be a mapping",
                        scalar_to_string(name),
                        section
                    )));
                };
                for (label, volume) in volumes {
                    let kind = volume.get("type").and_then(|v| v.as_str());
                    let mount = volume.get("mount_path").and_then(|v| v.as_str());
                    let (Some(kind), Some(_)) = (kind, mount) else {
                        return Err(Error::InvalidContainerSpec(format!(
                            "volume '{}' of task '{}' should have 'type' and 'mount_path' fields",
                            scalar_to_string(label),
                            scalar_to_string(name)
                        )));
                    };
                    VolumeKind::parse(kind)?;
                }
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
            .get("image")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidContainerSpec("missing 'image' field".to_string()))
    }

    pub fn volumes(&self, task: &str, mounts: &MountBindings) -> Result<(Vec<Volume>, Vec<Volume>)> {
        let task_info = self.task_or_err(task)?;
        let inputs = collect_volumes(task_info.get("input_volumes"), mounts, |h, m, k| Volume::input(h, m, k))?;
        let outputs = collect_volumes(task_info.get("output_volumes"), mounts, |h, m, k| Volume::output(h, m, k))?;
        Ok((inputs, outputs))
    }

    pub fn run_args(&self, task: &str) -> Result<RunArgs> {
        let task_info = self.task_or_err(task)?;
        match task_info.get("run_args") {
            Some(raw) => RunArgs::from_value(raw),
            None => Ok(RunArgs::default()),
        }
    }

    pub(crate) fn prepare_declares_output(&self, name: &str) -> bool {
        self.task("prepare")
            .and_then(|t| t.get("output_volumes"))
            .and_then(|v| v.get(name))
            .is_some()
    }

    fn task(&self, task: &str) -> Option<&Value> {
        self.raw.get("tasks").and_then(|t| t.get(task))
    }

    fn task_or_err(&self, task: &str) -> Result<&Value> {
        self.task(task).ok_or_else(|| {
            Error::InvalidContainerSpec(format!("task '{}' is not found in container config", task))
        })
    }
}

fn collect_volumes(
    section: Option<&Value>,
    mounts: &MountBindings,
    make: fn(std::path::PathBuf, String, VolumeKind) -> Volume,
) -> Result<Vec<Volume>> {
    let Some(map) = section.and_then(|s| s.as_mapping()) else {
        return Ok(Vec::new());
    };

    let mut volumes = Vec::with_capacity(map.len());
    for (label, volume) in map {
        let label = scalar_to_string(label);
        let host_path = mounts.get(&label).ok_or_else(|| {
            Error::InvalidContainerSpec(format!("no host path is bound for volume '{}'", label))
        })?;
        let kind = VolumeKind::parse(volume.get("type").and_then(|v| v.as_str()).unwrap_or(""))?;
        let mount_path = volume
            .get("mount_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        volumes.push(make(host_path.into(), mount_path, kind));
    }
    Ok(volumes)
}
