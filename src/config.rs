//! Engine configuration.
//!
//! [`EngineConfig`] is passed explicitly into every component that needs a
//! storage path, a runtime choice or a user-level override. It can be built
//! in code with [`EngineConfig::with_root`] or loaded from YAML:
//!
//! ```yaml
//! storage_root: /data/cubexec
//! runtime: singularity
//! gpus: all
//! download:
//!   max_attempts: 5
//! ```

use crate::constants::{
    CONTAINERS_DIR, DEFAULT_CONTAINER_LOGLEVEL, DEFAULT_STORAGE_DIR, DOCKER_EXECUTABLE,
    DOWNLOAD_TIMEOUT, IMAGE_PREPARE_TIMEOUT, IMAGES_DIR, KEYS_DIR, PKI_DIR,
    SINGULARITY_EXECUTABLES, TMP_DIR,
};
use crate::error::{Error, Result};
use crate::resources::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Container runtime family used to execute images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Singularity,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Singularity => write!(f, "singularity"),
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "singularity" | "apptainer" => Ok(Self::Singularity),
            other => Err(Error::InvalidArgument(format!(
                "unknown runtime '{}': expected docker or singularity",
                other
            ))),
        }
    }
}

/// Storage layout, runtime selection and user-level overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root under which every other default path lives.
    pub storage_root: PathBuf,
    /// Shared content-addressed image cache.
    pub images_dir: PathBuf,
    /// Scratch space for in-flight downloads.
    pub tmp_dir: PathBuf,
    /// Per-container storage root.
    pub containers_dir: PathBuf,
    /// Local model-owner keys.
    pub keys_dir: PathBuf,
    /// User private keys, one directory per issuing authority.
    pub pki_dir: PathBuf,

    pub runtime: RuntimeKind,

    /// Overrides any `gpus` declared by a manifest.
    pub gpus: Option<serde_yaml::Value>,
    /// Overrides any `shm_size` declared by a manifest.
    pub shm_size: Option<String>,
    /// Log level passed into containers.
    pub container_loglevel: Option<String>,

    pub download: RetryPolicy,
    #[serde(with = "duration_secs")]
    pub download_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub image_prepare_timeout: Duration,

    pub docker_executable: String,
    pub singularity_executables: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_root(default_root())
    }
}

impl EngineConfig {
    /// Creates a configuration with every path placed under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            images_dir: root.join(IMAGES_DIR),
            tmp_dir: root.join(TMP_DIR),
            containers_dir: root.join(CONTAINERS_DIR),
            keys_dir: root.join(KEYS_DIR),
            pki_dir: root.join(PKI_DIR),
            storage_root: root,
            runtime: RuntimeKind::default(),
            gpus: None,
            shm_size: None,
            container_loglevel: Some(DEFAULT_CONTAINER_LOGLEVEL.to_string()),
            download: RetryPolicy::default(),
            download_timeout: DOWNLOAD_TIMEOUT,
            image_prepare_timeout: IMAGE_PREPARE_TIMEOUT,
            docker_executable: DOCKER_EXECUTABLE.to_string(),
            singularity_executables: SINGULARITY_EXECUTABLES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Loads a configuration from a YAML file.
    ///
    /// Paths that are not set explicitly are derived from `storage_root`.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        let root = value
            .get("storage_root")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(default_root);

        // Start from root-derived defaults, then overlay explicit keys.
        let base = serde_yaml::to_value(Self::with_root(root))?;
        let merged = overlay(base, value);
        Ok(serde_yaml::from_value(merged)?)
    }

    /// Returns the storage directory of one container.
    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.containers_dir.join(container_id)
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_STORAGE_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR))
}

fn overlay(base: serde_yaml::Value, top: serde_yaml::Value) -> serde_yaml::Value {
    match (base, top) {
        (serde_yaml::Value::Mapping(mut base), serde_yaml::Value::Mapping(top)) => {
            for (key, value) in top {
                let merged = match base.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base)
        }
        (_, top) => top,
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
