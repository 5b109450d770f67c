//! GPU request normalization.
//!
//! Manifests and user configuration express GPU needs loosely: a bare
//! number, a numeric string, `"all"`, `"device=0,2"` or a YAML list of
//! device ids. [`GpuRequest`] is the closed form every runner consumes.

use crate::error::{Error, Result};
use serde_yaml::Value;
use std::fmt;

/// Normalized GPU request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuRequest {
    /// Every GPU on the host.
    All,
    /// Any `n` GPUs (Docker only).
    Count(u32),
    /// Specific device ids.
    Devices(Vec<String>),
}

impl GpuRequest {
    /// Normalizes a YAML value.
    ///
    /// Returns `Ok(None)` for absent, empty or zero requests.
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Self::parse(s),
            Value::Number(n) => match n.as_u64() {
                Some(0) => Ok(None),
                Some(count) => u32::try_from(count)
                    .map(|c| Some(Self::Count(c)))
                    .map_err(|_| invalid(&n.to_string())),
                None => Err(invalid(&n.to_string())),
            },
            Value::Sequence(items) => {
                if items.is_empty() {
                    return Ok(None);
                }
                let ids = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
                        Value::Number(n) if n.is_u64() => Ok(n.to_string()),
                        other => Err(invalid(&format!("{:?}", other))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(Self::Devices(ids)))
            }
            other => Err(invalid(&format!("{:?}", other))),
        }
    }

    /// Normalizes a string form (`""`, `"0"`, `"all"`, `"2"`, `"device=0,1"`).
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let s = raw.trim();
        if s.is_empty() {
            return Ok(None);
        }
        if s == "all" {
            return Ok(Some(Self::All));
        }
        if s.chars().all(|c| c.is_ascii_digit()) {
            let count: u32 = s.parse().map_err(|_| invalid(raw))?;
            return Ok((count > 0).then_some(Self::Count(count)));
        }
        if let Some(ids) = s.strip_prefix("device=")
            && !ids.is_empty()
        {
            let ids: Vec<String> = ids.split(',').map(|id| id.trim().to_string()).collect();
            if ids.iter().any(|id| id.is_empty()) {
                return Err(invalid(raw));
            }
            return Ok(Some(Self::Devices(ids)));
        }
        Err(invalid(raw))
    }

    /// Value passed to `docker run --gpus`.
    pub fn docker_arg(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Count(n) => n.to_string(),
            Self::Devices(ids) => format!("device={}", ids.join(",")),
        }
    }
}

impl fmt::Display for GpuRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.docker_arg())
    }
}

fn invalid(value: &str) -> Error {
    Error::InvalidContainerSpec(format!(
        "invalid gpus argument '{}': expected \"all\", a GPU count or \"device=<id,...>\"",
        value
    ))
}
