//! Operator-supplied sidecar definitions.
//!
//! Sidecars arrive as a YAML list and are validated here, at parse time; the
//! pod builder can then map them straight into containers without re-checking
//! names.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::names::RESERVED_CONTAINER_NAMES;

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("invalid sidecar YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("sidecar {index} has an empty name")]
    EmptyName { index: usize },

    #[error("sidecar {name:?} has an empty image")]
    EmptyImage { name: String },

    #[error("sidecar name {name:?} is reserved")]
    ReservedName { name: String },

    #[error("duplicate sidecar name {name:?}")]
    DuplicateName { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<SidecarEnv>,
    #[serde(default)]
    pub ports: Vec<SidecarPort>,
    #[serde(default)]
    pub resources: Option<SidecarResources>,
    #[serde(default, rename = "workingDir")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarEnv {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarPort {
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    /// Defaults to TCP when omitted.
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SidecarResources {
    #[serde(default)]
    pub requests: Option<SidecarResourceList>,
    #[serde(default)]
    pub limits: Option<SidecarResourceList>,
}

/// Kubernetes quantity strings, passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SidecarResourceList {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// Parse and validate an operator sidecar file.
pub fn parse_sidecars(yaml: &str) -> Result<Vec<Sidecar>, SidecarError> {
    let sidecars: Vec<Sidecar> = serde_yaml::from_str(yaml)?;
    validate(&sidecars)?;
    Ok(sidecars)
}

fn validate(sidecars: &[Sidecar]) -> Result<(), SidecarError> {
    let mut seen = BTreeSet::new();
    for (index, sc) in sidecars.iter().enumerate() {
        if sc.name.is_empty() {
            return Err(SidecarError::EmptyName { index });
        }
        if sc.image.is_empty() {
            return Err(SidecarError::EmptyImage {
                name: sc.name.clone(),
            });
        }
        if RESERVED_CONTAINER_NAMES.contains(&sc.name.as_str()) {
            return Err(SidecarError::ReservedName {
                name: sc.name.clone(),
            });
        }
        if !seen.insert(sc.name.as_str()) {
            return Err(SidecarError::DuplicateName {
                name: sc.name.clone(),
            });
        }
    }
    Ok(())
}
