use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::sidecar::Sidecar;

// ---------------------------------------------------------------------------
// Step kind
// ---------------------------------------------------------------------------

/// What flavour of pipeline work a container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Check,
    Get,
    Put,
    Task,
    Run,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Get => "get",
            Self::Put => "put",
            Self::Task => "task",
            Self::Run => "run",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step metadata
// ---------------------------------------------------------------------------

/// Pipeline coordinates of a step. Empty strings mean "not set" — one-off
/// containers and resource-type fetches legitimately lack some of these.
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub kind: StepKind,
    pub pipeline: String,
    pub job: String,
    pub build: String,
    pub step: String,
}

impl StepMetadata {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            pipeline: String::new(),
            job: String::new(),
            build: String::new(),
            step: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact sources
// ---------------------------------------------------------------------------

/// A typed byte stream produced by an earlier step, addressable by the volume
/// handle it was stored under.
#[async_trait::async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Volume handle the artifact is keyed by.
    fn handle(&self) -> &str;

    /// Open the artifact as an uncompressed tar stream.
    async fn open(&self) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>>;
}

// ---------------------------------------------------------------------------
// Step spec
// ---------------------------------------------------------------------------

/// An input mount: where the data lands, and (optionally) where it comes from.
#[derive(Clone)]
pub struct StepInput {
    pub destination: String,
    pub source: Option<Arc<dyn ArtifactSource>>,
}

impl std::fmt::Debug for StepInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepInput")
            .field("destination", &self.destination)
            .field("source", &self.source.as_ref().map(|s| s.handle().to_owned()))
            .finish()
    }
}

/// Requested resource ceiling for the main container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU in millicores.
    pub cpu: Option<u64>,
    /// Memory in bytes.
    pub memory: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Declarative description of a step container, as handed over by the engine.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub kind: StepKind,
    /// Image reference; may carry a `docker://`-style scheme prefix.
    pub image: String,
    /// Resource-type name used to resolve the image when `image` is empty.
    pub resource_type: String,
    pub dir: String,
    pub env: Vec<(String, String)>,
    pub inputs: Vec<StepInput>,
    /// Output name → destination path.
    pub outputs: BTreeMap<String, String>,
    pub caches: Vec<String>,
    pub limits: ResourceLimits,
    pub privileged: bool,
    pub sidecars: Vec<Sidecar>,
}

impl StepSpec {
    pub fn new(kind: StepKind, image: impl Into<String>) -> Self {
        Self {
            kind,
            image: image.into(),
            resource_type: String::new(),
            dir: String::new(),
            env: Vec::new(),
            inputs: Vec::new(),
            outputs: BTreeMap::new(),
            caches: Vec::new(),
            limits: ResourceLimits::default(),
            privileged: false,
            sidecars: Vec::new(),
        }
    }
}
