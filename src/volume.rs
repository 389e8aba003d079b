//! Per-mount volume handles.
//!
//! A volume is created alongside its container but only learns which pod it
//! lives in when the first process runs; until then streaming fails fast.
//! Data moves as uncompressed tar over the exec channel, except for the
//! artifact-store volume, where init and helper containers do all the moving.

use std::sync::{Arc, RwLock};

use tokio::io::AsyncRead;

use crate::artifact;
use crate::exec::{ExecError, ExecIo, Executor};
use crate::names::MAIN_CONTAINER_NAME;

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("volume {0} not yet assigned to a pod")]
    PodNotAssigned(String),

    #[error("streaming is disabled for artifact-store volumes")]
    StreamingDisabled,

    #[error("no exec channel configured for this container")]
    NoExecChannel,

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// Empty-dir mount, bound to a pod at first run.
    DeferredEmptyDir,
    /// PVC-backed cache mount, bound to a pod at first run.
    DeferredPvc,
    /// The shared artifact PVC; streaming goes through init/helper containers.
    ArtifactStore,
}

pub struct Volume {
    handle: String,
    mount_path: String,
    kind: VolumeKind,
    executor: Option<Arc<dyn Executor>>,
    pod_name: RwLock<Option<String>>,
}

impl Volume {
    pub fn new(
        handle: impl Into<String>,
        mount_path: impl Into<String>,
        kind: VolumeKind,
        executor: Option<Arc<dyn Executor>>,
    ) -> Self {
        Self {
            handle: handle.into(),
            mount_path: mount_path.into(),
            kind,
            executor,
            pod_name: RwLock::new(None),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    /// PVC-relative tar key for artifact-store volumes.
    pub fn artifact_key(&self) -> Option<String> {
        (self.kind == VolumeKind::ArtifactStore).then(|| artifact::artifact_key(&self.handle))
    }

    /// Bind the volume to its pod. The first binding wins; a volume never
    /// migrates between pods.
    pub fn bind_pod(&self, pod_name: &str) {
        let mut guard = self.pod_name.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(pod_name.to_owned());
        }
    }

    pub fn pod_name(&self) -> Option<String> {
        self.pod_name
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Extract a tar stream into the mount.
    #[tracing::instrument(skip(self, reader), fields(volume = %self.handle, path))]
    pub async fn stream_in(
        &self,
        path: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<(), VolumeError> {
        if self.kind == VolumeKind::ArtifactStore {
            return Err(VolumeError::StreamingDisabled);
        }
        let executor = self.executor.as_ref().ok_or(VolumeError::NoExecChannel)?;
        let pod = self
            .pod_name()
            .ok_or_else(|| VolumeError::PodNotAssigned(self.handle.clone()))?;

        let dest = self.resolve(path);
        let command = vec!["tar".to_owned(), "xf".to_owned(), "-".to_owned(), "-C".to_owned(), dest];
        executor
            .exec(
                &pod,
                MAIN_CONTAINER_NAME,
                &command,
                ExecIo {
                    stdin: Some(reader),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Read the mount's contents back as a tar stream.
    ///
    /// The remote tar runs in the background; a failure there shows up to the
    /// reader as a truncated stream and is logged.
    #[tracing::instrument(skip(self), fields(volume = %self.handle, path))]
    pub async fn stream_out(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, VolumeError> {
        if self.kind == VolumeKind::ArtifactStore {
            return Err(VolumeError::StreamingDisabled);
        }
        let executor = Arc::clone(self.executor.as_ref().ok_or(VolumeError::NoExecChannel)?);
        let pod = self
            .pod_name()
            .ok_or_else(|| VolumeError::PodNotAssigned(self.handle.clone()))?;

        let src = self.resolve(path);
        let command = vec![
            "tar".to_owned(),
            "cf".to_owned(),
            "-".to_owned(),
            "-C".to_owned(),
            src,
            ".".to_owned(),
        ];

        let (read_half, write_half) = tokio::io::duplex(64 * 1024);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let result = executor
                .exec(
                    &pod,
                    MAIN_CONTAINER_NAME,
                    &command,
                    ExecIo {
                        stdout: Some(Box::new(write_half)),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(err) = result {
                tracing::warn!(volume = %handle, error = %err, "stream-out failed");
            }
        });

        Ok(Box::new(read_half))
    }

    fn resolve(&self, path: &str) -> String {
        if path.is_empty() || path == "." {
            self.mount_path.clone()
        } else {
            format!("{}/{}", self.mount_path.trim_end_matches('/'), path.trim_start_matches('/'))
        }
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("handle", &self.handle)
            .field("mount_path", &self.mount_path)
            .field("kind", &self.kind)
            .field("pod_name", &self.pod_name())
            .finish()
    }
}
