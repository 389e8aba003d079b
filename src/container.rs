//! The container controller: owns one step, creates its pod lazily on the
//! first run, and recovers completed state through pod annotations after an
//! orchestrator restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::db::CreatedContainer;
use crate::exec::Executor;
use crate::metrics::Metrics;
use crate::names;
use crate::pods::{self, PodApi};
use crate::podspec::{self, Entrypoint, PodParams, PodSpecError};
use crate::process::{
    DirectProcess, ExecProcess, ExecProcessParams, ExitedProcess, Process, ProcessIo, ProcessSpec,
};
use crate::retryable::{self, PodApiError};
use crate::step::{StepMetadata, StepSpec};
use crate::volume::{Volume, VolumeKind};

/// Properties mirrored into pod annotations so they survive a restart.
pub const PROPERTY_EXIT_STATUS: &str = "exit-status";
pub const PROPERTY_RESOURCE_RESULT: &str = "resource-result";

const PERSISTED_PROPERTIES: [&str; 2] = [PROPERTY_EXIT_STATUS, PROPERTY_RESOURCE_RESULT];

/// Bound on annotation reads and writes.
const PROPERTY_IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The pod is gone; the engine falls through to a fresh run.
    #[error("pod {0} does not exist")]
    PodMissing(String),

    /// Exec-mode attach found a live pause pod but no recorded exit; the
    /// engine falls through to run, which re-execs in the same pod.
    #[error("process has not exited yet")]
    NotYetExited,

    #[error("unparseable exit-status annotation {0:?}")]
    BadExitStatus(String),

    #[error(transparent)]
    PodSpec(#[from] PodSpecError),

    #[error(transparent)]
    Api(#[from] PodApiError),
}

impl ContainerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_retryable())
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// Concurrent-safe property map shared between the container and its
/// processes. In-memory values always win over annotation loads.
#[derive(Default)]
pub struct Properties {
    map: std::sync::RwLock<HashMap<String, String>>,
    loaded: AtomicBool,
}

impl Properties {
    pub fn get(&self, key: &str) -> Option<String> {
        self.map
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    /// Copy of the current map.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.map
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn merge_missing(&self, annotations: &BTreeMap<String, String>) {
        let mut map = self
            .map
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in PERSISTED_PROPERTIES {
            if let Some(value) = annotations.get(key) {
                map.entry(key.to_owned()).or_insert_with(|| value.clone());
            }
        }
    }

    fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

/// Best-effort, bounded annotation write. Failures are logged, never fatal:
/// the in-memory property map remains authoritative for this process.
pub(crate) async fn persist_annotation(pods: &dyn PodApi, pod: &str, key: &str, value: &str) {
    let annotations = BTreeMap::from([(key.to_owned(), value.to_owned())]);
    match tokio::time::timeout(PROPERTY_IO_TIMEOUT, pods.patch_annotations(pod, annotations)).await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(%pod, %key, error = %err, "failed to persist annotation");
        }
        Err(_) => {
            tracing::warn!(%pod, %key, "annotation write timed out");
        }
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

pub struct ContainerParams {
    pub handle: Uuid,
    pub metadata: StepMetadata,
    pub spec: StepSpec,
    pub config: Arc<RuntimeConfig>,
    pub worker: String,
    pub pods: Arc<dyn PodApi>,
    /// Present in exec mode; direct mode follows logs instead.
    pub executor: Option<Arc<dyn Executor>>,
    pub db: Arc<dyn CreatedContainer>,
    pub metrics: Arc<dyn Metrics>,
}

pub struct Container {
    handle: Uuid,
    pod_name: String,
    metadata: StepMetadata,
    spec: StepSpec,
    config: Arc<RuntimeConfig>,
    worker: String,
    pods: Arc<dyn PodApi>,
    executor: Option<Arc<dyn Executor>>,
    db: Arc<dyn CreatedContainer>,
    metrics: Arc<dyn Metrics>,
    properties: Arc<Properties>,
    volumes: Vec<Arc<Volume>>,
    /// Pairs each step input (by position) with its volume.
    input_volumes: Vec<Arc<Volume>>,
    /// Cache mounts are scratch space, never uploaded as outputs.
    cache_volumes: Vec<Arc<Volume>>,
}

impl Container {
    pub fn new(params: ContainerParams) -> Self {
        let ContainerParams {
            handle,
            metadata,
            spec,
            config,
            worker,
            pods,
            executor,
            db,
            metrics,
        } = params;

        let pod_name = names::pod_name(&metadata, &handle.to_string());

        let mut volumes: Vec<Arc<Volume>> = Vec::new();
        let mut input_volumes = Vec::new();
        let mut cache_volumes = Vec::new();

        let new_volume = |mount: &str, kind: VolumeKind| {
            Arc::new(Volume::new(
                Uuid::new_v4().to_string(),
                mount,
                kind,
                executor.clone(),
            ))
        };

        if !spec.dir.is_empty() {
            volumes.push(new_volume(&spec.dir, VolumeKind::DeferredEmptyDir));
        }
        for input in &spec.inputs {
            let volume = new_volume(&input.destination, VolumeKind::DeferredEmptyDir);
            input_volumes.push(Arc::clone(&volume));
            volumes.push(volume);
        }
        for path in spec.outputs.values() {
            volumes.push(new_volume(path, VolumeKind::DeferredEmptyDir));
        }
        let cache_kind = if config.cache_pvc.is_some() {
            VolumeKind::DeferredPvc
        } else {
            VolumeKind::DeferredEmptyDir
        };
        for path in &spec.caches {
            let volume = new_volume(path, cache_kind);
            cache_volumes.push(Arc::clone(&volume));
            volumes.push(volume);
        }
        if podspec::artifacts_enabled(&config, spec.kind) {
            volumes.push(new_volume(
                crate::artifact::ARTIFACTS_MOUNT_PATH,
                VolumeKind::ArtifactStore,
            ));
        }

        Self {
            handle,
            pod_name,
            metadata,
            spec,
            config,
            worker,
            pods,
            executor,
            db,
            metrics,
            properties: Arc::new(Properties::default()),
            volumes,
            input_volumes,
            cache_volumes,
        }
    }

    pub fn handle(&self) -> Uuid {
        self.handle
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn db_container(&self) -> Arc<dyn CreatedContainer> {
        Arc::clone(&self.db)
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    pub fn spec(&self) -> &StepSpec {
        &self.spec
    }

    pub fn volumes(&self) -> &[Arc<Volume>] {
        &self.volumes
    }

    /// Current properties, seeded from pod annotations on first access.
    /// In-memory values take precedence over anything loaded.
    pub async fn properties(&self) -> HashMap<String, String> {
        if !self.properties.is_loaded() {
            match tokio::time::timeout(PROPERTY_IO_TIMEOUT, self.pods.get(&self.pod_name)).await {
                Ok(Ok(pod)) => {
                    if let Some(annotations) = &pod.metadata.annotations {
                        self.properties.merge_missing(annotations);
                    }
                    self.properties.mark_loaded();
                }
                Ok(Err(err)) => {
                    tracing::debug!(pod = %self.pod_name, error = %err,
                        "property load skipped");
                }
                Err(_) => {
                    tracing::debug!(pod = %self.pod_name, "property load timed out");
                }
            }
        }
        self.properties.snapshot()
    }

    /// Set a property; the persisted subset is mirrored into pod annotations.
    pub async fn set_property(&self, key: &str, value: &str) {
        self.properties.set(key, value);
        if PERSISTED_PROPERTIES.contains(&key) {
            persist_annotation(self.pods.as_ref(), &self.pod_name, key, value).await;
        }
    }

    /// Start (or resume, in exec mode) an execution of the step command.
    #[tracing::instrument(skip(self, spec, io), fields(pod = %self.pod_name, handle = %self.handle))]
    pub async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Arc<dyn Process>, ContainerError> {
        match &self.executor {
            Some(executor) => self.run_exec(Arc::clone(executor), spec, io).await,
            None => self.run_direct(spec, io).await,
        }
    }

    async fn run_exec(
        &self,
        executor: Arc<dyn Executor>,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Arc<dyn Process>, ContainerError> {
        // Reuse a live pause pod; create one only when missing.
        match self.pods.get(&self.pod_name).await {
            Ok(_) => {}
            Err(err) if pods::is_not_found(&err) => {
                let pod = self.render_pod(Entrypoint::Pause, &[], None)?;
                self.create_pod(&pod).await?;
            }
            Err(err) => return Err(retryable::classify(err).into()),
        }

        self.bind_volumes();

        let artifacts_enabled = podspec::artifacts_enabled(&self.config, self.spec.kind);
        let inputs = if artifacts_enabled {
            Vec::new()
        } else {
            self.spec
                .inputs
                .iter()
                .zip(&self.input_volumes)
                .filter_map(|(input, volume)| {
                    let source = input.source.clone()?;
                    Some((Arc::clone(volume), source))
                })
                .collect()
        };
        let outputs = self
            .volumes
            .iter()
            .filter(|v| {
                v.kind() == VolumeKind::DeferredEmptyDir
                    && !v.mount_path().is_empty()
                    && !self.cache_volumes.iter().any(|cache| Arc::ptr_eq(cache, v))
            })
            .cloned()
            .collect();

        Ok(Arc::new(ExecProcess::new(ExecProcessParams {
            pods: Arc::clone(&self.pods),
            executor,
            metrics: Arc::clone(&self.metrics),
            properties: Arc::clone(&self.properties),
            pod_name: self.pod_name.clone(),
            spec,
            io,
            inputs,
            outputs,
            startup_timeout: self.config.pod_startup_timeout,
            artifacts_enabled,
        })))
    }

    async fn run_direct(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Arc<dyn Process>, ContainerError> {
        let pod = self.render_pod(
            Entrypoint::Direct {
                path: &spec.path,
                args: &spec.args,
            },
            &spec.env,
            (!spec.dir.is_empty()).then_some(spec.dir.as_str()),
        )?;
        self.create_pod(&pod).await?;
        self.bind_volumes();

        Ok(Arc::new(DirectProcess::start(
            Arc::clone(&self.pods),
            Arc::clone(&self.metrics),
            self.pod_name.clone(),
            spec.id,
            io,
        )))
    }

    /// Reconnect to a previous execution.
    #[tracing::instrument(skip(self, io), fields(pod = %self.pod_name, %process_id))]
    pub async fn attach(
        &self,
        process_id: &str,
        io: ProcessIo,
    ) -> Result<Arc<dyn Process>, ContainerError> {
        // 1. A cached exit status needs no API traffic at all.
        if let Some(value) = self.properties.get(PROPERTY_EXIT_STATUS) {
            let code = parse_exit_status(&value)?;
            return Ok(Arc::new(ExitedProcess::new(process_id, code)));
        }

        // 2. No pod, no process: the engine falls through to run.
        let pod = match self.pods.get(&self.pod_name).await {
            Ok(pod) => pod,
            Err(err) if pods::is_not_found(&err) => {
                return Err(ContainerError::PodMissing(self.pod_name.clone()));
            }
            Err(err) => return Err(retryable::classify(err).into()),
        };

        if self.executor.is_some() {
            // 3. Exec mode: the annotation is the crash-safe record.
            let annotation = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(PROPERTY_EXIT_STATUS));
            match annotation {
                Some(value) => {
                    let code = parse_exit_status(value)?;
                    self.properties.set(PROPERTY_EXIT_STATUS, value);
                    Ok(Arc::new(ExitedProcess::new(process_id, code)))
                }
                None => Err(ContainerError::NotYetExited),
            }
        } else {
            // 4. Direct mode: resume following the existing pod.
            self.bind_volumes();
            Ok(Arc::new(DirectProcess::start(
                Arc::clone(&self.pods),
                Arc::clone(&self.metrics),
                self.pod_name.clone(),
                process_id,
                io,
            )))
        }
    }

    fn render_pod(
        &self,
        entrypoint: Entrypoint<'_>,
        extra_env: &[(String, String)],
        working_dir: Option<&str>,
    ) -> Result<k8s_openapi::api::core::v1::Pod, ContainerError> {
        Ok(podspec::build_pod(&PodParams {
            config: &self.config,
            metadata: &self.metadata,
            spec: &self.spec,
            handle: &self.handle.to_string(),
            pod_name: &self.pod_name,
            worker: &self.worker,
            entrypoint,
            extra_env,
            working_dir,
        })?)
    }

    async fn create_pod(
        &self,
        pod: &k8s_openapi::api::core::v1::Pod,
    ) -> Result<(), ContainerError> {
        match self.pods.create(pod).await {
            Ok(_) => {
                self.metrics.container_created(self.metadata.kind.as_str());
                tracing::info!(pod = %self.pod_name, kind = %self.metadata.kind, "pod created");
                Ok(())
            }
            Err(err) => {
                self.metrics.container_create_failed();
                Err(retryable::classify(err).into())
            }
        }
    }

    fn bind_volumes(&self) {
        for volume in &self.volumes {
            volume.bind_pod(&self.pod_name);
        }
    }
}

fn parse_exit_status(value: &str) -> Result<i32, ContainerError> {
    value
        .parse()
        .map_err(|_| ContainerError::BadExitStatus(value.to_owned()))
}
