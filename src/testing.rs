//! In-memory fakes for exercising the lifecycle machinery without a cluster.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Pod,
    PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ErrorResponse, WatchEvent};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::db::CreatedContainer;
use crate::exec::{ExecError, ExecIo, Executor};
use crate::metrics::Metrics;
use crate::names::MAIN_CONTAINER_NAME;
use crate::pods::{PodApi, WatchStream};
use crate::step::ArtifactSource;

// ---------------------------------------------------------------------------
// FakePods
// ---------------------------------------------------------------------------

enum WatchScript {
    Events(Vec<Result<WatchEvent<Pod>, kube::Error>>),
    Hanging,
}

#[derive(Default)]
pub(crate) struct FakePods {
    pods: Mutex<HashMap<String, Pod>>,
    created: Mutex<Vec<Pod>>,
    deleted: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, Vec<u8>>>,
    watch_scripts: Mutex<VecDeque<WatchScript>>,
    watch_requests: Mutex<Vec<String>>,
    list_selectors: Mutex<Vec<String>>,
    subscribe_failures: AtomicU32,
    create_failure_code: AtomicU32,
    get_calls: AtomicUsize,
}

impl FakePods {
    pub(crate) fn put_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.lock().unwrap().insert(name, pod);
    }

    pub(crate) fn get_pod(&self, name: &str) -> Option<Pod> {
        self.pods.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn push_watch_script(
        &self,
        events: Vec<Result<WatchEvent<Pod>, kube::Error>>,
    ) {
        self.watch_scripts
            .lock()
            .unwrap()
            .push_back(WatchScript::Events(events));
    }

    /// The next subscription yields a stream that never produces an event.
    pub(crate) fn push_hanging_watch(&self) {
        self.watch_scripts
            .lock()
            .unwrap()
            .push_back(WatchScript::Hanging);
    }

    /// Fail the next `n` watch subscriptions with a 503.
    pub(crate) fn fail_subscribes(&self, n: u32) {
        self.subscribe_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every create with the given API status code.
    pub(crate) fn fail_creates_with(&self, code: u16) {
        self.create_failure_code
            .store(u32::from(code), Ordering::SeqCst);
    }

    pub(crate) fn watch_requests(&self) -> Vec<String> {
        self.watch_requests.lock().unwrap().clone()
    }

    pub(crate) fn list_selectors(&self) -> Vec<String> {
        self.list_selectors.lock().unwrap().clone()
    }

    pub(crate) fn created(&self) -> Vec<Pod> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn set_logs(&self, name: &str, bytes: &[u8]) {
        self.logs
            .lock()
            .unwrap()
            .insert(name.to_owned(), bytes.to_vec());
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_counters(&self) {
        self.get_calls.store(0, Ordering::SeqCst);
    }
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("{reason} ({code})"),
        reason: reason.into(),
        code,
    })
}

#[async_trait]
impl PodApi for FakePods {
    async fn get(&self, name: &str) -> Result<Pod, kube::Error> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.get_pod(name)
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn create(&self, pod: &Pod) -> Result<Pod, kube::Error> {
        let code = self.create_failure_code.load(Ordering::SeqCst);
        if code != 0 {
            return Err(api_error(u16::try_from(code).unwrap_or(500), "Failure"));
        }
        self.created.lock().unwrap().push(pod.clone());
        self.put_pod(pod.clone());
        Ok(pod.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        self.pods.lock().unwrap().remove(name);
        self.deleted.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        self.list_selectors
            .lock()
            .unwrap()
            .push(label_selector.to_owned());
        let (key, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        let pods = self.pods.lock().unwrap();
        Ok(pods
            .values()
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.get(key).map(String::as_str) == Some(value))
            })
            .cloned()
            .collect())
    }

    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), kube::Error> {
        let mut pods = self.pods.lock().unwrap();
        let pod = pods.get_mut(name).ok_or_else(|| api_error(404, "NotFound"))?;
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
        Ok(())
    }

    async fn follow_logs(
        &self,
        name: &str,
        _container: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, kube::Error> {
        let bytes = self
            .logs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn watch(
        &self,
        _name: &str,
        resource_version: &str,
    ) -> Result<WatchStream, kube::Error> {
        self.watch_requests
            .lock()
            .unwrap()
            .push(resource_version.to_owned());

        let failures = self.subscribe_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.subscribe_failures.store(failures - 1, Ordering::SeqCst);
            return Err(api_error(503, "ServiceUnavailable"));
        }

        let script = self.watch_scripts.lock().unwrap().pop_front();
        match script {
            Some(WatchScript::Events(events)) => Ok(futures_util::stream::iter(events).boxed()),
            // no script queued: hang rather than spin on empty streams
            Some(WatchScript::Hanging) | None => Ok(futures_util::stream::pending().boxed()),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct ExecCall {
    pub(crate) pod: String,
    pub(crate) container: String,
    pub(crate) command: Vec<String>,
    pub(crate) stdin: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct FakeExecutor {
    calls: Mutex<Vec<ExecCall>>,
    results: Mutex<VecDeque<Result<(), ExecError>>>,
    stdout: Mutex<Vec<u8>>,
}

impl FakeExecutor {
    pub(crate) fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Queue the result for the next exec; defaults to success.
    pub(crate) fn push_result(&self, result: Result<(), ExecError>) {
        self.results.lock().unwrap().push_back(result);
    }

    /// Bytes written to every exec's stdout.
    pub(crate) fn set_stdout(&self, bytes: Vec<u8>) {
        *self.stdout.lock().unwrap() = bytes;
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
        io: ExecIo,
    ) -> Result<(), ExecError> {
        let mut stdin = Vec::new();
        if let Some(mut reader) = io.stdin {
            let _ = reader.read_to_end(&mut stdin).await;
        }
        if let Some(mut writer) = io.stdout {
            let bytes = self.stdout.lock().unwrap().clone();
            let _ = writer.write_all(&bytes).await;
            let _ = writer.shutdown().await;
        }

        self.calls.lock().unwrap().push(ExecCall {
            pod: pod.to_owned(),
            container: container.to_owned(),
            command: command.to_vec(),
            stdin,
        });

        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Metrics & artifacts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct CountingMetrics {
    containers_created: AtomicUsize,
    container_create_failures: AtomicUsize,
    pod_startups: AtomicUsize,
    image_pull_failures: AtomicUsize,
}

impl CountingMetrics {
    pub(crate) fn containers_created(&self) -> usize {
        self.containers_created.load(Ordering::SeqCst)
    }

    pub(crate) fn container_create_failures(&self) -> usize {
        self.container_create_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn pod_startups(&self) -> usize {
        self.pod_startups.load(Ordering::SeqCst)
    }

    pub(crate) fn image_pull_failures(&self) -> usize {
        self.image_pull_failures.load(Ordering::SeqCst)
    }
}

impl Metrics for CountingMetrics {
    fn container_created(&self, _kind: &str) {
        self.containers_created.fetch_add(1, Ordering::SeqCst);
    }

    fn container_create_failed(&self) {
        self.container_create_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn pod_startup(&self, _elapsed: std::time::Duration) {
        self.pod_startups.fetch_add(1, Ordering::SeqCst);
    }

    fn image_pull_failure(&self) {
        self.image_pull_failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixed-content artifact source.
pub(crate) struct StaticArtifact {
    handle: String,
    bytes: Vec<u8>,
}

impl StaticArtifact {
    pub(crate) fn new(handle: &str, bytes: &[u8]) -> Self {
        Self {
            handle: handle.to_owned(),
            bytes: bytes.to_vec(),
        }
    }
}

#[async_trait]
impl ArtifactSource for StaticArtifact {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn open(&self) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(Box::new(std::io::Cursor::new(self.bytes.clone())))
    }
}

#[derive(Default)]
pub(crate) struct FakeDbContainer {
    handle: Uuid,
}

impl CreatedContainer for FakeDbContainer {
    fn handle(&self) -> Uuid {
        self.handle
    }
}

// ---------------------------------------------------------------------------
// SharedBuf
// ---------------------------------------------------------------------------

/// Cloneable in-memory writer for capturing a process's stdout/stderr.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub(crate) fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Pod constructors
// ---------------------------------------------------------------------------

pub(crate) fn pod_with_phase(name: &str, phase: &str) -> Pod {
    Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("jetbridge".to_owned()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn pod_with_labels(name: &str, labels: &[(&str, &str)]) -> Pod {
    let mut pod = pod_with_phase(name, "Running");
    pod.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
    );
    pod
}

pub(crate) fn set_resource_version(pod: &mut Pod, version: &str) {
    pod.metadata.resource_version = Some(version.to_owned());
}

pub(crate) fn set_creation_timestamp(mut pod: Pod, at: DateTime<Utc>) -> Pod {
    let nanos = at.timestamp_nanos_opt().unwrap_or_default();
    let ts = k8s_openapi::jiff::Timestamp::from_nanosecond(i128::from(nanos))
        .expect("timestamp in range");
    pod.metadata.creation_timestamp = Some(Time(ts));
    pod
}

pub(crate) fn with_annotation(mut pod: Pod, key: &str, value: &str) -> Pod {
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_owned(), value.to_owned());
    pod
}

fn main_container_status(state: ContainerState) -> ContainerStatus {
    ContainerStatus {
        name: MAIN_CONTAINER_NAME.to_owned(),
        state: Some(state),
        ..Default::default()
    }
}

pub(crate) fn with_waiting_reason(mut pod: Pod, reason: &str) -> Pod {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status
        .container_statuses
        .get_or_insert_with(Vec::new)
        .push(main_container_status(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_owned()),
                message: Some(format!("simulated {reason}")),
            }),
            ..Default::default()
        }));
    pod
}

pub(crate) fn with_terminated(mut pod: Pod, exit_code: i32) -> Pod {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status
        .container_statuses
        .get_or_insert_with(Vec::new)
        .push(main_container_status(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code,
                ..Default::default()
            }),
            ..Default::default()
        }));
    pod
}

pub(crate) fn with_status_reason(mut pod: Pod, reason: &str) -> Pod {
    pod.status.get_or_insert_with(PodStatus::default).reason = Some(reason.to_owned());
    pod
}

pub(crate) fn with_condition(mut pod: Pod, type_: &str, status: &str, reason: &str) -> Pod {
    pod.status
        .get_or_insert_with(PodStatus::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(PodCondition {
            type_: type_.to_owned(),
            status: status.to_owned(),
            reason: Some(reason.to_owned()),
            ..Default::default()
        });
    pod
}
