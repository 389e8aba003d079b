//! Direct-mode execution: the command is baked into the pod spec, output is
//! recovered by following the main container's logs, and the exit code comes
//! from the pod status.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::names::MAIN_CONTAINER_NAME;
use crate::pods::PodApi;
use crate::watch::PodWatcher;

use super::error::ProcessError;
use super::status::{self, PodProgress};
use super::{Process, ProcessIo, StderrSink, TtyFlag};

/// Bound on pod deletion when the wait is cancelled.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive transient watch errors tolerated before surfacing.
const MAX_TRANSIENT_ERRORS: u32 = 3;

/// Delay between log-follow attempts while the container spins up.
const LOG_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct DirectProcess {
    id: String,
    pod_name: String,
    tty: TtyFlag,
    inner: tokio::sync::Mutex<Option<Inner>>,
}

struct Inner {
    pods: Arc<dyn PodApi>,
    metrics: Arc<dyn Metrics>,
    stderr: StderrSink,
    log_stop: CancellationToken,
}

impl DirectProcess {
    /// Begin following logs immediately; the status wait happens in `wait`.
    pub fn start(
        pods: Arc<dyn PodApi>,
        metrics: Arc<dyn Metrics>,
        pod_name: impl Into<String>,
        id: impl Into<String>,
        io: ProcessIo,
    ) -> Self {
        let pod_name = pod_name.into();
        let stderr = StderrSink::new(io.stderr);
        let log_stop = CancellationToken::new();

        tokio::spawn(follow_logs(
            Arc::clone(&pods),
            pod_name.clone(),
            io.stdout,
            stderr.clone(),
            log_stop.clone(),
        ));

        Self {
            id: id.into(),
            pod_name,
            tty: TtyFlag::new(io.tty),
            inner: tokio::sync::Mutex::new(Some(Inner {
                pods,
                metrics,
                stderr,
                log_stop,
            })),
        }
    }
}

#[async_trait::async_trait]
impl Process for DirectProcess {
    fn id(&self) -> &str {
        &self.id
    }

    #[tracing::instrument(skip(self, cancel), fields(pod = %self.pod_name, id = %self.id))]
    async fn wait(&self, cancel: &CancellationToken) -> Result<i32, ProcessError> {
        let inner = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(ProcessError::AlreadyWaited)?;

        let result = tokio::select! {
            () = cancel.cancelled() => {
                // best-effort bounded cleanup, then surface the cancellation
                let _ = tokio::time::timeout(
                    CLEANUP_TIMEOUT,
                    inner.pods.delete(&self.pod_name),
                )
                .await;
                Err(ProcessError::Cancelled)
            }
            result = poll_until_done(&inner, &self.pod_name) => result,
        };

        inner.log_stop.cancel();
        result
    }

    fn set_tty(&self, tty: bool) {
        // direct mode has no interactive channel; recorded for parity
        self.tty.set(tty);
    }
}

/// Watch the pod until it settles. Phase transitions arrive in resource
/// version order, so within one pod this only ever moves forward.
async fn poll_until_done(inner: &Inner, pod_name: &str) -> Result<i32, ProcessError> {
    let mut watcher = PodWatcher::new(Arc::clone(&inner.pods), pod_name);
    let token = CancellationToken::new();
    let mut transient_errors: u32 = 0;

    loop {
        let pod = match watcher.next(&token).await {
            Ok(pod) => {
                transient_errors = 0;
                pod
            }
            Err(err) if err.is_retryable() => {
                transient_errors += 1;
                if transient_errors >= MAX_TRANSIENT_ERRORS {
                    return Err(ProcessError::from_watch(err, pod_name));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            Err(err) => return Err(ProcessError::from_watch(err, pod_name)),
        };

        match status::assess(&pod) {
            PodProgress::Waiting | PodProgress::Running => {}
            PodProgress::TerminalWait(reason) => {
                if status::is_image_pull_reason(&reason) {
                    inner.metrics.image_pull_failure();
                }
                inner.stderr.write(&status::format_pod_diagnostics(&pod)).await;
                return Err(ProcessError::TerminalWait {
                    pod: pod_name.to_owned(),
                    reason,
                });
            }
            PodProgress::Evicted => {
                inner.stderr.write(&status::format_pod_diagnostics(&pod)).await;
                return Err(ProcessError::Evicted {
                    pod: pod_name.to_owned(),
                });
            }
            PodProgress::Unschedulable => {
                inner.stderr.write(&status::format_pod_diagnostics(&pod)).await;
                return Err(ProcessError::Unschedulable {
                    pod: pod_name.to_owned(),
                });
            }
            PodProgress::Exited(code) => return Ok(code),
        }
    }
}

/// Copy the main container's logs into the process stdout, retrying until the
/// container is ready. Copy failures are annotated on stderr but never fail
/// the step.
async fn follow_logs(
    pods: Arc<dyn PodApi>,
    pod_name: String,
    stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    stderr: StderrSink,
    stop: CancellationToken,
) {
    let Some(mut stdout) = stdout else { return };

    loop {
        let reader = tokio::select! {
            () = stop.cancelled() => return,
            reader = pods.follow_logs(&pod_name, MAIN_CONTAINER_NAME) => reader,
        };

        match reader {
            Ok(mut reader) => {
                let copied = tokio::select! {
                    () = stop.cancelled() => return,
                    copied = tokio::io::copy(&mut reader, &mut stdout) => copied,
                };
                if let Err(err) = copied {
                    stderr.write(&format!("log streaming ended: {err}\n")).await;
                }
                return;
            }
            Err(err) => {
                tracing::debug!(pod = %pod_name, error = %err, "log follow not ready, retrying");
                tokio::select! {
                    () = stop.cancelled() => return,
                    () = tokio::time::sleep(LOG_RETRY_DELAY) => {}
                }
            }
        }
    }
}
