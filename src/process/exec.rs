//! Exec-mode execution: the pod runs a pause command and the step's real
//! command is delivered over the exec channel. The pod is never deleted here,
//! success or failure, so a debug session can still attach to it; the GC
//! reclaims it once its owning record disappears.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;

use crate::artifact;
use crate::container::{self, Properties};
use crate::exec::{ExecIo, Executor};
use crate::metrics::Metrics;
use crate::names::{ARTIFACT_HELPER_NAME, MAIN_CONTAINER_NAME};
use crate::pods::PodApi;
use crate::step::ArtifactSource;
use crate::volume::Volume;
use crate::watch::PodWatcher;

use super::error::ProcessError;
use super::status::{self, PodProgress};
use super::{Process, ProcessIo, ProcessSpec, TtyFlag, write_stderr};

pub struct ExecProcessParams {
    pub pods: Arc<dyn PodApi>,
    pub executor: Arc<dyn Executor>,
    pub metrics: Arc<dyn Metrics>,
    pub properties: Arc<Properties>,
    pub pod_name: String,
    pub spec: ProcessSpec,
    pub io: ProcessIo,
    /// Inputs to stream over the channel; empty when init containers already
    /// extracted them from the artifact PVC.
    pub inputs: Vec<(Arc<Volume>, Arc<dyn ArtifactSource>)>,
    /// Volumes to upload through the helper after the command exits.
    pub outputs: Vec<Arc<Volume>>,
    pub startup_timeout: Duration,
    pub artifacts_enabled: bool,
}

pub struct ExecProcess {
    id: String,
    pod_name: String,
    tty: TtyFlag,
    inner: tokio::sync::Mutex<Option<ExecProcessParams>>,
}

impl ExecProcess {
    pub fn new(params: ExecProcessParams) -> Self {
        Self {
            id: params.spec.id.clone(),
            pod_name: params.pod_name.clone(),
            tty: TtyFlag::new(params.io.tty),
            inner: tokio::sync::Mutex::new(Some(params)),
        }
    }
}

#[async_trait::async_trait]
impl Process for ExecProcess {
    fn id(&self) -> &str {
        &self.id
    }

    #[tracing::instrument(skip(self, cancel), fields(pod = %self.pod_name, id = %self.id))]
    async fn wait(&self, cancel: &CancellationToken) -> Result<i32, ProcessError> {
        let params = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(ProcessError::AlreadyWaited)?;

        // Cancelling drops the in-flight exec, which closes the remote
        // channel; the pause pod itself is left alone.
        tokio::select! {
            () = cancel.cancelled() => Err(ProcessError::Cancelled),
            result = run(params, self.tty.get()) => result,
        }
    }

    fn set_tty(&self, tty: bool) {
        self.tty.set(tty);
    }
}

async fn run(params: ExecProcessParams, tty: bool) -> Result<i32, ProcessError> {
    let ExecProcessParams {
        pods,
        executor,
        metrics,
        properties,
        pod_name,
        spec,
        io,
        inputs,
        outputs,
        startup_timeout,
        artifacts_enabled,
    } = params;
    let ProcessIo {
        stdin,
        stdout,
        mut stderr,
        tty: io_tty,
    } = io;

    // 1. The pause pod must be running before the channel can open. A stuck
    //    pod is left in place for debugging.
    let started = Instant::now();
    match wait_for_running(&pods, &pod_name, startup_timeout).await {
        Ok(()) => metrics.pod_startup(started.elapsed()),
        Err(WaitFailure::Timeout(last)) => {
            if let Some(pod) = &last {
                write_stderr(&mut stderr, &status::format_pod_diagnostics(pod)).await;
            }
            return Err(ProcessError::StartupTimeout { pod: pod_name });
        }
        Err(WaitFailure::Fatal { pod, error }) => {
            if let Some(pod) = &pod {
                if let ProcessError::TerminalWait { reason, .. } = &error {
                    if status::is_image_pull_reason(reason) {
                        metrics.image_pull_failure();
                    }
                }
                write_stderr(&mut stderr, &status::format_pod_diagnostics(pod)).await;
            }
            return Err(error);
        }
    }

    // 2. Stream inputs. With an artifact PVC the init containers already did
    //    this and the list is empty; a failure here must stop the command
    //    from ever running.
    if !artifacts_enabled {
        for (volume, source) in inputs {
            let reader = source
                .open()
                .await
                .map_err(|source| ProcessError::InputStream {
                    destination: volume.mount_path().to_owned(),
                    source,
                })?;
            volume
                .stream_in("", reader)
                .await
                .map_err(|err| ProcessError::InputStream {
                    destination: volume.mount_path().to_owned(),
                    source: err.into(),
                })?;
        }
    }

    // 3. Run the command. A non-zero exit travels back as a typed error and
    //    counts as normal completion.
    let command = build_argv(&spec);
    let exec_io = ExecIo {
        stdin,
        stdout,
        stderr,
        tty: tty || io_tty,
    };
    let exit_code = match executor
        .exec(&pod_name, MAIN_CONTAINER_NAME, &command, exec_io)
        .await
    {
        Ok(()) => 0,
        Err(err) => match err.exit_code() {
            Some(code) => code,
            None => return Err(ProcessError::Exec(err)),
        },
    };

    // 4. Upload outputs through the helper. Failures are fatal: a downstream
    //    step must not run against missing inputs.
    if artifacts_enabled {
        for volume in &outputs {
            let command = artifact::upload_command(volume.handle(), volume.mount_path());
            executor
                .exec(&pod_name, ARTIFACT_HELPER_NAME, &command, ExecIo::default())
                .await
                .map_err(|source| ProcessError::Upload {
                    handle: volume.handle().to_owned(),
                    source,
                })?;
        }
    }

    // 5. Persist the exit status so a restarted orchestrator can recover it
    //    through attach without re-running anything.
    properties.set(container::PROPERTY_EXIT_STATUS, &exit_code.to_string());
    container::persist_annotation(
        pods.as_ref(),
        &pod_name,
        container::PROPERTY_EXIT_STATUS,
        &exit_code.to_string(),
    )
    .await;

    Ok(exit_code)
}

// ---------------------------------------------------------------------------
// Wait for Running
// ---------------------------------------------------------------------------

enum WaitFailure {
    /// Startup deadline elapsed; carries the last observation for diagnostics.
    Timeout(Option<Pod>),
    Fatal {
        pod: Option<Pod>,
        error: ProcessError,
    },
}

async fn wait_for_running(
    pods: &Arc<dyn PodApi>,
    pod_name: &str,
    timeout: Duration,
) -> Result<(), WaitFailure> {
    let mut watcher = PodWatcher::new(Arc::clone(pods), pod_name);
    let token = CancellationToken::new();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last: Option<Pod> = None;

    loop {
        let next = tokio::select! {
            () = tokio::time::sleep_until(deadline) => return Err(WaitFailure::Timeout(last)),
            next = watcher.next(&token) => next,
        };

        let pod = match next {
            Ok(pod) => pod,
            Err(err) => {
                return Err(WaitFailure::Fatal {
                    pod: last,
                    error: ProcessError::from_watch(err, pod_name),
                });
            }
        };

        match status::assess(&pod) {
            PodProgress::Running => return Ok(()),
            PodProgress::Waiting => last = Some(pod),
            PodProgress::TerminalWait(reason) => {
                let error = ProcessError::TerminalWait {
                    pod: pod_name.to_owned(),
                    reason,
                };
                return Err(WaitFailure::Fatal {
                    pod: Some(pod),
                    error,
                });
            }
            PodProgress::Evicted => {
                return Err(WaitFailure::Fatal {
                    error: ProcessError::Evicted {
                        pod: pod_name.to_owned(),
                    },
                    pod: Some(pod),
                });
            }
            PodProgress::Unschedulable => {
                return Err(WaitFailure::Fatal {
                    error: ProcessError::Unschedulable {
                        pod: pod_name.to_owned(),
                    },
                    pod: Some(pod),
                });
            }
            // A pause pod that completed can never host the command.
            PodProgress::Exited(_) => {
                return Err(WaitFailure::Fatal {
                    error: ProcessError::TerminalWait {
                        pod: pod_name.to_owned(),
                        reason: "PodCompleted".to_owned(),
                    },
                    pod: Some(pod),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command assembly
// ---------------------------------------------------------------------------

/// Render the process spec as an exec argv. Plain commands pass through;
/// an environment or working directory wraps the command in a shell.
fn build_argv(spec: &ProcessSpec) -> Vec<String> {
    if spec.env.is_empty() && spec.dir.is_empty() {
        let mut argv = Vec::with_capacity(1 + spec.args.len());
        argv.push(spec.path.clone());
        argv.extend(spec.args.iter().cloned());
        return argv;
    }

    let mut script = String::new();
    if !spec.dir.is_empty() {
        script.push_str("cd ");
        script.push_str(&shell_quote(&spec.dir));
        script.push_str(" && ");
    }
    script.push_str("exec");
    if !spec.env.is_empty() {
        script.push_str(" env");
        for (name, value) in &spec.env {
            script.push(' ');
            script.push_str(&shell_quote(&format!("{name}={value}")));
        }
    }
    script.push(' ');
    script.push_str(&shell_quote(&spec.path));
    for arg in &spec.args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }

    vec!["sh".to_owned(), "-c".to_owned(), script]
}

/// POSIX single-quote escaping.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | ','))
    {
        return s.to_owned();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
