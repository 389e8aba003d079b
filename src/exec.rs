//! Remote command execution inside a running pod.
//!
//! The channel multiplexes stdin/stdout/stderr over the pod's exec
//! subresource and surfaces the remote exit code as a typed error, so callers
//! can preserve it as the step's result.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Api;
use kube::api::AttachParams;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The remote command ran to completion with a non-zero status.
    #[error("command exited with status {0}")]
    ExitStatus(i32),

    #[error("exec channel failed: {0}")]
    Channel(#[from] kube::Error),

    #[error("exec channel failed: {0}")]
    Remote(String),

    #[error("exec channel closed without reporting a status")]
    MissingStatus,

    #[error("stream copy failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// The remote exit code, when the command itself completed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExitStatus(code) => Some(*code),
            _ => None,
        }
    }
}

/// IO plumbing for one remote command. `stdin` may be absent; with a TTY the
/// server folds stderr into stdout.
#[derive(Default)]
pub struct ExecIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub tty: bool,
}

/// Remote execution against a named container inside a pod.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
        io: ExecIo,
    ) -> Result<(), ExecError>;
}

// ---------------------------------------------------------------------------
// kube-backed implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct KubeExecutor {
    api: Api<Pod>,
}

impl KubeExecutor {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl Executor for KubeExecutor {
    #[tracing::instrument(skip(self, command, io), fields(%pod, %container))]
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
        io: ExecIo,
    ) -> Result<(), ExecError> {
        let params = AttachParams {
            container: Some(container.to_owned()),
            stdin: io.stdin.is_some(),
            stdout: io.stdout.is_some(),
            stderr: io.stderr.is_some() && !io.tty,
            tty: io.tty,
            ..Default::default()
        };

        let mut attached = self.api.exec(pod, command.to_vec(), &params).await?;

        let stdin_writer = attached.stdin();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let status = attached.take_status();

        let stdin_copy = async {
            if let (Some(mut reader), Some(mut writer)) = (io.stdin, stdin_writer) {
                tokio::io::copy(&mut reader, &mut writer).await?;
                // close the remote stdin so the command sees EOF
                writer.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let stdout_copy = async {
            if let (Some(mut reader), Some(mut writer)) = (stdout_reader, io.stdout) {
                tokio::io::copy(&mut reader, &mut writer).await?;
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let stderr_copy = async {
            if let (Some(mut reader), Some(mut writer)) = (stderr_reader, io.stderr) {
                tokio::io::copy(&mut reader, &mut writer).await?;
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let (r_in, r_out, r_err) = tokio::join!(stdin_copy, stdout_copy, stderr_copy);
        r_in?;
        r_out?;
        r_err?;

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        let _ = attached.join().await;

        match status {
            Some(status) => check_status(&status),
            None => Err(ExecError::MissingStatus),
        }
    }
}

/// Map the server's final `Status` to a result, preserving exit codes.
fn check_status(status: &Status) -> Result<(), ExecError> {
    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }

    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .into_iter()
            .flatten()
            .find(|c| c.reason.as_deref() == Some("ExitCode"))
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.parse().ok());
        if let Some(code) = code {
            return Err(ExecError::ExitStatus(code));
        }
    }

    Err(ExecError::Remote(
        status
            .message
            .clone()
            .unwrap_or_else(|| "unknown failure".to_owned()),
    ))
}
