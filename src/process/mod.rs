//! Drive a single execution of a step command to its exit code.
//!
//! Two shapes share one contract: a direct process follows the pod's logs and
//! waits for the phase to settle, while an exec process delivers the command
//! into a long-lived pause pod over the exec channel.

mod direct;
mod error;
mod exec;
mod status;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub use direct::DirectProcess;
pub use error::ProcessError;
pub use exec::{ExecProcess, ExecProcessParams};

/// What the engine asks a container to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub id: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: String,
}

/// Stdio plumbing handed over by the engine or a hijack client.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub tty: bool,
}

/// One execution of a step command. Terminal once `wait` returns.
#[async_trait]
pub trait Process: Send + Sync {
    fn id(&self) -> &str;

    /// Block until the command finishes and yield its exit code.
    async fn wait(&self, cancel: &CancellationToken) -> Result<i32, ProcessError>;

    /// Request a TTY for the remote command. Only meaningful before `wait`
    /// on an exec process.
    fn set_tty(&self, tty: bool);
}

// ---------------------------------------------------------------------------
// Already-exited process
// ---------------------------------------------------------------------------

/// A process recovered from a persisted exit status; `wait` returns
/// immediately.
pub struct ExitedProcess {
    id: String,
    exit_code: i32,
}

impl ExitedProcess {
    pub fn new(id: impl Into<String>, exit_code: i32) -> Self {
        Self {
            id: id.into(),
            exit_code,
        }
    }
}

#[async_trait]
impl Process for ExitedProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self, _cancel: &CancellationToken) -> Result<i32, ProcessError> {
        Ok(self.exit_code)
    }

    fn set_tty(&self, _tty: bool) {}
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// TTY flag shared between `set_tty` and the wait loop.
pub(crate) struct TtyFlag(AtomicBool);

impl TtyFlag {
    pub(crate) fn new(tty: bool) -> Self {
        Self(AtomicBool::new(tty))
    }

    pub(crate) fn set(&self, tty: bool) {
        self.0.store(tty, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Best-effort write of diagnostics or annotations to the step's stderr.
pub(crate) async fn write_stderr(
    stderr: &mut Option<Box<dyn AsyncWrite + Send + Unpin>>,
    text: &str,
) {
    if let Some(writer) = stderr {
        let _ = writer.write_all(text.as_bytes()).await;
        let _ = writer.flush().await;
    }
}

/// Shared stderr handle for the direct process, where the log follower and
/// the wait loop both annotate it.
#[derive(Clone)]
pub(crate) struct StderrSink {
    inner: Arc<tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>,
}

impl StderrSink {
    pub(crate) fn new(writer: Option<Box<dyn AsyncWrite + Send + Unpin>>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(writer)),
        }
    }

    pub(crate) async fn write(&self, text: &str) {
        let mut guard = self.inner.lock().await;
        write_stderr(&mut guard, text).await;
    }
}
