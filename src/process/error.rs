use crate::exec::ExecError;
use crate::retryable::PodApiError;
use crate::watch::WatchError;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The main container hit a terminal waiting state such as
    /// ImagePullBackOff; the step can never make progress.
    #[error("pod {pod} failed: {reason}")]
    TerminalWait { pod: String, reason: String },

    #[error("pod {pod} was evicted")]
    Evicted { pod: String },

    #[error("pod {pod} is unschedulable")]
    Unschedulable { pod: String },

    #[error("timed out waiting for pod {pod} to start")]
    StartupTimeout { pod: String },

    #[error("input streaming to {destination} failed: {source}")]
    InputStream {
        destination: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("output upload for volume {handle} failed: {source}")]
    Upload {
        handle: String,
        #[source]
        source: ExecError,
    },

    #[error("exec channel failed: {0}")]
    Exec(#[source] ExecError),

    #[error("wait cancelled")]
    Cancelled,

    #[error("process already waited on")]
    AlreadyWaited,

    #[error(transparent)]
    Api(#[from] PodApiError),
}

impl ProcessError {
    /// Whether the engine should re-run the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_retryable())
    }

    pub(crate) fn from_watch(err: WatchError, _pod: &str) -> Self {
        match err {
            WatchError::Stopped | WatchError::Cancelled => Self::Cancelled,
            WatchError::Api(api) => Self::Api(api),
        }
    }
}
