//! Partition Kubernetes API failures into transient overload/network errors
//! the engine should retry at the step level, and everything else.

/// Outcome of classifying a `kube::Error`.
///
/// Transient errors carry the `Retryable` marker the engine checks before
/// re-executing a step; permanent errors pass through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum PodApiError {
    #[error("retryable: {0}")]
    Retryable(#[source] kube::Error),

    #[error(transparent)]
    Permanent(kube::Error),
}

impl PodApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Wrap transient API-server and network failures with a retryable marker.
pub fn classify(err: kube::Error) -> PodApiError {
    if is_transient(&err) {
        PodApiError::Retryable(err)
    } else {
        PodApiError::Permanent(err)
    }
}

/// API-server overload responses and any network-layer failure are transient.
/// Not-found, auth, invalid-argument and image errors are not.
fn is_transient(err: &kube::Error) -> bool {
    match err {
        // 429 TooManyRequests, 500 InternalError, 503 ServiceUnavailable,
        // 504 ServerTimeout
        kube::Error::Api(resp) => matches!(resp.code, 429 | 500 | 503 | 504),
        kube::Error::HyperError(_)
        | kube::Error::Service(_)
        | kube::Error::ReadEvents(_)
        | kube::Error::UpgradeConnection(_) => true,
        _ => false,
    }
}
