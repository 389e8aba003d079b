//! A reconnecting event source over a single pod.
//!
//! The stream starts with the pod's current state (one `get`), then follows a
//! name-scoped watch, resuming from the last observed resource version across
//! reconnects. When the watch API refuses to subscribe repeatedly, the
//! watcher degrades to a single polled read before trying again.

use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::core::WatchEvent;
use tokio_util::sync::CancellationToken;

use crate::pods::{PodApi, WatchStream};
use crate::retryable::{self, PodApiError};

/// Consecutive subscribe failures tolerated before falling back to a get.
const MAX_SUBSCRIBE_FAILURES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch stopped")]
    Stopped,

    #[error("watch cancelled")]
    Cancelled,

    #[error(transparent)]
    Api(#[from] PodApiError),
}

impl WatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_retryable())
    }
}

pub struct PodWatcher {
    pods: Arc<dyn PodApi>,
    pod_name: String,
    resource_version: Option<String>,
    stream: Option<WatchStream>,
    subscribe_failures: u32,
    synced: bool,
    stop: CancellationToken,
}

impl PodWatcher {
    pub fn new(pods: Arc<dyn PodApi>, pod_name: impl Into<String>) -> Self {
        Self {
            pods,
            pod_name: pod_name.into(),
            resource_version: None,
            stream: None,
            subscribe_failures: 0,
            synced: false,
            stop: CancellationToken::new(),
        }
    }

    /// A handle that terminates every outstanding and future `next` call.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Last resource version observed on the stream.
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// Deliver the next observation of the pod, in resource-version order.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Pod, WatchError> {
        loop {
            if self.stop.is_cancelled() {
                return Err(WatchError::Stopped);
            }
            if cancel.is_cancelled() {
                return Err(WatchError::Cancelled);
            }

            // Initial sync: emit current state before subscribing.
            if !self.synced {
                let pod = self.guarded_get(cancel).await?;
                self.observe(&pod);
                self.synced = true;
                return Ok(pod);
            }

            if self.stream.is_none() {
                if self.subscribe_failures >= MAX_SUBSCRIBE_FAILURES {
                    // Bounded fallback: one polled read, then resume trying.
                    let pod = self.guarded_get(cancel).await?;
                    self.observe(&pod);
                    self.subscribe_failures = 0;
                    return Ok(pod);
                }
                self.subscribe(cancel).await?;
                continue;
            }

            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            let event = tokio::select! {
                () = self.stop.cancelled() => return Err(WatchError::Stopped),
                () = cancel.cancelled() => return Err(WatchError::Cancelled),
                event = stream.next() => event,
            };

            match event {
                // Channel closed; re-subscribe from the latest version.
                None => self.stream = None,
                Some(Ok(WatchEvent::Added(pod) | WatchEvent::Modified(pod))) => {
                    self.observe(&pod);
                    return Ok(pod);
                }
                Some(Ok(WatchEvent::Deleted(pod))) => {
                    self.observe(&pod);
                    return Ok(pod);
                }
                Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                    self.resource_version = Some(bookmark.metadata.resource_version.clone());
                }
                Some(Ok(WatchEvent::Error(resp))) => {
                    tracing::debug!(pod = %self.pod_name, code = resp.code, reason = %resp.reason,
                        "watch stream error event");
                    self.stream = None;
                    if resp.code == 410 {
                        // Resource version expired; resync from a fresh get.
                        self.resource_version = None;
                        self.synced = false;
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(pod = %self.pod_name, error = %err, "watch stream failed");
                    self.stream = None;
                }
            }
        }
    }

    async fn subscribe(&mut self, cancel: &CancellationToken) -> Result<(), WatchError> {
        let version = self.resource_version.clone().unwrap_or_default();
        let result = tokio::select! {
            () = self.stop.cancelled() => return Err(WatchError::Stopped),
            () = cancel.cancelled() => return Err(WatchError::Cancelled),
            result = self.pods.watch(&self.pod_name, &version) => result,
        };
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.subscribe_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.subscribe_failures += 1;
                tracing::debug!(pod = %self.pod_name, error = %err,
                    failures = self.subscribe_failures, "watch subscribe failed");
                tokio::select! {
                    () = self.stop.cancelled() => return Err(WatchError::Stopped),
                    () = cancel.cancelled() => return Err(WatchError::Cancelled),
                    () = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                }
                Ok(())
            }
        }
    }

    async fn guarded_get(&mut self, cancel: &CancellationToken) -> Result<Pod, WatchError> {
        let result = tokio::select! {
            () = self.stop.cancelled() => return Err(WatchError::Stopped),
            () = cancel.cancelled() => return Err(WatchError::Cancelled),
            result = self.pods.get(&self.pod_name) => result,
        };
        result.map_err(|err| WatchError::Api(retryable::classify(err)))
    }

    fn observe(&mut self, pod: &Pod) {
        if let Some(version) = &pod.metadata.resource_version {
            self.resource_version = Some(version.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;

    use super::*;
    use crate::testing::{FakePods, pod_with_phase, set_resource_version};

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn emits_initial_state_before_watching() {
        let fake = Arc::new(FakePods::default());
        let mut pod = pod_with_phase("p1", "Pending");
        set_resource_version(&mut pod, "5");
        fake.put_pod(pod);
        fake.push_watch_script(vec![]);

        let mut watcher = PodWatcher::new(fake.clone(), "p1");
        let first = watcher.next(&cancel()).await.unwrap();
        assert_eq!(first.metadata.resource_version.as_deref(), Some("5"));
        assert_eq!(watcher.resource_version(), Some("5"));
        // the get happened before any watch call
        assert!(fake.watch_requests().is_empty());
    }

    #[tokio::test]
    async fn events_arrive_in_resource_version_order() {
        let fake = Arc::new(FakePods::default());
        let mut pod = pod_with_phase("p1", "Pending");
        set_resource_version(&mut pod, "1");
        fake.put_pod(pod);

        let mut running = pod_with_phase("p1", "Running");
        set_resource_version(&mut running, "2");
        let mut done = pod_with_phase("p1", "Succeeded");
        set_resource_version(&mut done, "3");
        fake.push_watch_script(vec![
            Ok(WatchEvent::Modified(running)),
            Ok(WatchEvent::Modified(done)),
        ]);

        let mut watcher = PodWatcher::new(fake.clone(), "p1");
        let token = cancel();
        let mut versions = Vec::new();
        for _ in 0..3 {
            let pod = watcher.next(&token).await.unwrap();
            versions.push(pod.metadata.resource_version.unwrap());
        }
        assert_eq!(versions, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn reconnects_from_latest_resource_version() {
        let fake = Arc::new(FakePods::default());
        let mut pod = pod_with_phase("p1", "Pending");
        set_resource_version(&mut pod, "7");
        fake.put_pod(pod);

        let mut running = pod_with_phase("p1", "Running");
        set_resource_version(&mut running, "9");
        // first subscription delivers one event then closes
        fake.push_watch_script(vec![Ok(WatchEvent::Modified(running))]);
        let mut done = pod_with_phase("p1", "Succeeded");
        set_resource_version(&mut done, "12");
        fake.push_watch_script(vec![Ok(WatchEvent::Modified(done))]);

        let mut watcher = PodWatcher::new(fake.clone(), "p1");
        let token = cancel();
        for _ in 0..3 {
            watcher.next(&token).await.unwrap();
        }

        let requests = fake.watch_requests();
        assert_eq!(requests, ["7", "9"]);
        assert_eq!(watcher.resource_version(), Some("12"));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_get_after_repeated_subscribe_failures() {
        let fake = Arc::new(FakePods::default());
        let mut pod = pod_with_phase("p1", "Running");
        set_resource_version(&mut pod, "20");
        fake.put_pod(pod);
        fake.fail_subscribes(3);

        let mut watcher = PodWatcher::new(fake.clone(), "p1");
        let token = cancel();
        // initial sync
        watcher.next(&token).await.unwrap();

        let mut updated = pod_with_phase("p1", "Running");
        set_resource_version(&mut updated, "25");
        fake.put_pod(updated);

        // three failed subscribes, then the polled read is emitted
        let pod = watcher.next(&token).await.unwrap();
        assert_eq!(pod.metadata.resource_version.as_deref(), Some("25"));
        assert_eq!(fake.watch_requests().len(), 3);
    }

    #[tokio::test]
    async fn gone_error_triggers_resync() {
        let fake = Arc::new(FakePods::default());
        let mut pod = pod_with_phase("p1", "Running");
        set_resource_version(&mut pod, "30");
        fake.put_pod(pod);

        fake.push_watch_script(vec![Ok(WatchEvent::Error(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        }))]);

        let mut watcher = PodWatcher::new(fake.clone(), "p1");
        let token = cancel();
        watcher.next(&token).await.unwrap();

        let mut fresh = pod_with_phase("p1", "Running");
        set_resource_version(&mut fresh, "44");
        fake.put_pod(fresh);

        // the 410 resyncs via get rather than erroring out
        let pod = watcher.next(&token).await.unwrap();
        assert_eq!(pod.metadata.resource_version.as_deref(), Some("44"));
    }

    #[tokio::test]
    async fn stop_terminates_outstanding_next() {
        let fake = Arc::new(FakePods::default());
        let mut pod = pod_with_phase("p1", "Running");
        set_resource_version(&mut pod, "1");
        fake.put_pod(pod);
        // open-ended stream that never yields
        fake.push_hanging_watch();

        let mut watcher = PodWatcher::new(fake.clone(), "p1");
        let stop = watcher.stop_handle();
        let token = cancel();
        watcher.next(&token).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.cancel();
        });
        let err = watcher.next(&token).await.unwrap_err();
        assert!(matches!(err, WatchError::Stopped));
    }

    #[tokio::test]
    async fn get_errors_surface_classified() {
        let fake = Arc::new(FakePods::default());
        // no pod stored: get returns 404
        let mut watcher = PodWatcher::new(fake, "ghost");
        let err = watcher.next(&cancel()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, WatchError::Api(_)));
    }
}
