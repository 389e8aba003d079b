//! Pod garbage collection.
//!
//! Exec-mode pods are deliberately left alive after a step completes so a
//! debug session can still attach. This loop is what eventually reclaims
//! them: when the engine removes a container's owning record, the pod goes.

use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use chrono::Utc;

use crate::config::RuntimeConfig;
use crate::db::ContainerRepository;
use crate::names::{LABEL_HANDLE, LABEL_WORKER};
use crate::pods::PodApi;

/// Pods younger than this are never collected; their record may still be on
/// its way through the creating → created handshake.
const CREATION_GRACE: Duration = Duration::from_secs(120);

pub struct PodReaper {
    pods: Arc<dyn PodApi>,
    containers: Arc<dyn ContainerRepository>,
    config: Arc<RuntimeConfig>,
    worker: String,
}

impl PodReaper {
    pub fn new(
        pods: Arc<dyn PodApi>,
        containers: Arc<dyn ContainerRepository>,
        config: Arc<RuntimeConfig>,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            pods,
            containers,
            config,
            worker: worker.into(),
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<()>) {
        tracing::info!(worker = %self.worker, "pod reaper started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("pod reaper shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.gc_interval) => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "pod sweep failed");
                    }
                }
            }
        }
    }

    /// Delete every worker pod whose owning container record is gone.
    #[tracing::instrument(skip(self), fields(worker = %self.worker), err)]
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let selector = format!("{LABEL_WORKER}={}", self.worker);
        let pods = self.pods.list(&selector).await?;

        for pod in pods {
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            let Some(handle) = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_HANDLE))
            else {
                tracing::warn!(pod = %name, "worker pod without a handle label, skipping");
                continue;
            };

            if let Some(created_at) = pod.metadata.creation_timestamp.as_ref() {
                let age = k8s_openapi::jiff::Timestamp::now().duration_since(created_at.0);
                if Duration::try_from(age).unwrap_or(Duration::ZERO) < CREATION_GRACE {
                    continue;
                }
            }

            match self.containers.find(handle).await? {
                Some(_) => {}
                None => {
                    tracing::info!(pod = %name, %handle, "owning record gone, deleting pod");
                    if let Err(err) = self.pods.delete(&name).await {
                        tracing::warn!(pod = %name, error = %err, "pod deletion failed");
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::db::{ContainerRecord, CreatingContainer};
    use crate::step::StepMetadata;
    use crate::testing::{FakeDbContainer, FakePods, pod_with_labels, set_creation_timestamp};

    #[derive(Default)]
    struct FakeContainers {
        known: Mutex<HashSet<String>>,
    }

    impl FakeContainers {
        fn insert(&self, handle: &str) {
            self.known.lock().unwrap().insert(handle.to_owned());
        }
    }

    #[async_trait]
    impl ContainerRepository for FakeContainers {
        async fn find(&self, owner: &str) -> anyhow::Result<Option<ContainerRecord>> {
            let known = self.known.lock().unwrap();
            Ok(known.contains(owner).then(|| {
                let db: Arc<dyn crate::db::CreatedContainer> =
                    Arc::new(FakeDbContainer::default());
                ContainerRecord::Created(db)
            }))
        }

        async fn create(
            &self,
            _owner: &str,
            _metadata: &StepMetadata,
        ) -> anyhow::Result<Arc<dyn CreatingContainer>> {
            anyhow::bail!("not used in this test")
        }
    }

    fn aged_pod(name: &str, handle: &str) -> k8s_openapi::api::core::v1::Pod {
        let pod = pod_with_labels(
            name,
            &[(LABEL_WORKER, "k8s-jetbridge"), (LABEL_HANDLE, handle)],
        );
        set_creation_timestamp(pod, Utc::now() - chrono::Duration::hours(1))
    }

    fn reaper(pods: &Arc<FakePods>, containers: &Arc<FakeContainers>) -> PodReaper {
        PodReaper::new(
            pods.clone(),
            containers.clone(),
            Arc::new(RuntimeConfig::default()),
            "k8s-jetbridge",
        )
    }

    #[tokio::test]
    async fn deletes_pods_whose_record_is_gone() {
        let pods = Arc::new(FakePods::default());
        pods.put_pod(aged_pod("owned", "handle-a"));
        pods.put_pod(aged_pod("orphan", "handle-b"));

        let containers = Arc::new(FakeContainers::default());
        containers.insert("handle-a");

        reaper(&pods, &containers).sweep().await.unwrap();
        assert_eq!(pods.deleted(), ["orphan"]);
    }

    #[tokio::test]
    async fn young_pods_are_left_alone() {
        let pods = Arc::new(FakePods::default());
        let fresh = pod_with_labels(
            "fresh-orphan",
            &[(LABEL_WORKER, "k8s-jetbridge"), (LABEL_HANDLE, "handle-x")],
        );
        pods.put_pod(set_creation_timestamp(fresh, Utc::now()));

        let containers = Arc::new(FakeContainers::default());
        reaper(&pods, &containers).sweep().await.unwrap();
        assert!(pods.deleted().is_empty());
    }

    #[tokio::test]
    async fn pods_without_handles_are_skipped() {
        let pods = Arc::new(FakePods::default());
        let unlabeled = pod_with_labels("mystery", &[(LABEL_WORKER, "k8s-jetbridge")]);
        pods.put_pod(set_creation_timestamp(
            unlabeled,
            Utc::now() - chrono::Duration::hours(1),
        ));

        let containers = Arc::new(FakeContainers::default());
        reaper(&pods, &containers).sweep().await.unwrap();
        assert!(pods.deleted().is_empty());
    }
}
