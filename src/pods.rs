//! The narrow slice of the Kubernetes pod API this runtime uses, behind a
//! trait so the lifecycle machinery can be exercised against an in-memory
//! fake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams, WatchParams};
use kube::core::WatchEvent;
use kube::Api;
use tokio::io::AsyncRead;

pub type WatchStream = BoxStream<'static, Result<WatchEvent<Pod>, kube::Error>>;

#[async_trait]
pub trait PodApi: Send + Sync {
    async fn get(&self, name: &str) -> Result<Pod, kube::Error>;

    async fn create(&self, pod: &Pod) -> Result<Pod, kube::Error>;

    async fn delete(&self, name: &str) -> Result<(), kube::Error>;

    async fn list(&self, label_selector: &str) -> Result<Vec<Pod>, kube::Error>;

    /// Merge-patch the given annotations onto the pod.
    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), kube::Error>;

    /// Follow the logs of one container, from the beginning.
    async fn follow_logs(
        &self,
        name: &str,
        container: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, kube::Error>;

    /// Open a watch scoped to a single pod, starting at `resource_version`.
    async fn watch(&self, name: &str, resource_version: &str)
    -> Result<WatchStream, kube::Error>;
}

/// Returns true when the error is a 404 from the API server.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

// ---------------------------------------------------------------------------
// kube-backed implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct KubePods {
    api: Api<Pod>,
}

impl KubePods {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl PodApi for KubePods {
    async fn get(&self, name: &str) -> Result<Pod, kube::Error> {
        self.api.get(name).await
    }

    async fn create(&self, pod: &Pod) -> Result<Pod, kube::Error> {
        self.api.create(&PostParams::default(), pod).await
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let list = self
            .api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), kube::Error> {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn follow_logs(
        &self,
        name: &str,
        container: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, kube::Error> {
        let stream = self
            .api
            .log_stream(
                name,
                &LogParams {
                    container: Some(container.to_owned()),
                    follow: true,
                    ..Default::default()
                },
            )
            .await?;

        // log_stream yields a futures AsyncBufRead; the rest of the runtime
        // speaks tokio, so bridge it through the compat layer.
        use tokio_util::compat::FuturesAsyncReadCompatExt;
        Ok(Box::new(stream.compat()))
    }

    async fn watch(
        &self,
        name: &str,
        resource_version: &str,
    ) -> Result<WatchStream, kube::Error> {
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let stream = self.api.watch(&params, resource_version).await?;
        Ok(stream.boxed())
    }
}
