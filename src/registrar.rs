//! Worker heartbeats.
//!
//! Announces this worker to the build engine and keeps the registration
//! fresh: name, platform, how many step pods are live in the namespace, and
//! which resource types it can resolve to images.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::db::{ResourceTypeInfo, Worker, WorkerRepository};
use crate::names::LABEL_WORKER;
use crate::pods::PodApi;

/// Deterministic worker name for a namespace.
pub fn worker_name(namespace: &str) -> String {
    format!("k8s-{namespace}")
}

pub struct Registrar {
    pods: Arc<dyn PodApi>,
    workers: Arc<dyn WorkerRepository>,
    config: Arc<RuntimeConfig>,
    name: String,
}

impl Registrar {
    pub fn new(
        pods: Arc<dyn PodApi>,
        workers: Arc<dyn WorkerRepository>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        let name = worker_name(&config.namespace);
        Self {
            pods,
            workers,
            config,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register once, then heartbeat until shutdown.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<()>) {
        tracing::info!(worker = %self.name, "worker registrar started");

        match self.announce(true).await {
            Ok(()) => {}
            Err(e) => tracing::error!(error = %e, "initial worker registration failed"),
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("worker registrar shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.heartbeat_interval) => {
                    if let Err(e) = self.announce(false).await {
                        tracing::error!(error = %e, "worker heartbeat failed");
                    }
                }
            }
        }
    }

    /// One registration or heartbeat; they differ only in the first carrying
    /// the initial state payload.
    #[tracing::instrument(skip(self), fields(worker = %self.name), err)]
    async fn announce(&self, initial: bool) -> anyhow::Result<()> {
        let worker = self.build_worker().await?;
        let ttl = self.ttl();
        if initial {
            self.workers.register(&worker, ttl).await
        } else {
            self.workers.heartbeat(&worker, ttl).await
        }
    }

    async fn build_worker(&self) -> anyhow::Result<Worker> {
        let selector = format!("{LABEL_WORKER}={}", self.name);
        let active_containers = self.pods.list(&selector).await?.len();

        let resource_types = self
            .config
            .supported_resource_types()
            .into_iter()
            .map(|(name, image)| ResourceTypeInfo { name, image })
            .collect();

        Ok(Worker {
            name: self.name.clone(),
            platform: "linux".into(),
            active_containers,
            resource_types,
        })
    }

    fn ttl(&self) -> Duration {
        // outlive two missed heartbeats
        self.config.heartbeat_interval * 2
    }
}
