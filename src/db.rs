//! Contracts for the build engine's relational store.
//!
//! The runtime never talks to the database itself; the engine hands it
//! implementations of these traits. Container and volume rows follow a
//! creating → created handshake so a crash between the insert and the pod
//! creation leaves a row the engine can reap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::step::StepMetadata;

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// A container row in the `creating` state.
#[async_trait]
pub trait CreatingContainer: Send + Sync {
    fn handle(&self) -> Uuid;

    /// Flip the row to `created` once the pod exists.
    async fn created(self: Arc<Self>) -> anyhow::Result<Arc<dyn CreatedContainer>>;

    /// Mark the row failed so the engine can reap it.
    async fn failed(self: Arc<Self>) -> anyhow::Result<()>;
}

/// A container row in the `created` state.
pub trait CreatedContainer: Send + Sync {
    fn handle(&self) -> Uuid;
}

/// Either state, as returned by a lookup.
#[derive(Clone)]
pub enum ContainerRecord {
    Creating(Arc<dyn CreatingContainer>),
    Created(Arc<dyn CreatedContainer>),
}

#[async_trait]
pub trait ContainerRepository: Send + Sync {
    /// Look up the container owned by the given step handle.
    async fn find(&self, owner: &str) -> anyhow::Result<Option<ContainerRecord>>;

    async fn create(
        &self,
        owner: &str,
        metadata: &StepMetadata,
    ) -> anyhow::Result<Arc<dyn CreatingContainer>>;
}

// ---------------------------------------------------------------------------
// Volumes & artifacts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CreatingVolume: Send + Sync {
    fn handle(&self) -> Uuid;

    async fn created(self: Arc<Self>) -> anyhow::Result<Arc<dyn CreatedVolume>>;
}

#[async_trait]
pub trait CreatedVolume: Send + Sync {
    fn handle(&self) -> Uuid;

    /// Promote the volume's contents to a named build artifact.
    async fn initialize_artifact(&self, name: &str, build_id: i64) -> anyhow::Result<i64>;
}

#[async_trait]
pub trait VolumeRepository: Send + Sync {
    /// `kind` is currently always `"artifact"`.
    async fn create(
        &self,
        team: &str,
        worker: &str,
        kind: &str,
    ) -> anyhow::Result<Arc<dyn CreatingVolume>>;
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Heartbeat payload describing this worker to the engine.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Worker {
    pub name: String,
    pub platform: String,
    pub active_containers: usize,
    pub resource_types: Vec<ResourceTypeInfo>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceTypeInfo {
    pub name: String,
    pub image: String,
}

#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// First announcement, carrying the worker's initial state.
    async fn register(&self, worker: &Worker, ttl: Duration) -> anyhow::Result<()>;

    /// Periodic liveness refresh.
    async fn heartbeat(&self, worker: &Worker, ttl: Duration) -> anyhow::Result<()>;
}
