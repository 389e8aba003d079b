//! JetBridge: the Kubernetes-backed worker runtime of the build orchestrator.
//!
//! Each pipeline step runs as a Kubernetes Pod. The build engine works
//! against the [`container::Container`] / [`process::Process`] /
//! [`volume::Volume`] abstractions and never sees pod lifecycle, log
//! streaming, exec multiplexing or artifact movement directly.
//!
//! Steps execute in one of two modes:
//!
//! - **direct**: the command is baked into the pod spec; output is recovered
//!   by following logs and the exit code from the pod status.
//! - **exec**: the pod runs a pause command and the real command is delivered
//!   over the exec channel, which preserves stdio and the true exit code and
//!   keeps the pod around for interactive debugging afterwards.
//!
//! The [`registrar`] and [`gc`] loops run independently inside the engine
//! process, following the same `run(deps, shutdown)` shape as every other
//! background task.

pub mod artifact;
pub mod config;
pub mod container;
pub mod db;
pub mod exec;
pub mod gc;
pub mod metrics;
pub mod names;
pub mod pods;
pub mod podspec;
pub mod process;
pub mod registrar;
pub mod retryable;
pub mod sidecar;
pub mod step;
pub mod volume;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;
