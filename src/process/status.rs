//! Pure assessment of a pod observation, shared by both process shapes.

use std::fmt::Write as _;

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use crate::names::MAIN_CONTAINER_NAME;

/// Waiting reasons on the main container that will never resolve on their
/// own. CrashLoopBackOff is included because it can appear while the pod
/// phase still reads Running.
const TERMINAL_WAITING_REASONS: [&str; 5] = [
    "ImagePullBackOff",
    "ErrImagePull",
    "CrashLoopBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
];

/// Reasons counted against the image-pull failure metric.
pub(crate) fn is_image_pull_reason(reason: &str) -> bool {
    matches!(reason, "ImagePullBackOff" | "ErrImagePull" | "InvalidImageName")
}

/// What one observation of the pod tells us about the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PodProgress {
    /// Still pending; keep watching.
    Waiting,
    Running,
    /// Terminal waiting reason on the main container.
    TerminalWait(String),
    Evicted,
    Unschedulable,
    /// The pod reached a completed phase; exit code of the main container.
    Exited(i32),
}

pub(crate) fn assess(pod: &Pod) -> PodProgress {
    if let Some(reason) = terminal_waiting_reason(pod) {
        return PodProgress::TerminalWait(reason);
    }
    if is_evicted(pod) {
        return PodProgress::Evicted;
    }
    if is_unschedulable(pod) {
        return PodProgress::Unschedulable;
    }
    match phase(pod) {
        // A completed phase without a terminated main container can happen
        // when the status update races the phase flip; default conservatively.
        "Succeeded" => PodProgress::Exited(main_exit_code(pod).unwrap_or(0)),
        "Failed" => PodProgress::Exited(main_exit_code(pod).unwrap_or(1)),
        "Running" => PodProgress::Running,
        _ => PodProgress::Waiting,
    }
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

fn main_status(pod: &Pod) -> Option<&ContainerStatus> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == MAIN_CONTAINER_NAME)
}

fn terminal_waiting_reason(pod: &Pod) -> Option<String> {
    let waiting = main_status(pod)?.state.as_ref()?.waiting.as_ref()?;
    let reason = waiting.reason.as_deref()?;
    TERMINAL_WAITING_REASONS
        .contains(&reason)
        .then(|| reason.to_owned())
}

fn is_evicted(pod: &Pod) -> bool {
    phase(pod) == "Failed"
        && pod
            .status
            .as_ref()
            .and_then(|s| s.reason.as_deref())
            == Some("Evicted")
}

fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
}

fn main_exit_code(pod: &Pod) -> Option<i32> {
    let terminated = main_status(pod)?.state.as_ref()?.terminated.as_ref()?;
    Some(terminated.exit_code)
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Render everything a user needs to debug a dead pod. Written to the step's
/// stderr on every fast-fail path.
pub(crate) fn format_pod_diagnostics(pod: &Pod) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Pod Failure Diagnostics");

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let _ = writeln!(out, "pod: {namespace}/{name}");
    let _ = writeln!(out, "phase: {}", phase(pod));

    if let Some(status) = &pod.status {
        if let Some(reason) = &status.reason {
            let _ = writeln!(out, "reason: {reason}");
        }
        if let Some(message) = &status.message {
            let _ = writeln!(out, "message: {message}");
        }
        for condition in status.conditions.iter().flatten() {
            if condition.status != "True" {
                let _ = writeln!(
                    out,
                    "condition {}={} reason={} message={}",
                    condition.type_,
                    condition.status,
                    condition.reason.as_deref().unwrap_or("-"),
                    condition.message.as_deref().unwrap_or("-"),
                );
            }
        }
        let statuses = status
            .init_container_statuses
            .iter()
            .flatten()
            .chain(status.container_statuses.iter().flatten());
        for cs in statuses {
            if let Some(state) = &cs.state {
                if let Some(waiting) = &state.waiting {
                    let _ = writeln!(
                        out,
                        "container {} waiting: reason={} message={}",
                        cs.name,
                        waiting.reason.as_deref().unwrap_or("-"),
                        waiting.message.as_deref().unwrap_or("-"),
                    );
                }
                if let Some(terminated) = &state.terminated {
                    let _ = writeln!(
                        out,
                        "container {} terminated: reason={} exit_code={}",
                        cs.name,
                        terminated.reason.as_deref().unwrap_or("-"),
                        terminated.exit_code,
                    );
                }
            }
        }
    }

    out
}
