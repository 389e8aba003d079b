use std::collections::BTreeMap;

use crate::step::{StepKind, StepMetadata};

/// The user-visible container in every step pod.
pub const MAIN_CONTAINER_NAME: &str = "main";

/// Co-located helper that tars step outputs onto the artifact PVC.
pub const ARTIFACT_HELPER_NAME: &str = "artifact-helper";

/// Container names the pod builder claims for itself; operator sidecars may
/// not use them.
pub const RESERVED_CONTAINER_NAMES: [&str; 2] = [MAIN_CONTAINER_NAME, ARTIFACT_HELPER_NAME];

pub const LABEL_WORKER: &str = "worker";
pub const LABEL_TYPE: &str = "type";
pub const LABEL_PIPELINE: &str = "pipeline";
pub const LABEL_JOB: &str = "job";
pub const LABEL_BUILD: &str = "build";
pub const LABEL_STEP: &str = "step";
pub const LABEL_HANDLE: &str = "handle";

/// Kubernetes label values are capped at 63 characters, as are DNS labels.
const MAX_NAME_LEN: usize = 63;

/// Pipeline and job segments are truncated so the composed name stays legible.
const MAX_SEGMENT_LEN: usize = 20;

// ---------------------------------------------------------------------------
// Pod naming
// ---------------------------------------------------------------------------

/// Derive the deterministic, DNS-label-safe pod name for a step.
///
/// The handle suffix keeps names unique across retriggers of the same step;
/// everything before it exists for a human scanning `kubectl get pods`.
pub fn pod_name(meta: &StepMetadata, handle: &str) -> String {
    let suffix = handle_suffix(handle);
    let step = sanitize(&meta.step, MAX_NAME_LEN);

    let name = if meta.kind == StepKind::Check && !step.is_empty() {
        let step = sanitize(&meta.step, MAX_NAME_LEN - "chk-".len() - 1 - suffix.len());
        format!("chk-{step}-{suffix}")
    } else if (meta.pipeline.is_empty() || meta.job.is_empty())
        && matches!(meta.kind, StepKind::Get | StepKind::Put)
        && !step.is_empty()
    {
        // Resource-type fetch outside any job context.
        let kind = meta.kind.as_str();
        let step = sanitize(
            &meta.step,
            MAX_NAME_LEN - "rt-".len() - kind.len() - 2 - suffix.len(),
        );
        format!("rt-{step}-{kind}-{suffix}")
    } else if !meta.pipeline.is_empty() && !meta.job.is_empty() {
        let tail = format!("-{}-{suffix}", meta.kind.as_str());
        let pipeline = sanitize(&meta.pipeline, MAX_SEGMENT_LEN);
        let job = sanitize(&meta.job, MAX_SEGMENT_LEN);
        let build = if meta.build.is_empty() {
            String::new()
        } else {
            format!("-b{}", sanitize(&meta.build, MAX_SEGMENT_LEN))
        };
        // only the human-readable prefix shrinks; the kind and handle suffix
        // must survive truncation intact
        let prefix = tidy(&format!("{pipeline}-{job}{build}"), MAX_NAME_LEN - tail.len());
        format!("{prefix}{tail}")
    } else {
        handle.to_owned()
    };

    tidy(&name, MAX_NAME_LEN)
}

/// Final pass over a composed name: empty segments can leave hyphen runs or a
/// leading hyphen behind.
fn tidy(name: &str, max: usize) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    clamp(out.trim_matches('-'), max)
}

/// Labels attached to every step pod. `worker`, `type` and `handle` are
/// always present; pipeline coordinates only when known.
pub fn pod_labels(worker: &str, meta: &StepMetadata, handle: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_WORKER.to_owned(), label_value(worker));
    labels.insert(LABEL_TYPE.to_owned(), meta.kind.as_str().to_owned());
    labels.insert(LABEL_HANDLE.to_owned(), label_value(handle));

    for (key, value) in [
        (LABEL_PIPELINE, &meta.pipeline),
        (LABEL_JOB, &meta.job),
        (LABEL_BUILD, &meta.build),
        (LABEL_STEP, &meta.step),
    ] {
        if !value.is_empty() {
            labels.insert(key.to_owned(), label_value(value));
        }
    }

    labels
}

/// First eight hex characters of the handle, hyphens removed. Stable across
/// the hyphenated and compact renderings of the same UUID.
pub fn handle_suffix(handle: &str) -> String {
    handle.chars().filter(|c| *c != '-').take(8).collect()
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Reduce an arbitrary string to a DNS-label-safe fragment of at most
/// `max` characters.
pub fn sanitize(s: &str, max: usize) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.to_lowercase().chars() {
        let c = match c {
            '_' | '.' | ' ' => '-',
            other => other,
        };
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            // collapse hyphen runs
            if c == '-' && out.ends_with('-') {
                continue;
            }
            out.push(c);
        }
    }
    let trimmed = out.trim_matches('-');
    clamp(trimmed, max)
}

fn label_value(s: &str) -> String {
    s.chars().take(MAX_NAME_LEN).collect()
}

fn clamp(s: &str, max: usize) -> String {
    let cut: String = s.chars().take(max).collect();
    cut.trim_end_matches('-').to_owned()
}
