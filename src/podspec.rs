//! Translate a step spec plus runtime configuration into a Pod manifest.
//!
//! This is a pure function: the same inputs always render the same manifest,
//! which keeps it unit-testable without a cluster and lets callers diff
//! rendered pods in logs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, LocalObjectReference,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::artifact;
use crate::config::RuntimeConfig;
use crate::names::{self, ARTIFACT_HELPER_NAME, MAIN_CONTAINER_NAME};
use crate::sidecar::Sidecar;
use crate::step::{StepKind, StepMetadata, StepSpec};

/// Annotation that opts a pod into the GKE GCS FUSE sidecar injector.
pub const GCS_FUSE_ANNOTATION: &str = "gke-gcsfuse/volumes";

const WORKDIR_VOLUME: &str = "workdir";
const CACHE_PVC_VOLUME: &str = "cache";

/// Keeps the pause container alive until the kubelet asks it to stop.
const PAUSE_SCRIPT: &str = "trap 'exit 0' TERM; sleep 86400 & wait";

#[derive(Debug, thiserror::Error)]
pub enum PodSpecError {
    #[error("no image and no resource type declared")]
    MissingImage,

    #[error("unknown resource type {0:?}")]
    UnknownResourceType(String),
}

/// How the main container starts.
#[derive(Debug, Clone, Copy)]
pub enum Entrypoint<'a> {
    /// Command baked into the pod spec; runs once and terminates.
    Direct { path: &'a str, args: &'a [String] },
    /// Indefinite sleep; commands are delivered over the exec channel.
    Pause,
}

pub struct PodParams<'a> {
    pub config: &'a RuntimeConfig,
    pub metadata: &'a StepMetadata,
    pub spec: &'a StepSpec,
    pub handle: &'a str,
    pub pod_name: &'a str,
    pub worker: &'a str,
    pub entrypoint: Entrypoint<'a>,
    /// Process-level environment, appended after the step environment.
    pub extra_env: &'a [(String, String)],
    /// Process-level working directory, overriding the step's.
    pub working_dir: Option<&'a str>,
}

/// Whether this step moves artifacts over the shared PVC. Checks never do:
/// they produce no artifacts and should stay as slim as possible.
pub fn artifacts_enabled(config: &RuntimeConfig, kind: StepKind) -> bool {
    config.artifact_pvc.is_some() && kind != StepKind::Check
}

pub fn build_pod(p: &PodParams<'_>) -> Result<Pod, PodSpecError> {
    let image = resolve_image(p.config, p.spec)?;
    let artifacts = artifacts_enabled(p.config, p.spec.kind);

    let mut volumes: Vec<Volume> = Vec::new();
    let mut main_mounts: Vec<VolumeMount> = Vec::new();

    if !p.spec.dir.is_empty() {
        volumes.push(empty_dir_volume(WORKDIR_VOLUME));
        main_mounts.push(mount(WORKDIR_VOLUME, &p.spec.dir));
    }

    for (i, input) in p.spec.inputs.iter().enumerate() {
        let name = format!("input-{i}");
        volumes.push(empty_dir_volume(&name));
        main_mounts.push(mount(&name, &input.destination));
    }

    // outputs iterate in name order (BTreeMap) for deterministic manifests
    for (i, path) in p.spec.outputs.values().enumerate() {
        let name = format!("output-{i}");
        volumes.push(empty_dir_volume(&name));
        main_mounts.push(mount(&name, path));
    }

    match &p.config.cache_pvc {
        Some(claim) => {
            if !p.spec.caches.is_empty() {
                volumes.push(pvc_volume(CACHE_PVC_VOLUME, claim, false));
                for (i, path) in p.spec.caches.iter().enumerate() {
                    let mut m = mount(CACHE_PVC_VOLUME, path);
                    m.sub_path = Some(format!("{}/{i}", p.handle));
                    main_mounts.push(m);
                }
            }
        }
        None => {
            for (i, path) in p.spec.caches.iter().enumerate() {
                let name = format!("cache-{i}");
                volumes.push(empty_dir_volume(&name));
                main_mounts.push(mount(&name, path));
            }
        }
    }

    let mut containers = vec![main_container(p, image, &main_mounts)];
    let mut init_containers = Vec::new();

    if artifacts {
        if let Some(claim) = p.config.artifact_pvc.as_deref() {
            volumes.push(pvc_volume(artifact::ARTIFACT_STORE_VOLUME, claim, false));
        }
        containers.push(artifact_helper(p.config, &main_mounts));
        init_containers.extend(input_extractors(p.config, p.spec));
    }

    // Operator-level sidecars ride along on task pods only; resource
    // containers stay as declared.
    let operator_sidecars = matches!(p.spec.kind, StepKind::Task | StepKind::Run)
        .then_some(p.config.sidecars.as_slice())
        .unwrap_or_default();
    for sc in p.spec.sidecars.iter().chain(operator_sidecars) {
        containers.push(sidecar_container(sc, &main_mounts));
    }

    let mut annotations = BTreeMap::new();
    if artifacts && p.config.artifact_store_gcs_fuse {
        annotations.insert(GCS_FUSE_ANNOTATION.to_owned(), "true".to_owned());
    }

    Ok(Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(p.pod_name.to_owned()),
            namespace: Some(p.config.namespace.clone()),
            labels: Some(names::pod_labels(p.worker, p.metadata, p.handle)),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".into()),
            service_account_name: p.config.service_account.clone(),
            image_pull_secrets: pull_secrets(p.config),
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            containers,
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

fn main_container(p: &PodParams<'_>, image: String, mounts: &[VolumeMount]) -> Container {
    let (command, args) = match p.entrypoint {
        Entrypoint::Direct { path, args } => {
            (vec![path.to_owned()], (!args.is_empty()).then(|| args.to_vec()))
        }
        Entrypoint::Pause => (
            vec!["sh".to_owned(), "-c".to_owned(), PAUSE_SCRIPT.to_owned()],
            None,
        ),
    };

    // step env first, process env appended after; later entries shadow
    let mut env: Vec<EnvVar> = Vec::new();
    for (name, value) in p.spec.env.iter().chain(p.extra_env) {
        if let Some(existing) = env.iter_mut().find(|e| &e.name == name) {
            existing.value = Some(value.clone());
        } else {
            env.push(env_var(name, value));
        }
    }

    let working_dir = p
        .working_dir
        .map(str::to_owned)
        .or_else(|| (!p.spec.dir.is_empty()).then(|| p.spec.dir.clone()));

    let security_context = if p.spec.privileged {
        SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }
    } else {
        non_escalating()
    };

    Container {
        name: MAIN_CONTAINER_NAME.into(),
        image: Some(image),
        command: Some(command),
        args,
        working_dir,
        env: (!env.is_empty()).then_some(env),
        volume_mounts: (!mounts.is_empty()).then(|| mounts.to_vec()),
        resources: main_resources(p.spec),
        security_context: Some(security_context),
        ..Default::default()
    }
}

/// Pause sidecar holding the artifact PVC mount, so output uploads run in a
/// container the untrusted user image never sees.
fn artifact_helper(config: &RuntimeConfig, main_mounts: &[VolumeMount]) -> Container {
    let mut mounts = main_mounts.to_vec();
    mounts.push(mount(artifact::ARTIFACT_STORE_VOLUME, artifact::ARTIFACTS_MOUNT_PATH));

    Container {
        name: ARTIFACT_HELPER_NAME.into(),
        image: Some(config.artifact_helper_image.clone()),
        command: Some(vec!["sh".into(), "-c".into(), PAUSE_SCRIPT.into()]),
        volume_mounts: Some(mounts),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("50m", "64Mi")),
            limits: Some(quantities("100m", "128Mi")),
            ..Default::default()
        }),
        security_context: Some(non_escalating()),
        ..Default::default()
    }
}

/// One init container per input backed by a stored artifact, extracting its
/// tar into the input's empty-dir before the main container starts.
fn input_extractors(config: &RuntimeConfig, spec: &StepSpec) -> Vec<Container> {
    spec.inputs
        .iter()
        .enumerate()
        .filter_map(|(i, input)| {
            let source = input.source.as_ref()?;
            Some(Container {
                name: format!("fetch-input-{i}"),
                image: Some(config.artifact_helper_image.clone()),
                command: Some(artifact::extract_command(source.handle(), &input.destination)),
                volume_mounts: Some(vec![
                    VolumeMount {
                        read_only: Some(true),
                        ..mount(artifact::ARTIFACT_STORE_VOLUME, artifact::ARTIFACTS_MOUNT_PATH)
                    },
                    mount(&format!("input-{i}"), &input.destination),
                ]),
                security_context: Some(non_escalating()),
                ..Default::default()
            })
        })
        .collect()
}

fn sidecar_container(sc: &Sidecar, main_mounts: &[VolumeMount]) -> Container {
    let resources = sc.resources.as_ref().map(|r| ResourceRequirements {
        requests: r.requests.as_ref().map(quantity_list),
        limits: r.limits.as_ref().map(quantity_list),
        ..Default::default()
    });

    let ports: Vec<ContainerPort> = sc
        .ports
        .iter()
        .map(|port| ContainerPort {
            container_port: port.container_port,
            protocol: Some(port.protocol.clone().unwrap_or_else(|| "TCP".to_owned())),
            ..Default::default()
        })
        .collect();

    Container {
        name: sc.name.clone(),
        image: Some(sc.image.clone()),
        command: sc.command.clone(),
        args: sc.args.clone(),
        env: (!sc.env.is_empty()).then(|| {
            sc.env
                .iter()
                .map(|e| env_var(&e.name, &e.value))
                .collect()
        }),
        ports: (!ports.is_empty()).then_some(ports),
        working_dir: sc.working_dir.clone(),
        volume_mounts: (!main_mounts.is_empty()).then(|| main_mounts.to_vec()),
        resources,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Image resolution
// ---------------------------------------------------------------------------

fn resolve_image(config: &RuntimeConfig, spec: &StepSpec) -> Result<String, PodSpecError> {
    let image = spec
        .image
        .strip_prefix("docker:///")
        .or_else(|| spec.image.strip_prefix("docker://"))
        .or_else(|| spec.image.strip_prefix("raw:///"))
        .unwrap_or(&spec.image);

    if !image.is_empty() {
        return Ok(image.to_owned());
    }
    if spec.resource_type.is_empty() {
        return Err(PodSpecError::MissingImage);
    }
    config
        .resource_type_image(&spec.resource_type)
        .ok_or_else(|| PodSpecError::UnknownResourceType(spec.resource_type.clone()))
}

// ---------------------------------------------------------------------------
// Small builders
// ---------------------------------------------------------------------------

fn pull_secrets(config: &RuntimeConfig) -> Option<Vec<LocalObjectReference>> {
    let mut names: Vec<String> = config.image_pull_secrets.clone();
    if let Some(registry) = &config.image_registry {
        if let Some(secret) = &registry.secret {
            names.push(secret.clone());
        }
    }

    let mut seen = std::collections::BTreeSet::new();
    let secrets: Vec<LocalObjectReference> = names
        .into_iter()
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .map(|name| LocalObjectReference { name })
        .collect();
    (!secrets.is_empty()).then_some(secrets)
}

fn main_resources(spec: &StepSpec) -> Option<ResourceRequirements> {
    if spec.limits.is_empty() {
        return None;
    }
    let mut limits = BTreeMap::new();
    if let Some(cpu) = spec.limits.cpu {
        limits.insert("cpu".to_owned(), Quantity(format!("{cpu}m")));
    }
    if let Some(memory) = spec.limits.memory {
        limits.insert("memory".to_owned(), Quantity(memory.to_string()));
    }
    // requests mirror limits so the pod lands in the guaranteed QoS class
    Some(ResourceRequirements {
        requests: Some(limits.clone()),
        limits: Some(limits),
        ..Default::default()
    })
}

fn non_escalating() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        ..Default::default()
    }
}

fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn pvc_volume(name: &str, claim: &str, read_only: bool) -> Volume {
    Volume {
        name: name.to_owned(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_owned(),
            read_only: read_only.then_some(true),
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: path.to_owned(),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_owned(), Quantity(cpu.to_owned())),
        ("memory".to_owned(), Quantity(memory.to_owned())),
    ])
}

fn quantity_list(list: &crate::sidecar::SidecarResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_owned(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_owned(), Quantity(memory.clone()));
    }
    map
}
