use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::sidecar::{self, Sidecar};

/// Registry mirror applied to built-in resource-type images.
#[derive(Debug, Clone)]
pub struct ImageRegistry {
    pub prefix: String,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
    pub pod_startup_timeout: Duration,
    /// Operator overrides for the resource-type image table; last entry wins.
    pub resource_types: BTreeMap<String, String>,
    pub image_pull_secrets: Vec<String>,
    pub service_account: Option<String>,
    pub cache_pvc: Option<String>,
    pub artifact_pvc: Option<String>,
    pub artifact_helper_image: String,
    pub artifact_store_gcs_fuse: bool,
    pub image_registry: Option<ImageRegistry>,
    /// Sidecars injected into every task pod, from the operator sidecar file.
    pub sidecars: Vec<Sidecar>,
    pub heartbeat_interval: Duration,
    pub gc_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: "jetbridge".into(),
            kubeconfig: None,
            pod_startup_timeout: Duration::from_secs(300),
            resource_types: BTreeMap::new(),
            image_pull_secrets: Vec::new(),
            service_account: None,
            cache_pvc: None,
            artifact_pvc: None,
            artifact_helper_image: "busybox:1.36".into(),
            artifact_store_gcs_fuse: false,
            image_registry: None,
            sidecars: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            gc_interval: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let image_registry = env::var("JETBRIDGE_IMAGE_REGISTRY_PREFIX")
            .ok()
            .filter(|p| !p.is_empty())
            .map(|prefix| ImageRegistry {
                prefix,
                secret: env::var("JETBRIDGE_IMAGE_REGISTRY_SECRET").ok(),
            });

        let sidecars = match env::var("JETBRIDGE_SIDECARS_FILE") {
            Ok(path) => sidecar::parse_sidecars(&std::fs::read_to_string(&path)?)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            namespace: env::var("JETBRIDGE_NAMESPACE").unwrap_or(defaults.namespace),
            kubeconfig: env::var("JETBRIDGE_KUBECONFIG").ok().map(PathBuf::from),
            pod_startup_timeout: env::var("JETBRIDGE_POD_STARTUP_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(defaults.pod_startup_timeout, Duration::from_secs),
            resource_types: parse_resource_types(
                &env::var("JETBRIDGE_RESOURCE_TYPES").unwrap_or_default(),
            ),
            image_pull_secrets: parse_list(
                &env::var("JETBRIDGE_IMAGE_PULL_SECRETS").unwrap_or_default(),
            ),
            service_account: env::var("JETBRIDGE_SERVICE_ACCOUNT").ok(),
            cache_pvc: env::var("JETBRIDGE_CACHE_PVC").ok().filter(|v| !v.is_empty()),
            artifact_pvc: env::var("JETBRIDGE_ARTIFACT_PVC")
                .ok()
                .filter(|v| !v.is_empty()),
            artifact_helper_image: env::var("JETBRIDGE_ARTIFACT_HELPER_IMAGE")
                .unwrap_or(defaults.artifact_helper_image),
            artifact_store_gcs_fuse: env::var("JETBRIDGE_ARTIFACT_GCS_FUSE")
                .is_ok_and(|v| v == "true" || v == "1"),
            image_registry,
            sidecars,
            heartbeat_interval: env::var("JETBRIDGE_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(defaults.heartbeat_interval, Duration::from_secs),
            gc_interval: env::var("JETBRIDGE_GC_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(defaults.gc_interval, Duration::from_secs),
        })
    }

    /// Resolve a resource-type name to its container image. Operator
    /// overrides shadow the built-in table; the registry prefix applies to
    /// built-in defaults only (overrides are taken verbatim).
    pub fn resource_type_image(&self, name: &str) -> Option<String> {
        if let Some(image) = self.resource_types.get(name) {
            return Some(image.clone());
        }
        let image = builtin_resource_types()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, image)| (*image).to_owned())?;
        match &self.image_registry {
            Some(registry) => Some(format!("{}/{image}", registry.prefix.trim_end_matches('/'))),
            None => Some(image),
        }
    }

    /// The merged resource-type table, for worker registration.
    pub fn supported_resource_types(&self) -> BTreeMap<String, String> {
        let mut table: BTreeMap<String, String> = builtin_resource_types()
            .iter()
            .map(|(n, _)| ((*n).to_owned(), self.resource_type_image(n).unwrap_or_default()))
            .collect();
        for (name, image) in &self.resource_types {
            table.insert(name.clone(), image.clone());
        }
        table
    }
}

/// Images shipped with the worker for the standard resource types.
pub fn builtin_resource_types() -> &'static [(&'static str, &'static str)] {
    &[
        ("git", "jetbridge/git-resource"),
        ("time", "jetbridge/time-resource"),
        ("s3", "jetbridge/s3-resource"),
        ("registry-image", "jetbridge/registry-image-resource"),
        ("semver", "jetbridge/semver-resource"),
        ("mock", "jetbridge/mock-resource"),
    ]
}

/// Parse `name=image` pairs, comma separated. Later entries win.
fn parse_resource_types(raw: &str) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((name, image)) = pair.split_once('=') {
            if !name.is_empty() && !image.is_empty() {
                table.insert(name.to_owned(), image.to_owned());
            }
        }
    }
    table
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_pairs_last_wins() {
        let table = parse_resource_types("git=a/git:1, time=a/time:2 ,git=b/git:3,,bad");
        assert_eq!(table["git"], "b/git:3");
        assert_eq!(table["time"], "a/time:2");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn override_shadows_builtin() {
        let config = RuntimeConfig {
            resource_types: BTreeMap::from([("git".to_owned(), "mirror/git:v2".to_owned())]),
            ..RuntimeConfig::default()
        };
        assert_eq!(config.resource_type_image("git").unwrap(), "mirror/git:v2");
        assert_eq!(
            config.resource_type_image("time").unwrap(),
            "jetbridge/time-resource"
        );
        assert!(config.resource_type_image("nope").is_none());
    }

    #[test]
    fn registry_prefix_applies_to_builtins_only() {
        let config = RuntimeConfig {
            resource_types: BTreeMap::from([("git".to_owned(), "custom/git".to_owned())]),
            image_registry: Some(ImageRegistry {
                prefix: "registry.internal/".to_owned(),
                secret: None,
            }),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            config.resource_type_image("time").unwrap(),
            "registry.internal/jetbridge/time-resource"
        );
        assert_eq!(config.resource_type_image("git").unwrap(), "custom/git");
    }

    #[test]
    fn supported_types_include_overrides() {
        let config = RuntimeConfig {
            resource_types: BTreeMap::from([("terraform".to_owned(), "tf/resource".to_owned())]),
            ..RuntimeConfig::default()
        };
        let table = config.supported_resource_types();
        assert_eq!(table["terraform"], "tf/resource");
        assert_eq!(table["git"], "jetbridge/git-resource");
    }

    #[test]
    fn pull_secret_list_parsing() {
        assert_eq!(parse_list("a, b ,,c"), ["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }
}
