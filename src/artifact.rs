//! Naming and tar framing for the shared artifact PVC.
//!
//! Artifacts move between steps as uncompressed tar files on a PVC mounted at
//! [`ARTIFACTS_MOUNT_PATH`], keyed by the producing volume's handle. The main
//! container never mounts the PVC; init containers extract inputs before it
//! starts and the helper sidecar uploads outputs after the command exits.

/// Where the artifact PVC is mounted inside init and helper containers.
pub const ARTIFACTS_MOUNT_PATH: &str = "/artifacts";

/// Pod volume name of the artifact PVC.
pub const ARTIFACT_STORE_VOLUME: &str = "artifact-store";

/// PVC-relative key of the tar holding a volume's contents.
pub fn artifact_key(handle: &str) -> String {
    format!("artifacts/{handle}.tar")
}

/// Absolute path of the tar, as seen by a container mounting the PVC.
pub fn artifact_path(handle: &str) -> String {
    format!("{ARTIFACTS_MOUNT_PATH}/{}", artifact_key(handle))
}

/// Init-container argv extracting an input artifact into its destination.
/// A missing tar fails the extraction, and with it the step.
pub fn extract_command(handle: &str, destination: &str) -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        format!("tar xf {} -C {destination}", artifact_path(handle)),
    ]
}

/// Helper-container argv uploading a volume's contents onto the PVC.
pub fn upload_command(handle: &str, mount_path: &str) -> Vec<String> {
    vec![
        "tar".into(),
        "cf".into(),
        artifact_path(handle),
        "-C".into(),
        mount_path.into(),
        ".".into(),
    ]
}
