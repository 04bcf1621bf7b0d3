//! Spec normalization before compilation
//!
//! Three passes run over a private copy of the WorkflowSpec, in this order:
//! [`apply_defaults`], [`migrate_deprecated`], [`rewrite_paths`]. After them
//! the compiler only sees the current field layout with absolute paths.

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource, Volume, VolumeMount,
};
use tracing::{debug, warn};

use flowpod_common::crd::{non_empty, WorkflowSpec};
use flowpod_common::defaults::DefaultWorkflowOptions;

use crate::source::PackageSourceKind;

/// Directory holding inputs, data and variables delivered through a volume
pub const INPUT_DIR: &str = "/tmp/inputdir";
/// Root directory the bucket-fetch container downloads into
pub const S3_ROOT_DIR: &str = "/tmp/s3-root-dir";
/// Volume name of the default working volume
pub const WORKING_VOLUME_NAME: &str = "working-volume";

/// Directory that bucket-fetched input files land in
pub fn s3_input_dir() -> String {
    format!("{S3_ROOT_DIR}/input")
}

/// Directory that bucket-fetched data files land in
pub fn s3_data_dir() -> String {
    format!("{S3_ROOT_DIR}/data")
}

/// Fill the blanks of `spec` from the resolved defaults.
///
/// The package secret default depends on the source: SSH packages get the
/// key secret, https packages the OAuth token secret. A spec with no working
/// volume and no default claim gets an emptyDir so the pod stays valid.
pub fn apply_defaults(
    spec: &mut WorkflowSpec,
    defaults: &DefaultWorkflowOptions,
    kind: PackageSourceKind,
) {
    if non_empty(&spec.s3_fetch_files_image).is_none() {
        debug!(image = %defaults.s3_fetch_files_image, "defaulting s3FetchFilesImage");
        spec.s3_fetch_files_image = Some(defaults.s3_fetch_files_image.clone());
    }

    if non_empty(&spec.image).is_none() {
        debug!(image = %defaults.flow_image, "defaulting image");
        spec.image = Some(defaults.flow_image.clone());
    }

    if let Some(package) = spec.package.as_mut() {
        if non_empty(&package.git_secret).is_none() {
            let secret = match kind {
                PackageSourceKind::Ssh => Some(&defaults.git_secret),
                PackageSourceKind::Https => Some(&defaults.git_secret_oauth),
                _ => None,
            };
            if let Some(secret) = secret.filter(|s| !s.is_empty()) {
                debug!(secret = %secret, source = %kind, "defaulting package.gitsecret");
                package.git_secret = Some(secret.clone());
            }
        }
    }

    if spec.image_pull_secrets.is_empty() && !defaults.image_pull_secrets.is_empty() {
        debug!(secrets = ?defaults.image_pull_secrets, "defaulting imagePullSecrets");
        spec.image_pull_secrets = defaults.image_pull_secrets.clone();
    }

    let has_working_volume = spec
        .working_volume
        .as_ref()
        .is_some_and(|v| !v.name.is_empty());
    if !has_working_volume {
        if defaults.working_volume.is_empty() {
            warn!("no working volume configured, using an emptyDir");
            spec.working_volume = Some(Volume {
                name: WORKING_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        } else {
            debug!(claim = %defaults.working_volume, "defaulting workingVolume");
            spec.working_volume = Some(Volume {
                name: WORKING_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: defaults.working_volume.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            });
        }
    }
}

/// Fold the deprecated `inputDataVolume` into `volumes` and `volumeMounts`.
///
/// The volume is mounted at [`INPUT_DIR`] on the primary container. Running
/// this twice is the same as running it once.
pub fn migrate_deprecated(spec: &mut WorkflowSpec) {
    let Some(volume) = spec.input_data_volume.take_if(|v| !v.name.is_empty()) else {
        return;
    };

    debug!(volume = %volume.name, "migrating inputDataVolume");
    spec.volume_mounts.push(VolumeMount {
        name: volume.name.clone(),
        mount_path: INPUT_DIR.to_string(),
        ..Default::default()
    });
    spec.volumes.push(volume);
}

/// Make every input, data and variable reference absolute.
///
/// Relative references are prefixed with their delivery directory: the
/// bucket-fetch directories when the Workflow reads from S3, otherwise
/// [`INPUT_DIR`]. Variables always come from [`INPUT_DIR`]. The raw escaped
/// text is prefixed as-is.
pub fn rewrite_paths(spec: &mut WorkflowSpec) {
    let (input_root, data_root) = if spec.s3_bucket_input.is_some() {
        (s3_input_dir(), s3_data_dir())
    } else {
        (INPUT_DIR.to_string(), INPUT_DIR.to_string())
    };

    make_absolute(&mut spec.inputs, &input_root);
    make_absolute(&mut spec.data, &data_root);
    make_absolute(&mut spec.variables, INPUT_DIR);
}

fn make_absolute(paths: &mut [String], root: &str) {
    for path in paths.iter_mut().filter(|p| !p.starts_with('/')) {
        *path = format!("{root}/{path}");
    }
}
