//! Workflow CRD types
//!
//! A `Workflow` describes one run of a workflow package: where to fetch the
//! package from (a git remote, an inline ConfigMap, a path on a volume, or an
//! existing instance directory), which input/variable/data files to hand to
//! the launcher, and the volumes and resources the run needs.
//!
//! The operator compiles each pending Workflow into a single Pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, Volume, VolumeMount};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Package
// =============================================================================

/// Location of the workflow package.
///
/// At most one of `url`, `fromConfigMap` and `fromPath` selects the package
/// source; `fromPath` may additionally narrow a git checkout to a
/// sub-directory.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageRef {
    /// Git remote, `https://...` or `git@...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Branch to check out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Commit to check out; used when no branch is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,

    /// Where the package is mounted in the primary container (default `/mnt/package`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,

    /// Secret with git credentials (SSH key or OAuth token)
    #[serde(default, rename = "gitsecret", skip_serializing_if = "Option::is_none")]
    pub git_secret: Option<String>,

    /// ConfigMap holding an inline package definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_config_map: Option<String>,

    /// Package path, absolute or relative to the fetched package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<String>,

    /// Manifest file, absolute or relative to the package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_manifest: Option<String>,
}

// =============================================================================
// Resources
// =============================================================================

/// CPU and memory for one container; each is independently optional
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceDefinition {
    /// CPU quantity, e.g. `500m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity, e.g. `1Gi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Per-role resource overrides for the containers of a workflow pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrides {
    /// Primary launcher container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elaunch_primary: Option<ResourceDefinition>,

    /// Monitor sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<ResourceDefinition>,

    /// Package-fetch and bucket-fetch init containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_fetch: Option<ResourceDefinition>,
}

// =============================================================================
// S3 bucket input
// =============================================================================

/// One S3 credential: a literal value or a reference, never both
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3InputVariable {
    /// Literal value; `$(VAR)` references are expanded by the kubelet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Source for the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

impl S3InputVariable {
    /// Whether either the value or the reference is set
    pub fn is_set(&self) -> bool {
        non_empty(&self.value).is_some() || self.value_from.is_some()
    }
}

/// Fetch input and data files from an S3 bucket instead of a ConfigMap.
///
/// Either `dataset` names a Secret holding the five credential keys, or the
/// credentials are given individually.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3BucketInput {
    /// Secret holding `accessKeyID`, `secretAccessKey`, `endpoint`, `bucket` and `region`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,

    /// Access key id
    #[serde(default, rename = "accessKeyID")]
    pub access_key_id: S3InputVariable,

    /// Secret access key
    #[serde(default)]
    pub secret_access_key: S3InputVariable,

    /// Endpoint URL
    #[serde(default)]
    pub endpoint: S3InputVariable,

    /// Bucket name
    #[serde(default)]
    pub bucket: S3InputVariable,

    /// Region
    #[serde(default)]
    pub region: S3InputVariable,
}

// =============================================================================
// CRD
// =============================================================================

/// A single workflow run
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "flowpod.dev",
    version = "v1alpha1",
    kind = "Workflow",
    plural = "workflows",
    shortname = "wf",
    namespaced,
    status = "WorkflowStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.experimentstate"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// Launcher image; blank uses the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Secrets used as imagePullSecrets by the workflow pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Package to run; mutually exclusive with `instance`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageRef>,

    /// Existing instance directory under the working volume; mutually exclusive with `package`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,

    /// Print the launcher command line instead of running it
    #[serde(default)]
    pub debug: bool,

    /// Launcher executable; blank uses `elaunch.py`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Volumes for the workflow pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Mounts for the primary container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Volume hosting the instance directory; blank uses the default claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_volume: Option<Volume>,

    /// Deprecated: volume mounted at `/tmp/inputdir`, migrated into `volumes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data_volume: Option<Volume>,

    /// Input files, `path[:rename]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,

    /// Variable files, `path[:rename]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<String>,

    /// Data files, `path[:rename]`; must already exist in the package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<String>,

    /// Extra launcher arguments, passed verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_options: Vec<String>,

    /// Resource overrides for the pod's containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceOverrides>,

    /// Environment variables for the primary and monitor containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Fetch inputs and data from an S3 bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_bucket_input: Option<S3BucketInput>,

    /// Bucket-fetch image; blank uses the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_fetch_files_image: Option<String>,
}

/// Progress of a Workflow, written by the monitor sidecar
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct WorkflowStatus {
    /// Accumulated cost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<String>,
    /// Stage currently executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currentstage: Option<String>,
    /// Exit status of the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitstatus: Option<String>,
    /// Overall state of the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimentstate: Option<String>,
    /// Progress of the current stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stageprogress: Option<String>,
    /// State of the current stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stagestate: Option<String>,
    /// Error description, when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errordescription: Option<String>,
    /// Stage names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<String>,
    /// Overall progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totalprogress: Option<String>,
    /// Last time the monitor updated the status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    /// Output files by component
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputfiles: BTreeMap<String, BTreeMap<String, String>>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

impl Workflow {
    /// Whether the monitor has already reported on this Workflow.
    ///
    /// A Workflow that has run once is never given a new pod.
    pub fn has_run(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| non_empty(&s.updated))
            .is_some()
    }
}

/// Treat an empty string the same as an absent one
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// =============================================================================
// Tests
// =============================================================================
