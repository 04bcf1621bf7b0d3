//! Operator environment
//!
//! The operator is configured through environment variables set on its
//! Deployment. They are captured once into [`OperatorEnv`] and passed to
//! the default options resolver and the manifest compiler explicitly, so
//! neither reads process state.

use tracing::warn;

/// Environment variable holding the package-fetch (git-sync) image
pub const ENV_GIT_SYNC_IMAGE: &str = "GIT_SYNC_IMAGE";
/// Environment variable holding the monitor sidecar image
pub const ENV_WORKFLOW_MONITORING_IMAGE: &str = "WORKFLOW_MONITORING_IMAGE";
/// Environment variable holding the bucket-fetch image
pub const ENV_S3_FETCH_FILES_IMAGE: &str = "S3_FETCH_FILES_IMAGE";
/// Environment variable holding the launcher image
pub const ENV_FLOW_IMAGE: &str = "FLOW_IMAGE";
/// Environment variable holding the UID containers run as
pub const ENV_USER_ID: &str = "USER_ID";
/// Environment variable holding the GID the pod runs as
pub const ENV_GROUP_ID: &str = "GROUP_ID";
/// Environment variable holding the pod filesystem group
pub const ENV_FSGROUP: &str = "FSGROUP";
/// Environment variable overriding the pod service account
pub const ENV_SERVICE_ACCOUNT_NAME: &str = "SERVICE_ACCOUNT_NAME";
/// Environment variable naming the ConfigMap with stored default options
pub const ENV_CONFIGMAP_NAME: &str = "CONFIGMAP_NAME";

/// Default service account for workflow pods
pub const DEFAULT_SERVICE_ACCOUNT: &str = "workflow-operator";
/// Default name of the ConfigMap holding stored default options
pub const DEFAULT_CONFIGMAP_NAME: &str = "workflow-runtime-service";
/// Default filesystem group; pods read and write PVC folders with this gid
pub const DEFAULT_FSGROUP: i64 = 5000;

/// Process-wide settings captured from the operator's environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorEnv {
    /// Package-fetch image (may be empty)
    pub git_sync_image: String,
    /// Monitor sidecar image (may be empty)
    pub workflow_monitoring_image: String,
    /// Bucket-fetch image (may be empty)
    pub s3_fetch_files_image: String,
    /// Launcher image (may be empty)
    pub flow_image: String,
    /// UID for the pod and the init containers
    pub user_id: i64,
    /// GID for the pod
    pub group_id: i64,
    /// Filesystem group for the pod
    pub fs_group: i64,
    /// Service account the workflow pod runs as
    pub service_account_name: String,
    /// Name of the ConfigMap holding stored default options
    pub config_map_name: String,
}

impl Default for OperatorEnv {
    fn default() -> Self {
        Self {
            git_sync_image: String::new(),
            workflow_monitoring_image: String::new(),
            s3_fetch_files_image: String::new(),
            flow_image: String::new(),
            user_id: 0,
            group_id: 0,
            fs_group: DEFAULT_FSGROUP,
            service_account_name: DEFAULT_SERVICE_ACCOUNT.to_string(),
            config_map_name: DEFAULT_CONFIGMAP_NAME.to_string(),
        }
    }
}

impl OperatorEnv {
    /// Capture settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Capture settings from an arbitrary key lookup.
    ///
    /// Missing images become empty strings. Missing or unparsable numeric
    /// ids fall back to their defaults. An empty `CONFIGMAP_NAME` keeps the
    /// default name; an empty `SERVICE_ACCOUNT_NAME` is taken as given.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let image = |key: &str| lookup(key).unwrap_or_default();

        Self {
            git_sync_image: image(ENV_GIT_SYNC_IMAGE),
            workflow_monitoring_image: image(ENV_WORKFLOW_MONITORING_IMAGE),
            s3_fetch_files_image: image(ENV_S3_FETCH_FILES_IMAGE),
            flow_image: image(ENV_FLOW_IMAGE),
            user_id: parse_id(&lookup, ENV_USER_ID, defaults.user_id),
            group_id: parse_id(&lookup, ENV_GROUP_ID, defaults.group_id),
            fs_group: parse_id(&lookup, ENV_FSGROUP, defaults.fs_group),
            service_account_name: lookup(ENV_SERVICE_ACCOUNT_NAME)
                .unwrap_or(defaults.service_account_name),
            config_map_name: lookup(ENV_CONFIGMAP_NAME)
                .filter(|name| !name.is_empty())
                .unwrap_or(defaults.config_map_name),
        }
    }
}

fn parse_id<F>(lookup: &F, key: &str, default: i64) -> i64
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, default, "ignoring unparsable id");
            default
        }),
        None => default,
    }
}
