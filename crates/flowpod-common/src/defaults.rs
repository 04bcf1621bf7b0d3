//! Default workflow options
//!
//! Defaults come from two places: the operator environment (always present,
//! values may be empty) and a JSON document stored under `config.json` in a
//! namespace-scoped ConfigMap (optional). The stored document overrides the
//! environment.
//!
//! The override rule is asymmetric. Images are only replaced by non-empty
//! stored values, while secret names, the working volume claim and the
//! image-pull secrets are copied from the document even when empty.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::config::OperatorEnv;

/// Key of the stored defaults document inside its ConfigMap
pub const DEFAULTS_CONFIG_KEY: &str = "config.json";

/// Resolved default options used to fill in the blanks of a Workflow
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultWorkflowOptions {
    /// Image for the package-fetch init container
    pub git_sync_image: String,
    /// Image for the monitor sidecar
    pub workflow_monitoring_image: String,
    /// Image for the bucket-fetch init container
    pub s3_fetch_files_image: String,
    /// Image for the primary launcher container
    pub flow_image: String,
    /// Image-pull secrets attached to workflow pods
    pub image_pull_secrets: Vec<String>,
    /// Claim name of the default working volume
    pub working_volume: String,
    /// Secret with the SSH key for `git@` packages
    pub git_secret: String,
    /// Secret with the OAuth token for `https` packages
    pub git_secret_oauth: String,
}

impl DefaultWorkflowOptions {
    /// Defaults derived from the operator environment alone
    pub fn from_env(env: &OperatorEnv) -> Self {
        Self {
            git_sync_image: env.git_sync_image.clone(),
            workflow_monitoring_image: env.workflow_monitoring_image.clone(),
            s3_fetch_files_image: env.s3_fetch_files_image.clone(),
            flow_image: env.flow_image.clone(),
            ..Default::default()
        }
    }
}

/// Stored defaults document, as found under `config.json`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoredDefaults {
    /// Launcher image
    #[serde(default, deserialize_with = "null_as_default")]
    pub image: String,
    /// SSH key secret
    #[serde(default, deserialize_with = "null_as_default", rename = "gitsecret")]
    pub git_secret: String,
    /// OAuth token secret
    #[serde(default, deserialize_with = "null_as_default", rename = "gitsecret-oauth")]
    pub git_secret_oauth: String,
    /// Default working volume claim
    #[serde(default, deserialize_with = "null_as_default", rename = "workingVolume")]
    pub working_volume: String,
    /// Legacy input data directory; kept for document compatibility, unused
    #[serde(default, deserialize_with = "null_as_default", rename = "inputdatadir")]
    pub input_data_dir: String,
    /// Bucket-fetch image
    #[serde(default, deserialize_with = "null_as_default", rename = "s3-fetch-files-image")]
    pub s3_fetch_files_image: String,
    /// Package-fetch image
    #[serde(default, deserialize_with = "null_as_default", rename = "git-sync-image")]
    pub git_sync_image: String,
    /// Monitor sidecar image
    #[serde(default, deserialize_with = "null_as_default", rename = "workflow-monitoring-image")]
    pub workflow_monitoring_image: String,
    /// Image-pull secrets
    #[serde(default, deserialize_with = "null_as_default", rename = "imagePullSecrets")]
    pub image_pull_secrets: Vec<String>,
}

/// Resolve default options from the environment and an optional stored document.
///
/// `document` is the raw `config.json` text, or `None` when the ConfigMap or
/// the key could not be read. An unparsable document is logged and ignored,
/// leaving the environment-only defaults.
pub fn resolve_defaults(env: &OperatorEnv, document: Option<&str>) -> DefaultWorkflowOptions {
    let mut options = DefaultWorkflowOptions::from_env(env);

    let Some(raw) = document else {
        debug!(
            config_map = %env.config_map_name,
            "no stored defaults document, using environment defaults"
        );
        return options;
    };

    let stored: StoredDefaults = match serde_json::from_str(raw) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(
                config_map = %env.config_map_name,
                error = %e,
                "unable to parse stored defaults document, using environment defaults"
            );
            return options;
        }
    };

    override_if_set(&mut options.flow_image, stored.image);
    override_if_set(&mut options.git_sync_image, stored.git_sync_image);
    override_if_set(&mut options.s3_fetch_files_image, stored.s3_fetch_files_image);
    override_if_set(
        &mut options.workflow_monitoring_image,
        stored.workflow_monitoring_image,
    );

    options.git_secret = stored.git_secret;
    options.git_secret_oauth = stored.git_secret_oauth;
    options.working_volume = stored.working_volume;
    options.image_pull_secrets = stored.image_pull_secrets;

    options
}

/// `null` reads as the type's default, like a missing key
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn override_if_set(field: &mut String, value: String) {
    if !value.is_empty() {
        *field = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> OperatorEnv {
        OperatorEnv {
            git_sync_image: "env/git-sync:1".to_string(),
            workflow_monitoring_image: "env/monitor:1".to_string(),
            s3_fetch_files_image: "env/s3:1".to_string(),
            flow_image: "env/flow:1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_document_keeps_environment() {
        let options = resolve_defaults(&env(), None);
        assert_eq!(options, DefaultWorkflowOptions::from_env(&env()));
        assert!(options.image_pull_secrets.is_empty());
        assert!(options.git_secret.is_empty());
    }

    #[test]
    fn unparsable_document_keeps_environment() {
        let options = resolve_defaults(&env(), Some("{not json"));
        assert_eq!(options, DefaultWorkflowOptions::from_env(&env()));
    }

    #[test]
    fn stored_images_override_when_non_empty() {
        let doc = r#"{
            "image": "cm/flow:2",
            "git-sync-image": "cm/git-sync:2",
            "s3-fetch-files-image": "",
            "workflow-monitoring-image": "cm/monitor:2"
        }"#;
        let options = resolve_defaults(&env(), Some(doc));
        assert_eq!(options.flow_image, "cm/flow:2");
        assert_eq!(options.git_sync_image, "cm/git-sync:2");
        assert_eq!(options.workflow_monitoring_image, "cm/monitor:2");
        // empty stored image keeps the environment value
        assert_eq!(options.s3_fetch_files_image, "env/s3:1");
    }

    #[test]
    fn stored_secrets_and_volume_are_copied() {
        let doc = r#"{
            "gitsecret": "ssh-key",
            "gitsecret-oauth": "oauth-token",
            "workingVolume": "workflow-pvc",
            "imagePullSecrets": ["registry-a", "registry-b"]
        }"#;
        let options = resolve_defaults(&env(), Some(doc));
        assert_eq!(options.git_secret, "ssh-key");
        assert_eq!(options.git_secret_oauth, "oauth-token");
        assert_eq!(options.working_volume, "workflow-pvc");
        assert_eq!(options.image_pull_secrets, vec!["registry-a", "registry-b"]);
        assert_eq!(options.flow_image, "env/flow:1");
    }

    #[test]
    fn empty_stored_image_list_clears_pull_secrets() {
        let options = resolve_defaults(
            &env(),
            Some(r#"{"gitsecret": "", "imagePullSecrets": []}"#),
        );
        assert_eq!(options.git_secret, "");
        assert!(options.image_pull_secrets.is_empty());
        assert_eq!(options.git_sync_image, "env/git-sync:1");
    }

    #[test]
    fn null_fields_keep_the_rest_of_the_document() {
        let doc = r#"{
            "image": "cm/flow:2",
            "gitsecret": "ssh-key",
            "gitsecret-oauth": null,
            "workingVolume": null,
            "imagePullSecrets": null
        }"#;
        let options = resolve_defaults(&env(), Some(doc));
        assert_eq!(options.flow_image, "cm/flow:2");
        assert_eq!(options.git_secret, "ssh-key");
        assert_eq!(options.git_secret_oauth, "");
        assert_eq!(options.working_volume, "");
        assert!(options.image_pull_secrets.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let options = resolve_defaults(&env(), Some(r#"{"somethingElse": 1, "image": "x"}"#));
        assert_eq!(options.flow_image, "x");
    }
}
