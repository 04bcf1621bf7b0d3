//! Compiled execution plan for a Workflow
//!
//! An [`ExecutionPlan`] is the fully resolved pod for one Workflow. It is
//! owned by the caller and converted to Kubernetes objects on demand.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, LocalObjectReference, Pod, PodSecurityContext, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::error::ManifestError;

/// Key of the rendered pod inside the config ConfigMap
pub const CONFIG_FILE_KEY: &str = "flow-k8s-conf.yml";

/// Name of the ConfigMap holding the rendered config for `workflow`
pub fn config_map_name(workflow: &str) -> String {
    format!("{workflow}-config")
}

/// Pod-level settings that do not depend on the package source
#[derive(Clone, Debug, PartialEq)]
pub struct PodSettings {
    pub service_account_name: String,
    pub restart_policy: String,
    pub termination_grace_period_seconds: i64,
    pub security_context: PodSecurityContext,
    pub image_pull_secrets: Vec<String>,
}

/// Everything needed to run one Workflow as a pod
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub owner_reference: Option<OwnerReference>,
    /// Package-fetch, then bucket-fetch, each only when needed
    pub init_containers: Vec<Container>,
    pub primary: Container,
    pub monitor: Container,
    pub volumes: Vec<Volume>,
    pub settings: PodSettings,
}

impl ExecutionPlan {
    fn metadata(&self, name: String, labels: Option<BTreeMap<String, String>>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: self.namespace.clone(),
            labels,
            owner_references: self.owner_reference.clone().map(|r| vec![r]),
            ..Default::default()
        }
    }

    /// The workflow pod
    pub fn to_pod(&self) -> Pod {
        let image_pull_secrets = (!self.settings.image_pull_secrets.is_empty()).then(|| {
            self.settings
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        });

        Pod {
            metadata: self.metadata(self.name.clone(), Some(self.labels.clone())),
            spec: Some(PodSpec {
                service_account_name: Some(self.settings.service_account_name.clone()),
                restart_policy: Some(self.settings.restart_policy.clone()),
                termination_grace_period_seconds: Some(
                    self.settings.termination_grace_period_seconds,
                ),
                security_context: Some(self.settings.security_context.clone()),
                image_pull_secrets,
                init_containers: (!self.init_containers.is_empty())
                    .then(|| self.init_containers.clone()),
                containers: vec![self.primary.clone(), self.monitor.clone()],
                volumes: Some(self.volumes.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// YAML rendering of the pod, mounted into the primary and monitor
    /// containers as their runtime configuration
    pub fn render_config(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(&self.to_pod())?)
    }

    /// ConfigMap carrying [`render_config`](Self::render_config) under [`CONFIG_FILE_KEY`]
    pub fn config_map(&self) -> Result<ConfigMap, ManifestError> {
        let rendered = self.render_config()?;
        Ok(ConfigMap {
            metadata: self.metadata(config_map_name(&self.name), None),
            data: Some(BTreeMap::from([(CONFIG_FILE_KEY.to_string(), rendered)])),
            ..Default::default()
        })
    }
}
