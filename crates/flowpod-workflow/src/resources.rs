//! Container resource requirements
//!
//! Every container in a workflow pod requests exactly what it is limited to.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use flowpod_common::crd::{non_empty, ResourceDefinition, ResourceOverrides};

/// Container roles with their own resource defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceRole {
    /// Package-fetch and bucket-fetch init containers
    PackageFetch,
    /// Monitor sidecar
    Monitor,
    /// Primary launcher container
    Launcher,
}

impl ResourceRole {
    /// Default (cpu, memory) for the role
    pub fn defaults(&self) -> (&'static str, &'static str) {
        match self {
            ResourceRole::PackageFetch | ResourceRole::Monitor => ("100m", "200Mi"),
            ResourceRole::Launcher => ("1000m", "500Mi"),
        }
    }

    fn override_from<'a>(&self, overrides: &'a ResourceOverrides) -> Option<&'a ResourceDefinition> {
        match self {
            ResourceRole::PackageFetch => overrides.git_fetch.as_ref(),
            ResourceRole::Monitor => overrides.monitor.as_ref(),
            ResourceRole::Launcher => overrides.elaunch_primary.as_ref(),
        }
    }
}

/// Resource requirements for `role`, with cpu and memory overridden
/// independently by the Workflow
pub fn requirements(role: ResourceRole, overrides: Option<&ResourceOverrides>) -> ResourceRequirements {
    let (mut cpu, mut memory) = role.defaults();

    if let Some(def) = overrides.and_then(|o| role.override_from(o)) {
        if let Some(value) = non_empty(&def.cpu) {
            cpu = value;
        }
        if let Some(value) = non_empty(&def.memory) {
            memory = value;
        }
    }

    let list = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ]);

    ResourceRequirements {
        limits: Some(list.clone()),
        requests: Some(list),
        ..Default::default()
    }
}
