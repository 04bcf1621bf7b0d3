//! Custom Resource Definitions for flowpod

mod workflow;

pub use workflow::{
    non_empty, PackageRef, ResourceDefinition, ResourceOverrides, S3BucketInput, S3InputVariable,
    Workflow, WorkflowSpec, WorkflowStatus,
};
