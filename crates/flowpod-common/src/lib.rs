//! Common types for flowpod: the Workflow CRD, operator configuration,
//! default options, the file reference codec and shared utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod defaults;
pub mod events;
pub mod paths;
pub mod telemetry;

/// Name of the field manager used for server-side writes
pub const FIELD_MANAGER: &str = "flowpod-operator";
