//! Workflow compiler and controller
//!
//! Compiles a `Workflow` into the Pod that fetches its package and runs it:
//! - `source` classifies where the package comes from
//! - `migrate` fills defaults and upgrades deprecated fields
//! - `fetch` renders the package-fetch commands
//! - `compiler` assembles the containers, volumes and pod settings into an
//!   [`plan::ExecutionPlan`]
//! - `controller` creates the plan's ConfigMap and Pod

pub mod compiler;
pub mod controller;
pub mod error;
pub mod fetch;
pub mod migrate;
pub mod plan;
pub mod resources;
pub mod source;

pub use compiler::ManifestCompiler;
pub use error::{ManifestError, WorkflowError};
pub use plan::ExecutionPlan;
pub use source::{PackageSource, PackageSourceKind};
