//! Workflow-specific error types

/// Reasons a Workflow cannot be compiled into a pod.
///
/// All of these need a change to the Workflow (or the stored defaults) to
/// go away, so none are retried.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("conflicting workflow spec: {message}")]
    SpecConflict { message: String },

    #[error("incomplete workflow spec: {message}")]
    SpecIncomplete { message: String },

    #[error("malformed package url '{url}': {reason}")]
    MalformedUrl { url: String, reason: String },

    #[error("failed to render workflow config: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

impl ManifestError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::SpecConflict {
            message: message.into(),
        }
    }

    pub fn incomplete(message: impl Into<String>) -> Self {
        Self::SpecIncomplete {
            message: message.into(),
        }
    }

    pub fn malformed_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("missing namespace on Workflow")]
    MissingNamespace,
}

impl WorkflowError {
    /// Whether requeueing without a spec change could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Manifest(e) => e.is_retryable(),
            WorkflowError::Kube(_) => true,
            WorkflowError::MissingNamespace => false,
        }
    }
}
