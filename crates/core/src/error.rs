use thiserror::Error;

/// Error taxonomy of a reconcile cycle. Every variant is either retryable
/// (the driver requeues with backoff) or not (requeued only on change).
#[derive(Debug, Error)]
pub enum CairnError {
    /// Malformed input or a programming defect such as a cyclic edge.
    #[error("validation: {0}")]
    Validation(String),
    /// A transformer precondition is unmet, e.g. a referenced template is missing.
    #[error("transform: {0}")]
    Transform(String),
    /// Optimistic-concurrency mismatch against the platform.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// Transient I/O failure against the object store.
    #[error("platform: {0}")]
    Platform(String),
    #[error("partial apply: {failed} failed, {skipped} skipped; first error on {first_key}: {first_error}")]
    PartialApply {
        failed: usize,
        skipped: usize,
        first_key: String,
        first_error: Box<CairnError>,
    },
    #[error("transformer {transformer}: {source}")]
    Pipeline {
        transformer: &'static str,
        #[source]
        source: Box<CairnError>,
    },
    #[error("cycle cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, CairnError>;

impl CairnError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CairnError::Validation(_) => false,
            CairnError::Pipeline { source, .. } => source.is_retryable(),
            CairnError::Transform(_)
            | CairnError::Conflict(_)
            | CairnError::NotFound(_)
            | CairnError::Platform(_)
            | CairnError::PartialApply { .. }
            | CairnError::Cancelled => true,
        }
    }

    /// Short machine-friendly label, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CairnError::Validation(_) => "validation",
            CairnError::Transform(_) => "transform",
            CairnError::Conflict(_) => "conflict",
            CairnError::NotFound(_) => "not_found",
            CairnError::Platform(_) => "platform",
            CairnError::PartialApply { .. } => "partial_apply",
            CairnError::Pipeline { source, .. } => source.kind(),
            CairnError::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for CairnError {
    fn from(err: serde_json::Error) -> Self {
        CairnError::Validation(format!("serialization: {}", err))
    }
}
