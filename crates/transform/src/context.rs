use std::time::Instant;

use cairn_core::{CairnError, Cluster, ClusterDefinition, ClusterVersion, ObservedState, Result};
use tokio_util::sync::CancellationToken;

/// Everything one reconcile cycle knows about a cluster.
///
/// Templates and the observed snapshot are fixed for the cycle. The Cluster
/// itself is a working copy: transformers may change its finalizers, labels
/// and status, and the driver writes those back after comparing against
/// [`TransformContext::original`].
#[derive(Debug, Clone)]
pub struct TransformContext {
    cluster: Cluster,
    original: Cluster,
    definition: Option<ClusterDefinition>,
    version: Option<ClusterVersion>,
    observed: ObservedState,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl TransformContext {
    pub fn new(cluster: Cluster, observed: ObservedState) -> Self {
        Self {
            original: cluster.clone(),
            cluster,
            definition: None,
            version: None,
            observed,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_definition(mut self, definition: Option<ClusterDefinition>) -> Self {
        self.definition = definition;
        self
    }

    pub fn with_version(mut self, version: Option<ClusterVersion>) -> Self {
        self.version = version;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cluster(&self) -> &Cluster { &self.cluster }
    pub fn cluster_mut(&mut self) -> &mut Cluster { &mut self.cluster }
    /// The Cluster as read at the start of the cycle.
    pub fn original(&self) -> &Cluster { &self.original }
    pub fn definition(&self) -> Option<&ClusterDefinition> { self.definition.as_ref() }
    pub fn version(&self) -> Option<&ClusterVersion> { self.version.as_ref() }
    pub fn observed(&self) -> &ObservedState { &self.observed }
    pub fn cancellation(&self) -> &CancellationToken { &self.cancel }
    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn require_definition(&self) -> Result<&ClusterDefinition> {
        self.definition.as_ref().ok_or_else(|| {
            CairnError::Transform(format!("ClusterDefinition {} not found", self.cluster.spec.cluster_definition_ref))
        })
    }

    pub fn require_version(&self) -> Result<&ClusterVersion> {
        self.version.as_ref().ok_or_else(|| {
            CairnError::Transform(format!("ClusterVersion {} not found", self.cluster.spec.cluster_version_ref))
        })
    }

    /// True once the caller cancelled the cycle or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Finalizers or labels differ from what was read.
    pub fn metadata_changed(&self) -> bool {
        self.cluster.metadata.finalizers != self.original.metadata.finalizers
            || self.cluster.metadata.labels != self.original.metadata.labels
    }

    pub fn status_changed(&self) -> bool {
        self.cluster.status != self.original.status
    }

    pub fn into_cluster(self) -> Cluster { self.cluster }
}
