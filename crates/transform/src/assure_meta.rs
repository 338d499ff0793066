use cairn_core::{labels, Result};
use cairn_graph::Graph;
use tracing::debug;

use crate::{TransformContext, Transformer};

/// Keeps the Cluster's own metadata in shape: the finalizer that guards
/// deletion, and the definition/version labels users must not edit.
/// Works on the Cluster itself, never on the graph.
pub struct AssureMetaTransformer;

impl Transformer for AssureMetaTransformer {
    fn name(&self) -> &'static str { "assure-meta" }

    fn transform(&self, ctx: &mut TransformContext, _dag: &mut Graph) -> Result<()> {
        let cluster = ctx.cluster_mut();

        // The platform refuses new finalizers on an object already being deleted.
        if !cluster.is_deleting() && cluster.add_finalizer(labels::CLUSTER_FINALIZER) {
            debug!(cluster = %cluster.key(), "finalizer added");
        }

        let cd = cluster.spec.cluster_definition_ref.clone();
        let cv = cluster.spec.cluster_version_ref.clone();
        if cluster.label(labels::CLUSTER_DEF) == Some(cd.as_str()) && cluster.label(labels::CLUSTER_VERSION) == Some(cv.as_str()) {
            return Ok(());
        }
        let l = cluster.labels_mut();
        l.insert(labels::CLUSTER_DEF.to_string(), cd);
        l.insert(labels::CLUSTER_VERSION.to_string(), cv);
        Ok(())
    }
}
