use std::collections::BTreeSet;

use cairn_core::{labels, ObjectKey, Result, TerminationPolicy};
use cairn_graph::{Graph, NodeHints};
use tracing::{debug, info, warn};

use crate::prune::link_removals;
use crate::{TransformContext, Transformer};

/// Tears a Cluster down once it is marked for deletion, honouring its
/// termination policy, and releases the finalizer when nothing it removes is
/// still observed.
pub struct DeletionTransformer;

impl Transformer for DeletionTransformer {
    fn name(&self) -> &'static str { "deletion" }

    fn transform(&self, ctx: &mut TransformContext, dag: &mut Graph) -> Result<()> {
        if !ctx.cluster().is_deleting() {
            return Ok(());
        }
        let policy = ctx.cluster().spec.termination_policy;
        if policy == TerminationPolicy::DoNotTerminate {
            warn!(cluster = %ctx.cluster().key(), "deletion blocked by termination policy DoNotTerminate");
            return Ok(());
        }

        let candidates: BTreeSet<ObjectKey> = dag.keys().chain(ctx.observed().owned_keys()).cloned().collect();
        let mut removing = Vec::new();
        let mut inserted = Vec::new();
        for key in candidates {
            if policy.removes(&key.kind) {
                if !dag.contains(&key) {
                    inserted.push(key.clone());
                }
                removing.push(key);
            } else if dag.contains(&key) {
                dag.set_hints(&key, NodeHints { adopt_only: true })?;
            }
        }
        for key in &removing {
            dag.remove_node(key.clone());
        }
        link_removals(ctx, dag, &inserted)?;

        let pending = removing.iter().filter(|k| ctx.observed().contains(k)).count();
        if pending > 0 {
            debug!(cluster = %ctx.cluster().key(), pending, ?policy, "waiting for owned objects to go away");
            return Ok(());
        }
        let key = ctx.cluster().key();
        if ctx.cluster_mut().remove_finalizer(labels::CLUSTER_FINALIZER) {
            info!(cluster = %key, ?policy, "owned objects gone; finalizer released");
        }
        Ok(())
    }
}
