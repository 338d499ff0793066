//! Cairn transform: the per-cycle context, the transformer contract and the
//! fixed pipeline that derives the desired graph from a Cluster.

#![forbid(unsafe_code)]

use cairn_core::{CairnError, Result};
use cairn_graph::Graph;
use tracing::{debug, debug_span};

mod assure_meta;
mod component;
mod context;
mod credential;
mod deletion;
pub mod objects;
mod prune;
mod status;

pub use assure_meta::AssureMetaTransformer;
pub use component::ComponentTransformer;
pub use context::TransformContext;
pub use credential::CredentialTransformer;
pub use deletion::DeletionTransformer;
pub use prune::PruneTransformer;
pub use status::StatusTransformer;

/// One reconciliation concern. Implementations do no I/O: everything they
/// read comes from the context, everything they produce goes into the graph
/// or the context's working Cluster. Running a transformer twice on the same
/// inputs must produce the same result.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;
    fn transform(&self, ctx: &mut TransformContext, dag: &mut Graph) -> Result<()>;
}

/// Ordered, fixed composition of transformers over one graph.
pub struct Pipeline {
    transformers: Vec<Box<dyn Transformer>>,
}

impl Pipeline {
    pub fn new(transformers: Vec<Box<dyn Transformer>>) -> Self {
        Self { transformers }
    }

    /// The Cluster pipeline. Order matters: metadata first (finalizer before
    /// any child exists), derivation before pruning and deletion, which only
    /// see a complete graph, and status last.
    pub fn cluster_default() -> Self {
        Self::new(vec![
            Box::new(AssureMetaTransformer),
            Box::new(CredentialTransformer),
            Box::new(ComponentTransformer),
            Box::new(PruneTransformer),
            Box::new(DeletionTransformer),
            Box::new(StatusTransformer),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transformers.iter().map(|t| t.name()).collect()
    }

    /// Run every transformer in order, stopping at the first error, which
    /// comes back tagged with the failing transformer's name.
    pub fn run(&self, ctx: &mut TransformContext, dag: &mut Graph) -> Result<()> {
        for t in &self.transformers {
            if ctx.is_cancelled() {
                return Err(CairnError::Cancelled);
            }
            let _span = debug_span!("transform", transformer = t.name()).entered();
            let before = dag.len();
            t.transform(ctx, dag).map_err(|e| CairnError::Pipeline { transformer: t.name(), source: Box::new(e) })?;
            debug!(nodes = dag.len(), added = dag.len() - before, "transformer done");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{Cluster, ClusterSpec, ObjectKey, ObservedState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct AddNode(&'static str, Arc<AtomicUsize>);
    struct Fail;

    impl Transformer for AddNode {
        fn name(&self) -> &'static str { self.0 }
        fn transform(&self, _ctx: &mut TransformContext, dag: &mut Graph) -> Result<()> {
            self.1.fetch_add(1, Ordering::SeqCst);
            dag.add_or_update_node(ObjectKey::namespaced("ConfigMap", "ns", self.0), Some(serde_json::json!({})));
            Ok(())
        }
    }

    impl Transformer for Fail {
        fn name(&self) -> &'static str { "fail" }
        fn transform(&self, _ctx: &mut TransformContext, _dag: &mut Graph) -> Result<()> {
            Err(CairnError::Transform("template missing".into()))
        }
    }

    fn ctx() -> TransformContext {
        let cluster = Cluster { metadata: Default::default(), spec: ClusterSpec::default(), status: None };
        TransformContext::new(cluster, ObservedState::new())
    }

    #[test]
    fn pipeline_stops_at_first_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = Pipeline::new(vec![
            Box::new(AddNode("first", calls.clone())),
            Box::new(Fail),
            Box::new(AddNode("third", calls.clone())),
        ]);
        let mut dag = Graph::new();
        let err = p.run(&mut ctx(), &mut dag).unwrap_err();
        match &err {
            CairnError::Pipeline { transformer, source } => {
                assert_eq!(*transformer, "fail");
                assert!(matches!(**source, CairnError::Transform(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dag.len(), 1);
        assert!(dag.contains(&ObjectKey::namespaced("ConfigMap", "ns", "first")));
    }

    #[test]
    fn cancelled_context_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = Pipeline::new(vec![Box::new(AddNode("first", calls.clone()))]);
        let mut c = ctx();
        c.cancellation().cancel();
        assert!(matches!(p.run(&mut c, &mut Graph::new()), Err(CairnError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_order_is_fixed() {
        assert_eq!(
            Pipeline::cluster_default().names(),
            vec!["assure-meta", "credential", "component", "prune", "deletion", "status"]
        );
    }
}
