//! Cairn apply: turns a sealed desired graph into ordered create, update and
//! delete calls against the object store, containing failures to the
//! subgraph that depends on them.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Instant;

use cairn_core::{CairnError, ObjectKey, ObjectStore, Result};
use cairn_graph::{Action, SealedGraph};
use cairn_transform::TransformContext;
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub mod diff;

pub use diff::{diff_summary, exact_diff, owned_diff, DiffSummary};

/// One resolved node, in topological order.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub key: ObjectKey,
    pub action: Action,
    #[serde(skip_serializing_if = "DiffSummary::is_empty")]
    pub diff: DiffSummary,
}

/// A graph whose every node carries its action.
#[derive(Debug)]
pub struct Plan {
    graph: SealedGraph,
    steps: Vec<PlanStep>,
}

impl Plan {
    pub fn graph(&self) -> &SealedGraph { &self.graph }
    pub fn steps(&self) -> &[PlanStep] { &self.steps }

    pub fn count(&self, action: Action) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Nothing to mutate: the live state already matches.
    pub fn is_noop(&self) -> bool { self.steps.iter().all(|s| s.action == Action::NoOp) }
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Mutations issued successfully, in issue order.
    pub applied: Vec<(ObjectKey, Action)>,
    /// The error of each failed node, in issue order.
    pub failed: Vec<(ObjectKey, CairnError)>,
    /// Nodes not attempted because a node they depend on failed.
    pub skipped: Vec<ObjectKey>,
    /// Nodes not attempted because the cycle was cancelled.
    pub aborted: Vec<ObjectKey>,
    pub unchanged: usize,
}

impl ApplyOutcome {
    pub fn is_complete(&self) -> bool { self.failed.is_empty() && self.aborted.is_empty() }

    /// Fold failures into the error the driver acts on.
    pub fn into_result(mut self) -> Result<Self> {
        if !self.failed.is_empty() {
            let failed = self.failed.len();
            let skipped = self.skipped.len();
            let (first_key, first_error) = self.failed.remove(0);
            return Err(CairnError::PartialApply {
                failed,
                skipped,
                first_key: first_key.to_string(),
                first_error: Box::new(first_error),
            });
        }
        if !self.aborted.is_empty() {
            return Err(CairnError::Cancelled);
        }
        Ok(self)
    }
}

/// Diffs a sealed graph against the context's observed snapshot and applies
/// the resulting actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self { Self }

    /// Resolve each node's action without touching the store.
    pub fn plan(&self, ctx: &TransformContext, mut graph: SealedGraph) -> Result<Plan> {
        let mut steps = Vec::with_capacity(graph.len());
        for key in graph.order().to_vec() {
            let (action, diff) = {
                let node = graph.node(&key).ok_or_else(|| CairnError::Validation(format!("unknown node {}", key)))?;
                resolve(node.desired(), ctx.observed().get(&key), node.hints().adopt_only, &key.kind)
            };
            graph.set_action(&key, action)?;
            steps.push(PlanStep { key, action, diff });
        }
        Ok(Plan { graph, steps })
    }

    /// Issue the plan's mutations: deletions first, dependents before what
    /// they depend on, then creates and updates in topological order.
    ///
    /// A failed create or update blocks every descendant; a failed delete
    /// blocks every ancestor. Independent branches still proceed. Once the
    /// cycle is cancelled, remaining mutations are reported as aborted.
    pub async fn apply<S>(&self, store: &S, ctx: &TransformContext, plan: &Plan) -> ApplyOutcome
    where
        S: ObjectStore + ?Sized,
    {
        let graph = &plan.graph;
        let mut out = ApplyOutcome::default();
        let mut blocked: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut cancelled = false;

        let deletes = plan.steps.iter().rev().filter(|s| s.action == Action::Delete);
        let writes = plan.steps.iter().filter(|s| matches!(s.action, Action::Create | Action::Update));
        out.unchanged = plan.count(Action::NoOp);

        for step in deletes.chain(writes) {
            let key = &step.key;
            if cancelled || ctx.is_cancelled() {
                cancelled = true;
                out.aborted.push(key.clone());
                continue;
            }
            if blocked.contains(key) {
                counter!("apply_skipped", 1u64);
                out.skipped.push(key.clone());
                continue;
            }

            let t0 = Instant::now();
            let res = match step.action {
                Action::Delete => guarded(ctx, async {
                    match store.delete(key).await {
                        Err(CairnError::NotFound(_)) => Ok(()),
                        other => other,
                    }
                })
                .await,
                Action::Create => match desired_of(graph, key) {
                    Ok(obj) => guarded(ctx, async { store.create(obj).await.map(|_| ()) }).await,
                    Err(e) => Some(Err(e)),
                },
                Action::Update => match desired_of(graph, key).map(|d| with_resource_version(d, ctx.observed().get(key))) {
                    Ok(obj) => guarded(ctx, async { store.update(&obj).await.map(|_| ()) }).await,
                    Err(e) => Some(Err(e)),
                },
                Action::NoOp => Some(Ok(())),
            };
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);

            match res {
                None => {
                    cancelled = true;
                    warn!(key = %key, "cycle cancelled mid-apply");
                    out.aborted.push(key.clone());
                }
                Some(Ok(())) => {
                    counter!("apply_ok", 1u64);
                    debug!(key = %key, action = ?step.action, "applied");
                    out.applied.push((key.clone(), step.action));
                }
                Some(Err(e)) => {
                    counter!("apply_err", 1u64);
                    let contained = if step.action == Action::Delete { graph.ancestors(key) } else { graph.descendants(key) };
                    warn!(key = %key, action = ?step.action, error = %e, blocked = contained.len(), "mutation failed");
                    blocked.extend(contained);
                    out.failed.push((key.clone(), e));
                }
            }
        }

        info!(
            applied = out.applied.len(),
            failed = out.failed.len(),
            skipped = out.skipped.len(),
            aborted = out.aborted.len(),
            unchanged = out.unchanged,
            "apply finished"
        );
        out
    }
}

fn resolve(desired: Option<&Json>, observed: Option<&Json>, adopt_only: bool, kind: &str) -> (Action, DiffSummary) {
    match (desired, observed) {
        (None, None) => (Action::NoOp, DiffSummary::default()),
        (None, Some(_)) => (Action::Delete, DiffSummary::default()),
        // Retained objects are kept as they are, never recreated or rewritten.
        (Some(_), _) if adopt_only => (Action::NoOp, DiffSummary::default()),
        (Some(_), None) => (Action::Create, DiffSummary::default()),
        (Some(d), Some(o)) => {
            let diff = owned_diff(kind, d, o);
            if diff.is_empty() {
                (Action::NoOp, diff)
            } else {
                (Action::Update, diff)
            }
        }
    }
}

fn desired_of<'a>(graph: &'a SealedGraph, key: &ObjectKey) -> Result<&'a Json> {
    graph
        .node(key)
        .and_then(|n| n.desired())
        .ok_or_else(|| CairnError::Validation(format!("{} has no desired state", key)))
}

/// The desired object carrying the observed resourceVersion as a precondition.
fn with_resource_version(desired: &Json, observed: Option<&Json>) -> Json {
    let mut obj = desired.clone();
    let rv = observed.and_then(|o| o.pointer("/metadata/resourceVersion")).cloned();
    if let (Some(rv), Some(meta)) = (rv, obj.get_mut("metadata").and_then(|m| m.as_object_mut())) {
        meta.insert("resourceVersion".into(), rv);
    }
    obj
}

/// Race `fut` against the cycle's cancellation token and deadline.
async fn guarded<F, T>(ctx: &TransformContext, fut: F) -> Option<Result<T>>
where
    F: Future<Output = Result<T>>,
{
    let deadline = async {
        match ctx.deadline() {
            Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = ctx.cancellation().cancelled() => None,
        _ = deadline => None,
        r = fut => Some(r),
    }
}
