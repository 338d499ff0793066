use std::sync::Arc;
use std::time::{Duration, Instant};

use cairn_apply::{ApplyOutcome, Executor};
use cairn_core::{
    labels, CairnError, Cluster, ClusterKey, ClusterStore, ObjectReader, ObjectStore, ObservedState, Phase, Result,
    TemplateResolver, TerminationPolicy,
};
use cairn_graph::Graph;
use cairn_transform::{Pipeline, TransformContext};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{Backoff, Settings};

/// Everything the driver needs from the platform.
pub trait Platform: ObjectReader + ObjectStore + ClusterStore + TemplateResolver + 'static {}

impl<T> Platform for T where T: ObjectReader + ObjectStore + ClusterStore + TemplateResolver + 'static {}

/// When to look at a Cluster again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Requeue(Duration),
    Done,
}

/// Summary of one successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub applied: usize,
    pub unchanged: usize,
    /// Every component settled (Running or Stopped) and nothing was mutated.
    pub converged: bool,
}

/// Runs reconcile cycles for Clusters against one platform.
pub struct Reconciler<P> {
    platform: Arc<P>,
    pipeline: Pipeline,
    executor: Executor,
    backoff: Backoff<ClusterKey>,
    settings: Settings,
}

impl<P: Platform> Reconciler<P> {
    pub fn new(platform: Arc<P>, settings: Settings) -> Self {
        Self {
            platform,
            pipeline: Pipeline::cluster_default(),
            executor: Executor::new(),
            backoff: Backoff::new(settings.backoff_base, settings.backoff_max),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings { &self.settings }
    pub fn platform(&self) -> &Arc<P> { &self.platform }

    /// Run one cycle and turn its result into a requeue decision.
    pub async fn handle(&self, key: &ClusterKey, cancel: CancellationToken) -> ReconcileAction {
        match self.cycle(key, cancel).await {
            Ok(action) => action,
            Err(e) => self.on_error(key, &e),
        }
    }

    /// One instrumented cycle. Success resets the key's backoff; errors are
    /// left to [`Reconciler::on_error`].
    pub async fn cycle(&self, key: &ClusterKey, cancel: CancellationToken) -> Result<ReconcileAction> {
        let span = info_span!("reconcile", cluster = %key, cycle = %Uuid::new_v4());
        let t0 = Instant::now();
        let res = self.reconcile(key, cancel).instrument(span.clone()).await;
        histogram!("reconcile_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("reconcile_total", 1u64);
        let _g = span.enter();
        let report = res?;
        self.backoff.reset(key);
        Ok(match report {
            None => {
                debug!("cluster gone");
                ReconcileAction::Done
            }
            Some(report) if report.converged => ReconcileAction::Requeue(self.settings.steady_requeue),
            Some(report) => {
                debug!(applied = report.applied, "not converged yet");
                ReconcileAction::Requeue(self.settings.pending_requeue)
            }
        })
    }

    /// Requeue decision for a failed cycle: retryable errors back off per
    /// key, the rest wait at the steady interval for a spec change.
    pub fn on_error(&self, key: &ClusterKey, err: &CairnError) -> ReconcileAction {
        counter!("reconcile_errors", 1u64);
        if err.is_retryable() {
            let delay = self.backoff.next(key);
            warn!(cluster = %key, error = %err, kind = err.kind(), retry_in_ms = delay.as_millis() as u64, "cycle failed");
            ReconcileAction::Requeue(delay)
        } else {
            warn!(cluster = %key, error = %err, kind = err.kind(), "cycle failed; waiting for a change");
            ReconcileAction::Requeue(self.settings.steady_requeue)
        }
    }

    /// One reconcile cycle. `Ok(None)` means the Cluster is gone or was just
    /// released and needs no further work.
    pub async fn reconcile(&self, key: &ClusterKey, cancel: CancellationToken) -> Result<Option<CycleReport>> {
        let Some(cluster) = self.platform.get_cluster(key).await? else {
            return Ok(None);
        };
        if cluster.is_deleting() && !cluster.has_finalizer(labels::CLUSTER_FINALIZER) {
            return Ok(None);
        }
        if let Err(e) = cluster.validate() {
            self.record_error(&cluster, &e).await;
            return Err(e);
        }

        let definition = self.platform.cluster_definition(&cluster.spec.cluster_definition_ref).await?;
        let version = self.platform.cluster_version(&cluster.spec.cluster_version_ref).await?;
        let observed = ObservedState::from_objects(self.platform.list_owned(key).await?)?;
        debug!(observed = observed.len(), "snapshot taken");

        let mut ctx = TransformContext::new(cluster, observed)
            .with_definition(definition)
            .with_version(version)
            .with_cancellation(cancel)
            .with_deadline(Instant::now() + self.settings.cycle_timeout);

        let mut dag = Graph::new();
        if let Err(e) = self.pipeline.run(&mut ctx, &mut dag) {
            self.record_error(ctx.cluster(), &e).await;
            return Err(e);
        }
        let sealed = dag.seal()?;

        if ctx.metadata_changed() {
            let patched = self.platform.patch_metadata(ctx.cluster()).await?;
            if ctx.cluster().is_deleting() && !ctx.cluster().has_finalizer(labels::CLUSTER_FINALIZER) {
                info!("finalizer released");
                return Ok(None);
            }
            ctx.cluster_mut().metadata.resource_version = patched.metadata.resource_version;
        }

        let plan = self.executor.plan(&ctx, sealed)?;
        let outcome = self.executor.apply(self.platform.as_ref(), &ctx, &plan).await;
        self.write_status(&mut ctx, &outcome).await?;

        let outcome = outcome.into_result()?;
        Ok(Some(CycleReport {
            applied: outcome.applied.len(),
            unchanged: outcome.unchanged,
            converged: settled(ctx.cluster()) && outcome.applied.is_empty(),
        }))
    }

    async fn write_status(&self, ctx: &mut TransformContext, outcome: &ApplyOutcome) -> Result<()> {
        if let Some((key, err)) = outcome.failed.first() {
            let msg = format!("apply {}: {}", key, err);
            if let Some(status) = ctx.cluster_mut().status.as_mut() {
                status.message = Some(msg);
            }
        }
        if !ctx.status_changed() {
            return Ok(());
        }
        match self.platform.patch_status(ctx.cluster()).await {
            Err(CairnError::NotFound(_)) if ctx.cluster().is_deleting() => Ok(()),
            other => other,
        }
    }

    /// Surface a cycle error on the Cluster's status message, best effort.
    async fn record_error(&self, cluster: &Cluster, err: &CairnError) {
        let mut updated = cluster.clone();
        let mut status = updated.status_or_default();
        let msg = err.to_string();
        if status.message.as_deref() == Some(msg.as_str()) {
            return;
        }
        status.message = Some(msg);
        updated.status = Some(status);
        if let Err(e) = self.platform.patch_status(&updated).await {
            debug!(error = %e, "could not record error on status");
        }
    }
}

/// Nothing left to wait for: every component is serving or scaled to zero,
/// or deletion is parked behind `DoNotTerminate`.
fn settled(cluster: &Cluster) -> bool {
    if cluster.is_deleting() {
        return cluster.spec.termination_policy == TerminationPolicy::DoNotTerminate;
    }
    match cluster.status.as_ref() {
        Some(s) if !s.components.is_empty() => {
            s.components.values().all(|c| matches!(c.phase, Phase::Running | Phase::Stopped))
        }
        _ => false,
    }
}
