//! Drives the reconciler from kube-runtime's `Controller`. The runtime owns
//! the watches, serializes cycles per Cluster and de-duplicates requeues; the
//! reconciler decides when a Cluster is looked at again.

use std::fmt::Debug;
use std::sync::Arc;

use cairn_core::{labels, CairnError, Cluster};
use futures::channel::oneshot;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Platform, ReconcileAction, Reconciler};

/// Must stay below the client read timeout so idle watches are closed by the server.
const WATCH_TIMEOUT_SECS: u32 = 25;

impl From<ReconcileAction> for Action {
    fn from(a: ReconcileAction) -> Self {
        match a {
            ReconcileAction::Requeue(delay) => Action::requeue(delay),
            ReconcileAction::Done => Action::await_change(),
        }
    }
}

struct Context<P> {
    reconciler: Arc<Reconciler<P>>,
    shutdown: CancellationToken,
}

/// The Cluster an object belongs to, read from its instance label. Used for
/// kinds that carry no controller ownerReference to the Cluster.
pub fn owning_cluster<K: Resource>(obj: &K) -> Option<ObjectRef<Cluster>> {
    let meta = obj.meta();
    let instance = meta.labels.as_ref()?.get(labels::INSTANCE)?;
    Some(ObjectRef::new(instance).within(meta.namespace.as_deref()?))
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn reconcile<P: Platform>(cluster: Arc<Cluster>, ctx: Arc<Context<P>>) -> Result<Action, CairnError> {
    let action = ctx.reconciler.cycle(&cluster.key(), ctx.shutdown.child_token()).await?;
    Ok(action.into())
}

fn error_policy<P: Platform>(cluster: Arc<Cluster>, err: &CairnError, ctx: Arc<Context<P>>) -> Action {
    ctx.reconciler.on_error(&cluster.key(), err).into()
}

/// Watch Clusters and everything they own, reconciling until `shutdown`
/// fires. In-flight cycles see the cancellation through a child token and
/// are drained before this returns.
pub async fn run<P: Platform>(client: Client, reconciler: Arc<Reconciler<P>>, shutdown: CancellationToken) {
    let settings = reconciler.settings().clone();
    let ns = settings.watch_namespace.as_deref();
    let clusters = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    let owned = watcher::Config::default()
        .labels(&format!("{}={}", labels::MANAGED_BY, labels::MANAGED_BY_CAIRN))
        .timeout(WATCH_TIMEOUT_SECS);
    let concurrency = u16::try_from(settings.workers).unwrap_or(u16::MAX);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            let _ = stop_tx.send(());
        }
    });

    info!(namespace = ns.unwrap_or("*"), workers = concurrency, "controller starting");
    let ctx = Arc::new(Context { reconciler, shutdown });
    Controller::new(scoped::<Cluster>(&client, ns), clusters)
        .with_config(controller::Config::default().concurrency(concurrency))
        .owns(scoped::<ConfigMap>(&client, ns), owned.clone())
        .owns(scoped::<Secret>(&client, ns), owned.clone())
        .owns(scoped::<Service>(&client, ns), owned.clone())
        .owns(scoped::<Deployment>(&client, ns), owned.clone())
        .owns(scoped::<StatefulSet>(&client, ns), owned.clone())
        .owns(scoped::<PodDisruptionBudget>(&client, ns), owned.clone())
        .watches(scoped::<PersistentVolumeClaim>(&client, ns), owned.clone(), |pvc| owning_cluster(&pvc))
        .watches(scoped::<Pod>(&client, ns), owned, |pod| owning_cluster(&pod))
        .graceful_shutdown_on(stop_rx.map(|_| ()))
        .run(reconcile::<P>, error_policy::<P>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((cluster, action)) => debug!(%cluster, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    info!("controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn reconcile_actions_map_onto_runtime_actions() {
        let d = Duration::from_secs(5);
        assert_eq!(Action::from(ReconcileAction::Requeue(d)), Action::requeue(d));
        assert_eq!(Action::from(ReconcileAction::Done), Action::await_change());
    }

    #[test]
    fn claims_and_pods_map_to_their_cluster_by_instance_label() {
        let labelled = ObjectMeta {
            name: Some("data-pg-main-0".into()),
            namespace: Some("db".into()),
            labels: Some(BTreeMap::from([(labels::INSTANCE.to_string(), "pg".to_string())])),
            ..Default::default()
        };
        let pvc = PersistentVolumeClaim { metadata: labelled.clone(), ..Default::default() };
        assert_eq!(owning_cluster(&pvc), Some(ObjectRef::new("pg").within("db")));

        let stray = Pod { metadata: ObjectMeta { labels: None, ..labelled }, ..Default::default() };
        assert_eq!(owning_cluster(&stray), None);
    }
}
