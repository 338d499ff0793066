use cairn_core::{labels, CairnError, Cluster, ObjectKey, ObservedState, Phase, TerminationPolicy};
use cairn_graph::Graph;
use cairn_store::fixtures;
use cairn_transform::{Pipeline, TransformContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::{json, Value as Json};

fn key(kind: &str, name: &str) -> ObjectKey {
    ObjectKey::namespaced(kind, "db", name)
}

fn run(cluster: Cluster, observed: ObservedState) -> (TransformContext, Graph) {
    let mut ctx = TransformContext::new(cluster, observed)
        .with_definition(Some(fixtures::definition().unwrap()))
        .with_version(Some(fixtures::version().unwrap()));
    let mut dag = Graph::new();
    Pipeline::cluster_default().run(&mut ctx, &mut dag).unwrap();
    (ctx, dag)
}

fn deleting(policy: TerminationPolicy) -> Cluster {
    let mut c = fixtures::cluster().unwrap();
    c.spec.termination_policy = policy;
    c.add_finalizer(labels::CLUSTER_FINALIZER);
    c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    c
}

fn live(kind: &str, name: &str, component: &str) -> Json {
    json!({
        "apiVersion": labels::api_version_of(kind),
        "kind": kind,
        "metadata": {
            "name": name,
            "namespace": "db",
            "labels": { (labels::INSTANCE): "pg", (labels::COMPONENT_NAME): component }
        }
    })
}

fn snapshot(dag: &Graph) -> Vec<(ObjectKey, Option<Json>, Vec<ObjectKey>)> {
    dag.nodes()
        .map(|n| (n.key().clone(), n.desired().cloned(), dag.successors(n.key()).to_vec()))
        .collect()
}

#[test]
fn derives_every_child_with_prerequisite_edges() {
    let (ctx, dag) = run(fixtures::cluster().unwrap(), ObservedState::new());

    let sts = key("StatefulSet", "pg-main");
    for k in [
        key("Secret", "pg-conn-credential"),
        key("ConfigMap", "pg-main-config"),
        key("Service", "pg-main-headless"),
        key("PersistentVolumeClaim", "data-pg-main-0"),
        key("PersistentVolumeClaim", "data-pg-main-1"),
    ] {
        assert!(dag.successors(&k).contains(&sts), "{} should precede the StatefulSet", k);
    }
    assert!(dag.successors(&sts).contains(&key("Service", "pg-main")));
    assert!(dag.successors(&sts).contains(&key("PodDisruptionBudget", "pg-main")));
    // The proxy is stateless: a Deployment, no claims, no budget.
    assert!(dag.contains(&key("Deployment", "pg-proxy")));
    assert!(!dag.contains(&key("PodDisruptionBudget", "pg-proxy")));
    assert!(dag.nodes().all(|n| !n.is_absent()));

    let sts_obj = dag.node(&sts).unwrap().desired().unwrap();
    assert_eq!(sts_obj["spec"]["replicas"], json!(2));
    assert_eq!(sts_obj["spec"]["serviceName"], json!("pg-main-headless"));

    let cluster = ctx.cluster();
    assert!(cluster.has_finalizer(labels::CLUSTER_FINALIZER));
    assert_eq!(cluster.label(labels::CLUSTER_DEF), Some("postgresql"));
    assert_eq!(cluster.label(labels::CLUSTER_VERSION), Some("postgresql-15.4"));
    assert!(ctx.metadata_changed());
    assert_eq!(cluster.status.as_ref().unwrap().phase, Phase::Creating);
}

#[test]
fn converged_inputs_produce_identical_graphs() {
    let (_, first) = run(fixtures::cluster().unwrap(), ObservedState::new());
    let observed = ObservedState::from_objects(first.nodes().filter_map(|n| n.desired().cloned())).unwrap();

    let (_, second) = run(fixtures::cluster().unwrap(), observed.clone());
    let (_, third) = run(fixtures::cluster().unwrap(), observed);
    assert_eq!(snapshot(&second), snapshot(&third));
    // The stored password is carried over rather than regenerated.
    let secret = key("Secret", "pg-conn-credential");
    assert_eq!(
        first.node(&secret).unwrap().desired().unwrap()["stringData"],
        second.node(&secret).unwrap().desired().unwrap()["stringData"]
    );
}

#[test]
fn halt_removes_compute_but_keeps_claims_and_credentials() {
    let observed = ObservedState::from_objects(vec![
        live("StatefulSet", "pg-main", "main"),
        live("Service", "pg-main", "main"),
        live("ConfigMap", "pg-main-config", "main"),
        live("PersistentVolumeClaim", "data-pg-main-0", "main"),
        live("Secret", "pg-conn-credential", "main"),
    ])
    .unwrap();
    let (ctx, dag) = run(deleting(TerminationPolicy::Halt), observed);

    for k in [key("StatefulSet", "pg-main"), key("Service", "pg-main"), key("ConfigMap", "pg-main-config")] {
        assert!(dag.node(&k).unwrap().is_absent(), "{} should be removed", k);
    }
    assert!(!dag.contains(&key("PersistentVolumeClaim", "data-pg-main-0")));
    assert!(!dag.contains(&key("Secret", "pg-conn-credential")));
    // Edges keep creation direction; the executor walks them backwards for deletes.
    assert!(dag.successors(&key("StatefulSet", "pg-main")).contains(&key("Service", "pg-main")));
    assert!(dag.successors(&key("ConfigMap", "pg-main-config")).contains(&key("StatefulSet", "pg-main")));

    // Objects are still observed, so the finalizer holds.
    assert!(ctx.cluster().has_finalizer(labels::CLUSTER_FINALIZER));
    assert_eq!(ctx.cluster().status.as_ref().unwrap().phase, Phase::Deleting);
}

#[test]
fn wipe_out_removes_claims_too() {
    let observed = ObservedState::from_objects(vec![
        live("StatefulSet", "pg-main", "main"),
        live("PersistentVolumeClaim", "data-pg-main-0", "main"),
        live("Secret", "pg-conn-credential", "main"),
    ])
    .unwrap();
    let (_, dag) = run(deleting(TerminationPolicy::WipeOut), observed);
    for k in [
        key("StatefulSet", "pg-main"),
        key("PersistentVolumeClaim", "data-pg-main-0"),
        key("Secret", "pg-conn-credential"),
    ] {
        assert!(dag.node(&k).unwrap().is_absent(), "{} should be removed", k);
    }
    assert!(dag.successors(&key("PersistentVolumeClaim", "data-pg-main-0")).contains(&key("StatefulSet", "pg-main")));
}

#[test]
fn finalizer_released_once_removed_kinds_are_gone() {
    // Only retained data is left under Halt.
    let observed =
        ObservedState::from_objects(vec![live("PersistentVolumeClaim", "data-pg-main-0", "main")]).unwrap();
    let (ctx, dag) = run(deleting(TerminationPolicy::Halt), observed);
    assert!(dag.is_empty());
    assert!(!ctx.cluster().has_finalizer(labels::CLUSTER_FINALIZER));
    assert!(ctx.metadata_changed());
}

#[test]
fn do_not_terminate_blocks_deletion() {
    let observed = ObservedState::from_objects(vec![live("StatefulSet", "pg-main", "main")]).unwrap();
    let (ctx, dag) = run(deleting(TerminationPolicy::DoNotTerminate), observed);
    assert!(dag.is_empty());
    assert!(ctx.cluster().has_finalizer(labels::CLUSTER_FINALIZER));
    let status = ctx.cluster().status.as_ref().unwrap();
    assert!(status.message.as_deref().unwrap().contains("DoNotTerminate"));
}

#[test]
fn removed_component_is_pruned_but_its_claims_are_kept() {
    let observed = ObservedState::from_objects(vec![
        live("Deployment", "pg-old", "old"),
        live("Service", "pg-old", "old"),
        live("PersistentVolumeClaim", "data-pg-old-0", "old"),
    ])
    .unwrap();
    let (_, dag) = run(fixtures::cluster().unwrap(), observed);
    assert!(dag.node(&key("Deployment", "pg-old")).unwrap().is_absent());
    assert!(dag.node(&key("Service", "pg-old")).unwrap().is_absent());
    assert!(!dag.contains(&key("PersistentVolumeClaim", "data-pg-old-0")));
    assert!(dag.node(&key("StatefulSet", "pg-main")).unwrap().desired().is_some());
}

#[test]
fn image_pull_failure_marks_component_failed() {
    let mut sts = live("StatefulSet", "pg-main", "main");
    sts["metadata"]["generation"] = json!(1);
    sts["spec"] = json!({ "replicas": 2 });
    sts["status"] = json!({ "replicas": 2, "readyReplicas": 0, "observedGeneration": 1 });
    let mut pod = live("Pod", "pg-main-0", "main");
    pod["status"] = json!({ "containerStatuses": [{
        "name": "postgresql",
        "state": { "waiting": { "reason": "ImagePullBackOff", "message": "Back-off pulling image \"postgres:15.4\"" } }
    }] });
    let observed = ObservedState::from_objects(vec![sts, pod]).unwrap();

    let (ctx, _) = run(fixtures::cluster().unwrap(), observed);
    let status = ctx.cluster().status.clone().unwrap();
    let main = &status.components["main"];
    assert_eq!(main.phase, Phase::Failed);
    assert!(main.object_message("Pod", "pg-main-0").unwrap().contains("Back-off pulling image"));
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.message.unwrap().contains("Pod/pg-main-0"));
}

#[test]
fn ready_workloads_make_the_cluster_running() {
    let mut sts = live("StatefulSet", "pg-main", "main");
    sts["metadata"]["generation"] = json!(3);
    sts["status"] = json!({ "readyReplicas": 2, "observedGeneration": 3, "currentRevision": "r2", "updateRevision": "r2" });
    let mut deploy = live("Deployment", "pg-proxy", "proxy");
    deploy["status"] = json!({ "readyReplicas": 1 });
    let observed = ObservedState::from_objects(vec![sts, deploy]).unwrap();

    let mut cluster = fixtures::cluster().unwrap();
    cluster.metadata.generation = Some(4);
    let (ctx, _) = run(cluster, observed);
    let status = ctx.cluster().status.clone().unwrap();
    assert_eq!(status.phase, Phase::Running);
    assert!(status.components.values().all(|c| c.phase == Phase::Running && c.pods_ready == Some(true)));
    assert_eq!(status.observed_generation, Some(4));
    assert!(status.components["main"].last_transition_time.is_some());
}

#[test]
fn missing_definition_fails_in_component_transformer() {
    let mut ctx = TransformContext::new(fixtures::cluster().unwrap(), ObservedState::new())
        .with_version(Some(fixtures::version().unwrap()));
    let mut dag = Graph::new();
    let err = Pipeline::cluster_default().run(&mut ctx, &mut dag).unwrap_err();
    match err {
        CairnError::Pipeline { transformer, source } => {
            assert_eq!(transformer, "component");
            assert!(source.to_string().contains("ClusterDefinition postgresql not found"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
