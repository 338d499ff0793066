use std::collections::BTreeMap;

use cairn_core::{labels, ObjectKey, Result};
use cairn_graph::Graph;
use tracing::info;

use crate::{TransformContext, Transformer};

/// Garbage collects owned objects the spec no longer declares, e.g. after a
/// component was removed. Claims are kept, like a StatefulSet scale-down.
pub struct PruneTransformer;

impl Transformer for PruneTransformer {
    fn name(&self) -> &'static str { "prune" }

    fn transform(&self, ctx: &mut TransformContext, dag: &mut Graph) -> Result<()> {
        if ctx.cluster().is_deleting() {
            return Ok(());
        }
        let stale: Vec<ObjectKey> = ctx
            .observed()
            .owned_keys()
            .filter(|k| k.kind != "PersistentVolumeClaim" && !dag.contains(k))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        info!(cluster = %ctx.cluster().key(), count = stale.len(), "pruning undeclared objects");
        for k in &stale {
            dag.remove_node(k.clone());
        }
        link_removals(ctx, dag, &stale)
    }
}

/// Order freshly inserted removal nodes the way the component transformer
/// orders live ones, so deletions run dependents first. Objects are grouped
/// by their component label.
pub(crate) fn link_removals(ctx: &TransformContext, dag: &mut Graph, keys: &[ObjectKey]) -> Result<()> {
    let mut groups: BTreeMap<&str, Vec<&ObjectKey>> = BTreeMap::new();
    for k in keys {
        let comp = ctx
            .observed()
            .get(k)
            .and_then(|o| o.pointer("/metadata/labels").and_then(|l| l.get(labels::COMPONENT_NAME)))
            .and_then(|v| v.as_str());
        if let Some(comp) = comp {
            groups.entry(comp).or_default().push(k);
        }
    }
    for members in groups.values() {
        let workloads: Vec<&ObjectKey> =
            members.iter().copied().filter(|k| k.kind == "StatefulSet" || k.kind == "Deployment").collect();
        for w in &workloads {
            for m in members.iter().filter(|m| !workloads.contains(m)) {
                if is_prerequisite(ctx, m) {
                    dag.add_edge(m, w)?;
                } else {
                    dag.add_edge(w, m)?;
                }
            }
        }
    }
    Ok(())
}

fn is_prerequisite(ctx: &TransformContext, key: &ObjectKey) -> bool {
    match key.kind.as_str() {
        "ConfigMap" | "Secret" | "PersistentVolumeClaim" => true,
        "Service" => ctx
            .observed()
            .get(key)
            .and_then(|o| o.pointer("/spec/clusterIP"))
            .and_then(|v| v.as_str())
            == Some("None"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{Cluster, ClusterSpec, ObservedState};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn obj(kind: &str, name: &str, comp: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": labels::api_version_of(kind), "kind": kind,
            "metadata": { "name": name, "namespace": "db", "labels": { (labels::COMPONENT_NAME): comp } },
            "spec": {}
        })
    }

    #[test]
    fn removed_component_is_pruned_dependents_first_and_claims_kept() {
        let observed = ObservedState::from_objects(vec![
            obj("ConfigMap", "pg-old-conf", "old"),
            obj("StatefulSet", "pg-old", "old"),
            obj("Service", "pg-old", "old"),
            obj("PersistentVolumeClaim", "data-pg-old-0", "old"),
            obj("Pod", "pg-old-0", "old"),
        ])
        .unwrap();
        let cluster = Cluster {
            metadata: ObjectMeta { name: Some("pg".into()), namespace: Some("db".into()), ..Default::default() },
            spec: ClusterSpec::default(),
            status: None,
        };
        let mut ctx = TransformContext::new(cluster, observed);
        let mut dag = Graph::new();
        PruneTransformer.transform(&mut ctx, &mut dag).unwrap();

        assert_eq!(dag.len(), 3);
        assert!(dag.nodes().all(|n| n.is_absent()));
        assert!(!dag.contains(&ObjectKey::namespaced("PersistentVolumeClaim", "db", "data-pg-old-0")));
        let sts = ObjectKey::namespaced("StatefulSet", "db", "pg-old");
        assert_eq!(dag.predecessors(&sts), &[ObjectKey::namespaced("ConfigMap", "db", "pg-old-conf")]);
        assert_eq!(dag.successors(&sts), &[ObjectKey::namespaced("Service", "db", "pg-old")]);
    }
}
