use cairn_core::{CairnError, ObjectKey, Result};
use cairn_graph::Graph;
use tracing::debug;

use crate::credential::credential_key;
use crate::objects;
use crate::{TransformContext, Transformer};

/// Expands every component into its child objects and the edges the
/// platform needs between them:
///
/// - config maps, the credential Secret, the headless Service and claims
///   come before the workload that mounts or names them;
/// - the client Service and the disruption budget come after it.
pub struct ComponentTransformer;

impl Transformer for ComponentTransformer {
    fn name(&self) -> &'static str { "component" }

    fn transform(&self, ctx: &mut TransformContext, dag: &mut Graph) -> Result<()> {
        let cluster = ctx.cluster();
        if cluster.is_deleting() {
            return Ok(());
        }
        let def = ctx.require_definition()?;
        let version = ctx.require_version()?;
        if version.spec.cluster_definition_ref != def.name() {
            return Err(CairnError::Transform(format!(
                "ClusterVersion {} targets ClusterDefinition {}, cluster uses {}",
                version.name(),
                version.spec.cluster_definition_ref,
                def.name()
            )));
        }
        let ns = cluster.namespace();
        let credential = credential_key(ctx);

        for comp in &cluster.spec.components {
            let cdef = def.component(&comp.component_def_ref).ok_or_else(|| {
                CairnError::Transform(format!("component {}: {} not in ClusterDefinition {}", comp.name, comp.component_def_ref, def.name()))
            })?;
            let cver = version.component(&comp.component_def_ref).ok_or_else(|| {
                CairnError::Transform(format!("component {}: no image for {} in ClusterVersion {}", comp.name, comp.component_def_ref, version.name()))
            })?;
            let replicas = comp.replicas.unwrap_or(cdef.default_replicas);
            let name = objects::workload_name(cluster.name(), &comp.name);

            let mut before = Vec::new();
            let mut after = Vec::new();

            for tpl in &cdef.config_templates {
                let cm = objects::config_map(cluster, comp, tpl, replicas);
                let key = ObjectKey::namespaced("ConfigMap", ns, &objects::config_map_name(cluster.name(), &comp.name, &tpl.name));
                dag.add_or_update_node(key.clone(), Some(objects::to_json(&cm)?));
                before.push(key);
            }
            if dag.contains(&credential) {
                before.push(credential.clone());
            }

            let workload = if cdef.workload_type.is_stateful() {
                let headless = objects::headless_service(cluster, comp, cdef);
                let hkey = ObjectKey::namespaced("Service", ns, &objects::headless_service_name(cluster.name(), &comp.name));
                dag.add_or_update_node(hkey.clone(), Some(objects::to_json(&headless)?));
                before.push(hkey);

                for vct in &comp.volume_claim_templates {
                    for ordinal in 0..replicas {
                        let claim = objects::pvc(cluster, comp, vct, ordinal);
                        let key = ObjectKey::namespaced(
                            "PersistentVolumeClaim",
                            ns,
                            &objects::pvc_name(&vct.name, cluster.name(), &comp.name, ordinal),
                        );
                        dag.add_or_update_node(key.clone(), Some(objects::to_json(&claim)?));
                        before.push(key);
                    }
                }

                if replicas > 1 {
                    let pdb = objects::pod_disruption_budget(cluster, comp);
                    let key = ObjectKey::namespaced("PodDisruptionBudget", ns, &name);
                    dag.add_or_update_node(key.clone(), Some(objects::to_json(&pdb)?));
                    after.push(key);
                }

                let sts = objects::stateful_set(cluster, comp, cdef, cver, replicas);
                let key = ObjectKey::namespaced("StatefulSet", ns, &name);
                dag.add_or_update_node(key.clone(), Some(objects::to_json(&sts)?));
                key
            } else {
                let deploy = objects::deployment(cluster, comp, cdef, cver, replicas);
                let key = ObjectKey::namespaced("Deployment", ns, &name);
                dag.add_or_update_node(key.clone(), Some(objects::to_json(&deploy)?));
                key
            };

            if let Some(svc) = objects::client_service(cluster, comp, cdef) {
                let key = ObjectKey::namespaced("Service", ns, &name);
                dag.add_or_update_node(key.clone(), Some(objects::to_json(&svc)?));
                after.push(key);
            }

            for dep in &before {
                dag.add_edge(dep, &workload)?;
            }
            for dependent in &after {
                dag.add_edge(&workload, dependent)?;
            }
            debug!(component = %comp.name, workload = %workload, replicas, "component derived");
        }
        Ok(())
    }
}
