use std::collections::BTreeMap;

use cairn_core::{labels, ClusterStatus, ComponentSpec, ComponentStatus, ObjectKey, Phase, Result, TerminationPolicy};
use cairn_graph::Graph;
use serde_json::Value as Json;

use crate::objects;
use crate::{TransformContext, Transformer};

const FAILING_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull", "CrashLoopBackOff", "CreateContainerConfigError"];

/// Folds observed workload and Pod state into per-component phases and the
/// Cluster phase. Reads the snapshot only; never touches the graph.
pub struct StatusTransformer;

impl Transformer for StatusTransformer {
    fn name(&self) -> &'static str { "status" }

    fn transform(&self, ctx: &mut TransformContext, _dag: &mut Graph) -> Result<()> {
        let cluster = ctx.cluster();
        let prev = cluster.status_or_default();
        let deleting = cluster.is_deleting();
        let now = chrono::Utc::now().to_rfc3339();

        let mut components = BTreeMap::new();
        for comp in &cluster.spec.components {
            let mut st = if deleting { ComponentStatus { phase: Phase::Deleting, ..Default::default() } } else { component_status(ctx, comp) };
            let before = prev.components.get(&comp.name);
            // A component that has been up before is updating, not creating.
            let was_up = before.map(|b| !matches!(b.phase, Phase::Creating | Phase::Failed)).unwrap_or(false);
            if !deleting && st.phase == Phase::Creating && st.message.is_empty() && was_up {
                st.phase = Phase::Updating;
            }
            st.last_transition_time = match before {
                Some(b) if b.phase == st.phase => b.last_transition_time.clone(),
                _ => Some(now.clone()),
            };
            components.insert(comp.name.clone(), st);
        }

        let phase = if deleting { Phase::Deleting } else { cluster_phase(components.values().map(|c| c.phase)) };
        let message = if deleting && cluster.spec.termination_policy == TerminationPolicy::DoNotTerminate {
            Some("deletion blocked by termination policy DoNotTerminate".to_string())
        } else {
            components
                .iter()
                .find_map(|(name, c)| c.message.iter().next().map(|(obj, msg)| format!("component {}: {}: {}", name, obj, msg)))
        };

        let status = ClusterStatus { phase, message, observed_generation: cluster.metadata.generation, components };
        ctx.cluster_mut().status = Some(status);
        Ok(())
    }
}

fn int_at(obj: &Json, path: &str) -> Option<i64> {
    obj.pointer(path).and_then(|v| v.as_i64())
}

fn component_status(ctx: &TransformContext, comp: &ComponentSpec) -> ComponentStatus {
    let cluster = ctx.cluster();
    let observed = ctx.observed();
    let name = objects::workload_name(cluster.name(), &comp.name);
    let workload = ["StatefulSet", "Deployment"]
        .iter()
        .find_map(|kind| observed.get(&ObjectKey::namespaced(kind, cluster.namespace(), &name)));
    let Some(workload) = workload else {
        return ComponentStatus { phase: Phase::Creating, ..Default::default() };
    };

    let desired = comp
        .replicas
        .map(i64::from)
        .or_else(|| int_at(workload, "/spec/replicas"))
        .unwrap_or(1);
    if desired == 0 {
        return ComponentStatus { phase: Phase::Stopped, pods_ready: Some(true), ..Default::default() };
    }
    let ready = int_at(workload, "/status/readyReplicas").unwrap_or(0);
    let generation_seen = match (int_at(workload, "/metadata/generation"), int_at(workload, "/status/observedGeneration")) {
        (Some(g), Some(o)) => o >= g,
        (Some(_), None) => false,
        _ => true,
    };
    let revision_settled = match (
        workload.pointer("/status/currentRevision").and_then(|v| v.as_str()),
        workload.pointer("/status/updateRevision").and_then(|v| v.as_str()),
    ) {
        (Some(c), Some(u)) => c == u,
        _ => true,
    };
    if ready >= desired && generation_seen && revision_settled {
        return ComponentStatus { phase: Phase::Running, pods_ready: Some(true), ..Default::default() };
    }

    let mut message = BTreeMap::new();
    for (key, pod) in observed.of_kind("Pod") {
        let pod_comp = pod.pointer("/metadata/labels").and_then(|l| l.get(labels::COMPONENT_NAME)).and_then(|v| v.as_str());
        if key.namespace.as_deref() != Some(cluster.namespace()) || pod_comp != Some(comp.name.as_str()) {
            continue;
        }
        if let Some(problem) = pod_problem(pod) {
            message.insert(format!("Pod/{}", key.name), problem);
        }
    }
    let phase = match (message.is_empty(), ready) {
        (true, _) => Phase::Creating,
        (false, 0) => Phase::Failed,
        (false, _) => Phase::Abnormal,
    };
    ComponentStatus { phase, message, pods_ready: Some(false), last_transition_time: None }
}

/// First failing container of a Pod, rendered for the status message.
fn pod_problem(pod: &Json) -> Option<String> {
    let statuses = pod.pointer("/status/containerStatuses")?.as_array()?;
    for cs in statuses {
        if let Some(waiting) = cs.pointer("/state/waiting") {
            let reason = waiting.get("reason").and_then(|v| v.as_str()).unwrap_or("");
            if FAILING_REASONS.contains(&reason) {
                let msg = waiting.get("message").and_then(|v| v.as_str()).unwrap_or(reason);
                return Some(msg.to_string());
            }
        }
        if let Some(term) = cs.pointer("/state/terminated") {
            let code = term.get("exitCode").and_then(|v| v.as_i64()).unwrap_or(0);
            if code != 0 {
                let reason = term.get("reason").and_then(|v| v.as_str()).unwrap_or("Error");
                return Some(format!("container exited with code {}: {}", code, reason));
            }
        }
    }
    None
}

fn cluster_phase(phases: impl Iterator<Item = Phase> + Clone) -> Phase {
    let all = |p: Phase| phases.clone().all(|x| x == p);
    let any = |p: Phase| phases.clone().any(|x| x == p);
    if phases.clone().next().is_none() {
        return Phase::Creating;
    }
    let settled = phases.clone().all(|x| matches!(x, Phase::Running | Phase::Stopped));
    if all(Phase::Stopped) {
        Phase::Stopped
    } else if settled {
        // Some components scaled to zero, the rest serving.
        Phase::Running
    } else if any(Phase::Failed) && !any(Phase::Running) {
        Phase::Failed
    } else if any(Phase::Failed) || any(Phase::Abnormal) {
        Phase::Abnormal
    } else if any(Phase::Creating) {
        Phase::Creating
    } else {
        Phase::Updating
    }
}
