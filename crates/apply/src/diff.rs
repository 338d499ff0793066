//! Owned-field diffs between desired and live objects.

use cairn_core::REPLACED_MAPS;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// JSON pointers of the fields cairn owns for `kind`. Everything else on a
/// live object belongs to users or the platform and is never compared.
fn owned_paths(kind: &str) -> &'static [&'static str] {
    match kind {
        "ConfigMap" => &["/data", "/binaryData"],
        // Generated credentials are never rewritten.
        "Secret" => &["/type"],
        "Service" => &["/spec/ports", "/spec/selector", "/spec/type"],
        "Deployment" | "StatefulSet" => &["/spec/replicas", "/spec/template"],
        "PersistentVolumeClaim" => &["/spec/resources/requests"],
        "PodDisruptionBudget" => &["/spec/maxUnavailable", "/spec/minAvailable", "/spec/selector"],
        _ => &["/spec", "/data"],
    }
}

const SHARED_META: &[&str] = &["/metadata/labels", "/metadata/annotations"];

/// Count how far `base` is from carrying everything in `target`.
///
/// Object keys only present in `base` are ignored, so platform defaults and
/// user additions never show up as changes. Arrays are compared position by
/// position with the same rule; a length mismatch counts the surplus as adds
/// or removes.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    let mut s = DiffSummary::default();
    walk(target, base, false, &mut s);
    s
}

/// Like [`diff_summary`], but keys only present in `base` count as removes.
pub fn exact_diff(target: &Json, base: &Json) -> DiffSummary {
    let mut s = DiffSummary::default();
    walk(target, base, true, &mut s);
    s
}

fn walk(a: &Json, b: &Json, exact: bool, s: &mut DiffSummary) {
    match (a, b) {
        (Json::Object(ao), Json::Object(bo)) => {
            for (k, av) in ao {
                match bo.get(k) {
                    Some(bv) if av == bv => {}
                    Some(bv) => walk(av, bv, exact, s),
                    None => s.adds += 1,
                }
            }
            if exact {
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
        }
        (Json::Array(aa), Json::Array(bb)) => {
            for (av, bv) in aa.iter().zip(bb) {
                walk(av, bv, exact, s);
            }
            if aa.len() > bb.len() {
                s.adds += aa.len() - bb.len();
            }
            if bb.len() > aa.len() {
                s.removes += bb.len() - aa.len();
            }
        }
        (av, bv) => {
            if !scalar_eq(av, bv) {
                s.updates += 1;
            }
        }
    }
}

/// Numbers compare by value, so `1` and `1.0` round-tripped through
/// different encoders are the same.
fn scalar_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// What an update of `observed` towards `desired` would change.
///
/// Labels, annotations and subtrees the platform defaults into are compared
/// as subsets. Maps an update replaces wholesale are compared exactly, so a
/// key dropped from desired state shows up as a remove.
pub fn owned_diff(kind: &str, desired: &Json, observed: &Json) -> DiffSummary {
    let mut s = DiffSummary::default();
    for &path in SHARED_META.iter().chain(owned_paths(kind)) {
        let Some(want) = desired.pointer(path) else { continue };
        match observed.pointer(path) {
            Some(have) => walk(want, have, REPLACED_MAPS.contains(&path), &mut s),
            None => s.adds += 1,
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "x": 1, "extra": true }, "c": [1, 2, 3], "ignored": 0 });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        // a and c[1] changed; b.y and d are new; c lost one element.
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        // b.extra and ignored now count too.
        assert_eq!(exact_diff(&target, &base), DiffSummary { adds: 2, updates: 2, removes: 3 });
    }

    #[test]
    fn platform_defaults_and_status_do_not_count() {
        let desired = json!({
            "apiVersion": "apps/v1", "kind": "StatefulSet",
            "metadata": { "name": "pg-main", "labels": { "app": "pg" } },
            "spec": {
                "replicas": 2,
                "serviceName": "pg-main-headless",
                "template": { "spec": { "containers": [{ "name": "pg", "image": "postgres:15" }] } }
            }
        });
        let observed = json!({
            "apiVersion": "apps/v1", "kind": "StatefulSet",
            "metadata": { "name": "pg-main", "resourceVersion": "7", "labels": { "app": "pg", "team": "data" } },
            "spec": {
                "replicas": 2,
                "serviceName": "pg-main-headless",
                "podManagementPolicy": "OrderedReady",
                "template": { "spec": { "containers": [{
                    "name": "pg", "image": "postgres:15",
                    "imagePullPolicy": "IfNotPresent", "terminationMessagePath": "/dev/termination-log"
                }] } }
            },
            "status": { "readyReplicas": 0 }
        });
        assert!(owned_diff("StatefulSet", &desired, &observed).is_empty());

        let mut scaled = desired.clone();
        scaled["spec"]["replicas"] = json!(3);
        assert_eq!(owned_diff("StatefulSet", &scaled, &observed), DiffSummary { adds: 0, updates: 1, removes: 0 });
    }

    #[test]
    fn stale_keys_in_fully_owned_maps_are_removes() {
        let desired = json!({ "kind": "ConfigMap", "data": { "a": "1" } });
        let observed = json!({
            "kind": "ConfigMap",
            "metadata": { "labels": { "team": "data" } },
            "data": { "a": "1", "stale": "x" }
        });
        assert_eq!(owned_diff("ConfigMap", &desired, &observed), DiffSummary { adds: 0, updates: 0, removes: 1 });

        let desired = json!({ "spec": { "selector": { "app": "pg" }, "type": "ClusterIP" } });
        let observed = json!({ "spec": { "selector": { "app": "pg", "old": "y" }, "type": "ClusterIP", "clusterIP": "10.0.0.1" } });
        assert_eq!(owned_diff("Service", &desired, &observed), DiffSummary { adds: 0, updates: 0, removes: 1 });

        let desired = json!({ "spec": { "maxUnavailable": 1, "selector": { "matchLabels": { "app": "pg" } } } });
        let observed = json!({ "spec": { "maxUnavailable": 1, "selector": { "matchLabels": { "app": "pg", "c": "old" } } } });
        assert_eq!(owned_diff("PodDisruptionBudget", &desired, &observed).removes, 1);
    }

    #[test]
    fn user_labels_on_the_live_object_are_not_removes() {
        let desired = json!({ "metadata": { "labels": { "app": "pg" } }, "data": { "a": "1" } });
        let observed = json!({ "metadata": { "labels": { "app": "pg", "team": "data" } }, "data": { "a": "1" } });
        assert!(owned_diff("ConfigMap", &desired, &observed).is_empty());
    }

    #[test]
    fn secret_data_is_not_owned() {
        let desired = json!({ "kind": "Secret", "type": "Opaque", "stringData": { "password": "new" } });
        let observed = json!({ "kind": "Secret", "type": "Opaque", "data": { "password": "b2xk" } });
        assert!(owned_diff("Secret", &desired, &observed).is_empty());
    }

    #[test]
    fn missing_owned_field_is_an_add() {
        let desired = json!({ "spec": { "resources": { "requests": { "storage": "1Gi" } } } });
        let observed = json!({ "spec": { "resources": {} } });
        assert_eq!(owned_diff("PersistentVolumeClaim", &desired, &observed), DiffSummary { adds: 1, updates: 0, removes: 0 });
    }
}
