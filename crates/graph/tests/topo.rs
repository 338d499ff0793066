use cairn_core::ObjectKey;
use cairn_graph::{Graph, GraphError};

fn k(kind: &str, name: &str) -> ObjectKey {
    ObjectKey::namespaced(kind, "db", name)
}

fn position(order: &[ObjectKey], key: &ObjectKey) -> usize {
    order.iter().position(|x| x == key).expect("key in order")
}

#[test]
fn every_edge_is_respected_in_a_component_shaped_graph() {
    let cm = k("ConfigMap", "pg-main-conf");
    let secret = k("Secret", "pg-conn-credential");
    let headless = k("Service", "pg-main-headless");
    let pvc0 = k("PersistentVolumeClaim", "data-pg-main-0");
    let sts = k("StatefulSet", "pg-main");
    let svc = k("Service", "pg-main");
    let pdb = k("PodDisruptionBudget", "pg-main");

    let mut g = Graph::new();
    // Insert the workload first so insertion order alone would be wrong.
    for key in [&sts, &svc, &pdb, &cm, &secret, &headless, &pvc0] {
        g.add_or_update_node(key.clone(), Some(serde_json::json!({})));
    }
    for dep in [&cm, &secret, &headless, &pvc0] {
        g.add_edge(dep, &sts).unwrap();
    }
    g.add_edge(&sts, &svc).unwrap();
    g.add_edge(&sts, &pdb).unwrap();

    let sealed = g.seal().unwrap();
    let order = sealed.order();
    assert_eq!(order.len(), 7);
    for node in sealed.nodes() {
        for succ in sealed.successors(node.key()) {
            assert!(position(order, node.key()) < position(order, succ), "{} before {}", node.key(), succ);
        }
    }
    // Independent leaves keep insertion order among themselves.
    assert!(position(order, &cm) < position(order, &secret));
    assert!(position(order, &svc) < position(order, &pdb));
}

#[test]
fn topological_order_is_lazy_and_deterministic() {
    let build = || {
        let mut g = Graph::new();
        for n in ["a", "b", "c", "d", "e"] {
            g.add_or_update_node(k("ConfigMap", n), None);
        }
        g.add_edge(&k("ConfigMap", "e"), &k("ConfigMap", "a")).unwrap();
        g
    };
    let g1 = build();
    let first_two: Vec<_> = g1.topological_order().take(2).map(|r| r.unwrap().name.clone()).collect();
    assert_eq!(first_two, vec!["b", "c"]);

    let full1: Vec<_> = g1.topological_order().map(|r| r.unwrap().clone()).collect();
    let full2: Vec<_> = build().topological_order().map(|r| r.unwrap().clone()).collect();
    assert_eq!(full1, full2);
}

#[test]
fn rejected_cycle_through_long_path_keeps_graph_valid() {
    let mut g = Graph::new();
    let keys: Vec<_> = (0..6).map(|i| k("ConfigMap", &format!("n{}", i))).collect();
    for key in &keys {
        g.add_or_update_node(key.clone(), Some(serde_json::json!({})));
    }
    for w in keys.windows(2) {
        g.add_edge(&w[0], &w[1]).unwrap();
    }
    let err = g.add_edge(&keys[5], &keys[0]).unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }));
    assert!(g.topological_order().all(|r| r.is_ok()));
    assert!(g.seal().is_ok());
}
