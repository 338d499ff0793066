//! Cairn store: an in-memory object store implementing every platform trait
//! the reconcile core needs. Used by tests, `cairnctl plan` and local runs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use cairn_core::{
    labels, CairnError, Cluster, ClusterDefinition, ClusterKey, ClusterStore, ClusterVersion, ObjectKey, ObjectReader,
    ObjectStore, Result, TemplateResolver, REPLACED_MAPS,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value as Json;
use tokio::sync::watch;
use tracing::debug;

pub mod fixtures;

/// Store operation, as recorded in the mutation log and targeted by faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    Create,
    Update,
    Delete,
}

/// Canned failure returned instead of performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Invalid,
    Unavailable,
}

impl Fault {
    fn into_error(self, verb: Verb, key: &ObjectKey) -> CairnError {
        match self {
            Fault::Conflict => CairnError::Conflict(format!("{:?} {}: injected conflict", verb, key)),
            Fault::Invalid => CairnError::Validation(format!("{:?} {}: injected rejection", verb, key)),
            Fault::Unavailable => CairnError::Platform(format!("{:?} {}: injected outage", verb, key)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub verb: Verb,
    pub key: ObjectKey,
}

/// One immutable version of the store contents.
#[derive(Debug, Clone, Default)]
struct World {
    epoch: u64,
    rv: u64,
    objects: BTreeMap<ObjectKey, Json>,
    clusters: BTreeMap<ClusterKey, Cluster>,
    definitions: BTreeMap<String, ClusterDefinition>,
    versions: BTreeMap<String, ClusterVersion>,
    faults: BTreeMap<(Verb, ObjectKey), Fault>,
    log: Vec<Mutation>,
}

impl World {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn fault(&self, verb: Verb, key: &ObjectKey) -> Result<()> {
        match self.faults.get(&(verb, key.clone())) {
            Some(f) => Err(f.into_error(verb, key)),
            None => Ok(()),
        }
    }
}

fn rv_of(obj: &Json) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(|v| v.as_str())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Copy-on-write store: readers load a snapshot, writers swap in a new one.
///
/// Emulates the platform bits the reconcile core relies on: resource
/// versions with optimistic concurrency on update, generation bumps when a
/// spec changes, uids, and Cluster removal once a deleting Cluster has no
/// finalizers left. Every successful object mutation is logged.
pub struct MemoryStore {
    world: ArcSwap<World>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { world: ArcSwap::from_pointee(World::default()), epoch_tx }
    }

    /// Apply `f` to a private copy and publish it, retrying on a concurrent swap.
    fn mutate<T>(&self, f: impl Fn(&mut World) -> Result<T>) -> Result<T> {
        let mut cur = self.world.load_full();
        loop {
            let mut next = (*cur).clone();
            let out = f(&mut next)?;
            next.epoch += 1;
            let epoch = next.epoch;
            let prev = self.world.compare_and_swap(&cur, Arc::new(next));
            if Arc::ptr_eq(&*prev, &cur) {
                self.epoch_tx.send_replace(epoch);
                return Ok(out);
            }
            cur = arc_swap::Guard::into_inner(prev);
        }
    }

    /// Bumped on every write; lets local drivers wake up on change.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
    pub fn epoch(&self) -> u64 { self.world.load().epoch }

    pub fn object(&self, key: &ObjectKey) -> Option<Json> { self.world.load().objects.get(key).cloned() }
    pub fn keys(&self) -> Vec<ObjectKey> { self.world.load().objects.keys().cloned().collect() }
    pub fn cluster(&self, key: &ClusterKey) -> Option<Cluster> { self.world.load().clusters.get(key).cloned() }
    pub fn mutations(&self) -> Vec<Mutation> { self.world.load().log.clone() }

    pub fn clear_mutations(&self) {
        let _ = self.mutate(|w| {
            w.log.clear();
            Ok(())
        });
    }

    /// Make every `verb` on `key` fail with `fault` until cleared.
    pub fn inject_fault(&self, verb: Verb, key: ObjectKey, fault: Fault) {
        let _ = self.mutate(|w| {
            w.faults.insert((verb, key.clone()), fault);
            Ok(())
        });
    }

    pub fn clear_faults(&self) {
        let _ = self.mutate(|w| {
            w.faults.clear();
            Ok(())
        });
    }

    pub fn put_definition(&self, def: ClusterDefinition) {
        let _ = self.mutate(|w| {
            w.definitions.insert(def.name().to_string(), def.clone());
            Ok(())
        });
    }

    pub fn put_version(&self, version: ClusterVersion) {
        let _ = self.mutate(|w| {
            w.versions.insert(version.name().to_string(), version.clone());
            Ok(())
        });
    }

    /// Create or replace a Cluster as a user would, keeping server-owned metadata.
    pub fn put_cluster(&self, cluster: Cluster) -> Cluster {
        let stored = self.mutate(|w| {
            let mut c = cluster.clone();
            if c.metadata.namespace.is_none() {
                c.metadata.namespace = Some("default".into());
            }
            let key = c.key();
            match w.clusters.get(&key) {
                Some(prev) => {
                    c.metadata.uid = prev.metadata.uid.clone();
                    c.metadata.creation_timestamp = prev.metadata.creation_timestamp.clone();
                    c.metadata.finalizers = prev.metadata.finalizers.clone();
                    c.metadata.deletion_timestamp = prev.metadata.deletion_timestamp.clone();
                    c.status = prev.status.clone();
                    let bumped = prev.spec != c.spec;
                    c.metadata.generation = prev.metadata.generation.map(|g| if bumped { g + 1 } else { g });
                }
                None => {
                    c.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                    c.metadata.generation = Some(1);
                    c.metadata.creation_timestamp = Some(k8s_time(chrono::Utc::now()));
                }
            }
            c.metadata.resource_version = Some(w.next_rv());
            w.clusters.insert(key, c.clone());
            Ok(c)
        });
        stored.unwrap_or(cluster)
    }

    /// Mark a Cluster for deletion. Without finalizers it disappears at once.
    pub fn delete_cluster(&self, key: &ClusterKey) -> Result<()> {
        self.mutate(|w| {
            let c = w.clusters.get_mut(key).ok_or_else(|| CairnError::NotFound(format!("cluster {}", key)))?;
            if c.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true) {
                w.clusters.remove(key);
                return Ok(());
            }
            if c.metadata.deletion_timestamp.is_none() {
                c.metadata.deletion_timestamp = Some(k8s_time(chrono::Utc::now()));
            }
            Ok(())
        })
    }

    /// Insert or overwrite an object the way a platform component would
    /// (e.g. Pods, or status written by a workload controller). Not logged.
    pub fn upsert_raw(&self, obj: Json) -> Result<ObjectKey> {
        let key = ObjectKey::from_json(&obj)?;
        self.mutate(|w| {
            let mut stored = obj.clone();
            let rv = w.next_rv();
            if let Some(meta) = stored.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("resourceVersion".into(), Json::String(rv));
            }
            w.objects.insert(key.clone(), stored);
            Ok(key.clone())
        })
    }

    /// Report every workload of `cluster` as fully rolled out, as the
    /// StatefulSet and Deployment controllers would.
    pub fn mark_workloads_ready(&self, cluster: &ClusterKey) {
        let _ = self.mutate(|w| {
            for (key, obj) in w.objects.iter_mut() {
                if !(key.kind == "StatefulSet" || key.kind == "Deployment") || !belongs_to(obj, cluster) {
                    continue;
                }
                let replicas = obj.pointer("/spec/replicas").and_then(|v| v.as_i64()).unwrap_or(1);
                let generation = obj.pointer("/metadata/generation").and_then(|v| v.as_i64()).unwrap_or(1);
                obj["status"] = serde_json::json!({
                    "replicas": replicas,
                    "readyReplicas": replicas,
                    "observedGeneration": generation,
                });
            }
            Ok(())
        });
    }
}

fn k8s_time(t: chrono::DateTime<chrono::Utc>) -> Time { Time(t) }

fn belongs_to(obj: &Json, cluster: &ClusterKey) -> bool {
    let ns = obj.pointer("/metadata/namespace").and_then(|v| v.as_str());
    let instance = obj
        .pointer("/metadata/labels")
        .and_then(|l| l.get(labels::INSTANCE))
        .and_then(|v| v.as_str());
    ns == Some(cluster.namespace.as_str()) && instance == Some(cluster.name.as_str())
}

/// Merge `incoming` into `stored` the way a field-owning apply does: fields
/// carried by `incoming` replace stored ones, absent ones are kept.
fn overlay(stored: &mut Json, incoming: &Json) {
    overlay_at(stored, incoming, "");
}

/// Merge `incoming` into `stored`; maps at [`REPLACED_MAPS`] are swapped in whole.
fn overlay_at(stored: &mut Json, incoming: &Json, path: &str) {
    match (stored, incoming) {
        (Json::Object(s), Json::Object(i)) => {
            for (k, v) in i {
                let child = format!("{}/{}", path, k);
                match s.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() && !REPLACED_MAPS.contains(&child.as_str()) => {
                        overlay_at(existing, v, &child)
                    }
                    _ => {
                        s.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (s, i) => *s = i.clone(),
    }
}

#[async_trait]
impl ObjectReader for MemoryStore {
    async fn list_owned(&self, cluster: &ClusterKey) -> Result<Vec<Json>> {
        let w = self.world.load();
        Ok(w.objects.values().filter(|o| belongs_to(o, cluster)).cloned().collect())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create(&self, obj: &Json) -> Result<Json> {
        let key = ObjectKey::from_json(obj)?;
        let out = self.mutate(|w| {
            w.fault(Verb::Create, &key)?;
            if w.objects.contains_key(&key) {
                return Err(CairnError::Conflict(format!("{} already exists", key)));
            }
            let mut stored = obj.clone();
            let rv = w.next_rv();
            let meta = stored
                .get_mut("metadata")
                .and_then(|m| m.as_object_mut())
                .ok_or_else(|| CairnError::Validation(format!("{} has no metadata", key)))?;
            meta.insert("resourceVersion".into(), Json::String(rv));
            meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
            meta.insert("generation".into(), Json::from(1));
            meta.insert("creationTimestamp".into(), Json::String(now()));
            w.objects.insert(key.clone(), stored.clone());
            w.log.push(Mutation { verb: Verb::Create, key: key.clone() });
            Ok(stored)
        })?;
        debug!(key = %key, "created");
        Ok(out)
    }

    async fn update(&self, obj: &Json) -> Result<Json> {
        let key = ObjectKey::from_json(obj)?;
        let out = self.mutate(|w| {
            w.fault(Verb::Update, &key)?;
            let current = w.objects.get(&key).ok_or_else(|| CairnError::NotFound(key.to_string()))?;
            if let (Some(want), Some(have)) = (rv_of(obj), rv_of(current)) {
                if want != have {
                    return Err(CairnError::Conflict(format!(
                        "{}: resourceVersion {} is stale, current is {}",
                        key, want, have
                    )));
                }
            }
            let mut next = current.clone();
            overlay(&mut next, obj);
            let spec_changed = current.get("spec") != next.get("spec");
            let generation = current.pointer("/metadata/generation").and_then(|g| g.as_i64()).unwrap_or(1);
            let rv = w.next_rv();
            if let Some(meta) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("resourceVersion".into(), Json::String(rv));
                meta.insert("generation".into(), Json::from(if spec_changed { generation + 1 } else { generation }));
            }
            w.objects.insert(key.clone(), next.clone());
            w.log.push(Mutation { verb: Verb::Update, key: key.clone() });
            Ok(next)
        })?;
        debug!(key = %key, "updated");
        Ok(out)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.mutate(|w| {
            w.fault(Verb::Delete, key)?;
            if w.objects.remove(key).is_none() {
                return Err(CairnError::NotFound(key.to_string()));
            }
            w.log.push(Mutation { verb: Verb::Delete, key: key.clone() });
            Ok(())
        })?;
        debug!(key = %key, "deleted");
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Cluster>> {
        Ok(self.cluster(key))
    }

    async fn patch_metadata(&self, cluster: &Cluster) -> Result<Cluster> {
        let key = cluster.key();
        self.mutate(|w| {
            let stored = w.clusters.get_mut(&key).ok_or_else(|| CairnError::NotFound(format!("cluster {}", key)))?;
            stored.metadata.finalizers = cluster.metadata.finalizers.clone();
            stored.metadata.labels = cluster.metadata.labels.clone();
            let out = stored.clone();
            let released = out.is_deleting() && out.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true);
            if released {
                w.clusters.remove(&key);
                return Ok(out);
            }
            let rv = w.next_rv();
            if let Some(c) = w.clusters.get_mut(&key) {
                c.metadata.resource_version = Some(rv);
                return Ok(c.clone());
            }
            Ok(out)
        })
    }

    async fn patch_status(&self, cluster: &Cluster) -> Result<()> {
        let key = cluster.key();
        self.mutate(|w| {
            // The Cluster may be gone already once its finalizer was released.
            let Some(stored) = w.clusters.get_mut(&key) else {
                return Err(CairnError::NotFound(format!("cluster {}", key)));
            };
            stored.status = cluster.status.clone();
            Ok(())
        })
    }
}

#[async_trait]
impl TemplateResolver for MemoryStore {
    async fn cluster_definition(&self, name: &str) -> Result<Option<ClusterDefinition>> {
        Ok(self.world.load().definitions.get(name).cloned())
    }

    async fn cluster_version(&self, name: &str) -> Result<Option<ClusterVersion>> {
        Ok(self.world.load().versions.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str) -> Json {
        json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "db", "labels": { (labels::INSTANCE): "pg" } },
            "data": { "k": "v" }
        })
    }

    #[tokio::test]
    async fn update_with_stale_resource_version_conflicts() {
        let s = MemoryStore::new();
        let created = s.create(&cm("a")).await.unwrap();
        let mut fresh = cm("a");
        fresh["metadata"]["resourceVersion"] = created["metadata"]["resourceVersion"].clone();
        fresh["data"]["k"] = json!("w");
        s.update(&fresh).await.unwrap();
        // Same precondition again is now stale.
        let err = s.update(&fresh).await.unwrap_err();
        assert!(matches!(err, CairnError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_twice_conflicts_and_delete_missing_is_not_found() {
        let s = MemoryStore::new();
        s.create(&cm("a")).await.unwrap();
        assert!(matches!(s.create(&cm("a")).await, Err(CairnError::Conflict(_))));
        let key = ObjectKey::namespaced("ConfigMap", "db", "a");
        s.delete(&key).await.unwrap();
        assert!(matches!(s.delete(&key).await, Err(CairnError::NotFound(_))));
        let verbs: Vec<Verb> = s.mutations().into_iter().map(|m| m.verb).collect();
        assert_eq!(verbs, vec![Verb::Create, Verb::Delete]);
    }

    #[tokio::test]
    async fn injected_fault_fires_until_cleared() {
        let s = MemoryStore::new();
        let key = ObjectKey::namespaced("ConfigMap", "db", "a");
        s.inject_fault(Verb::Create, key.clone(), Fault::Unavailable);
        assert!(matches!(s.create(&cm("a")).await, Err(CairnError::Platform(_))));
        assert!(s.object(&key).is_none());
        s.clear_faults();
        s.create(&cm("a")).await.unwrap();
        assert!(s.object(&key).is_some());
    }

    #[tokio::test]
    async fn spec_change_bumps_generation() {
        let s = MemoryStore::new();
        let mut obj = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "d", "namespace": "db" },
            "spec": { "replicas": 1 }
        });
        s.create(&obj).await.unwrap();
        obj["spec"]["replicas"] = json!(3);
        let updated = s.update(&obj).await.unwrap();
        assert_eq!(updated["metadata"]["generation"], json!(2));
        let same = s.update(&obj).await.unwrap();
        assert_eq!(same["metadata"]["generation"], json!(2));
    }

    #[test]
    fn overlay_keeps_unowned_fields() {
        let mut stored = json!({ "spec": { "replicas": 1, "clusterIP": "10.0.0.1" }, "status": { "ready": 1 } });
        overlay(&mut stored, &json!({ "spec": { "replicas": 2 } }));
        assert_eq!(stored, json!({ "spec": { "replicas": 2, "clusterIP": "10.0.0.1" }, "status": { "ready": 1 } }));
    }

    #[test]
    fn overlay_replaces_fully_owned_maps() {
        let mut stored = json!({
            "metadata": { "labels": { "team": "data" } },
            "data": { "a": "1", "stale": "x" },
            "spec": { "selector": { "app": "pg", "old": "y" }, "clusterIP": "10.0.0.1" }
        });
        overlay(&mut stored, &json!({
            "metadata": { "labels": { "app": "pg" } },
            "data": { "a": "2" },
            "spec": { "selector": { "app": "pg" } }
        }));
        assert_eq!(stored, json!({
            "metadata": { "labels": { "team": "data", "app": "pg" } },
            "data": { "a": "2" },
            "spec": { "selector": { "app": "pg" }, "clusterIP": "10.0.0.1" }
        }));
    }
}
