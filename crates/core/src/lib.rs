//! Cairn core types: object identity, observed snapshots, the Cluster model,
//! errors and the traits the reconcile core uses to reach the platform.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod cluster;
pub mod definition;
pub mod error;
pub mod labels;

pub use cluster::{
    Cluster, ClusterSpec, ClusterStatus, ComponentSpec, ComponentStatus, Phase, TerminationPolicy,
    VolumeClaimTemplate,
};
pub use definition::{
    ClusterDefinition, ClusterDefinitionSpec, ClusterVersion, ClusterVersionSpec, ComponentDef,
    ComponentVersion, ConfigTemplate, WorkloadType,
};
pub use error::{CairnError, Result};

/// JSON pointers of maps an update replaces instead of merging into: keys
/// the live object has beyond the ones sent are dropped.
pub const REPLACED_MAPS: &[&str] = &["/data", "/binaryData", "/spec/selector"];

/// Identity of a single platform object: `(kind, namespace, name)` plus the
/// apiVersion needed to address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Namespaced key for one of the core kinds cairn manages.
    pub fn namespaced(kind: &str, namespace: &str, name: &str) -> Self {
        Self::new(labels::api_version_of(kind), kind, Some(namespace), name)
    }

    /// Extract the identity of a raw object.
    pub fn from_json(v: &Json) -> Result<Self> {
        let api_version = v
            .get("apiVersion")
            .and_then(|x| x.as_str())
            .ok_or_else(|| CairnError::Validation("object missing apiVersion".into()))?;
        let kind = v
            .get("kind")
            .and_then(|x| x.as_str())
            .ok_or_else(|| CairnError::Validation("object missing kind".into()))?;
        let meta = v.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|x| x.as_str())
            .ok_or_else(|| CairnError::Validation(format!("{} missing metadata.name", kind)))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|x| x.as_str());
        Ok(Self::new(api_version, kind, namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Identity of a Cluster resource; the unit of work-queue serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { namespace: namespace.to_string(), name: name.to_string() }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of the live objects belonging to one cluster, read once at the
/// start of a reconcile cycle and never refreshed within it.
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    objects: BTreeMap<ObjectKey, Json>,
}

impl ObservedState {
    pub fn new() -> Self { Self::default() }

    /// Build from raw objects; objects without a usable identity are rejected.
    pub fn from_objects(objects: impl IntoIterator<Item = Json>) -> Result<Self> {
        let mut me = Self::new();
        for obj in objects {
            me.insert(obj)?;
        }
        Ok(me)
    }

    pub fn insert(&mut self, obj: Json) -> Result<ObjectKey> {
        let key = ObjectKey::from_json(&obj)?;
        self.objects.insert(key.clone(), obj);
        Ok(key)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&Json> { self.objects.get(key) }
    pub fn contains(&self, key: &ObjectKey) -> bool { self.objects.contains_key(key) }
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &Json)> {
        self.objects.iter()
    }

    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (&'a ObjectKey, &'a Json)> + 'a {
        self.objects.iter().filter(move |(k, _)| k.kind == kind)
    }

    /// Keys of objects cairn manages (Pods are observed for status only).
    pub fn owned_keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.objects.keys().filter(|k| labels::MANAGED_KINDS.contains(&k.kind.as_str()))
    }
}

/// Read accessor to the live object store, scoped to one cluster.
#[async_trait::async_trait]
pub trait ObjectReader: Send + Sync {
    /// List every object labelled as belonging to the cluster (managed kinds and Pods).
    async fn list_owned(&self, cluster: &ClusterKey) -> Result<Vec<Json>>;
}

/// Mutation surface of the live object store.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create(&self, obj: &Json) -> Result<Json>;
    /// Overwrite the fields carried by `obj`, replacing the maps at
    /// [`REPLACED_MAPS`] and merging everything else. A
    /// `metadata.resourceVersion` in `obj` is a precondition; a mismatch
    /// yields `CairnError::Conflict`.
    async fn update(&self, obj: &Json) -> Result<Json>;
    /// Delete by identity. Deleting an absent object yields `CairnError::NotFound`.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Access to the Cluster resources themselves.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Cluster>>;
    /// Persist finalizers and labels of `cluster`.
    async fn patch_metadata(&self, cluster: &Cluster) -> Result<Cluster>;
    async fn patch_status(&self, cluster: &Cluster) -> Result<()>;
}

/// Lookup of the templates a Cluster references by name.
#[async_trait::async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn cluster_definition(&self, name: &str) -> Result<Option<ClusterDefinition>>;
    async fn cluster_version(&self, name: &str) -> Result<Option<ClusterVersion>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_from_json_requires_identity() {
        let ok = serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "ns" }
        });
        let key = ObjectKey::from_json(&ok).unwrap();
        assert_eq!(key, ObjectKey::namespaced("ConfigMap", "ns", "cm"));
        assert_eq!(key.to_string(), "ConfigMap/ns/cm");

        let no_kind = serde_json::json!({ "apiVersion": "v1", "metadata": { "name": "x" } });
        let e = ObjectKey::from_json(&no_kind).unwrap_err().to_string();
        assert!(e.contains("missing kind"), "e={}", e);
    }

    #[test]
    fn owned_keys_skip_pods() {
        let obs = ObservedState::from_objects(vec![
            serde_json::json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p", "namespace": "ns"}}),
            serde_json::json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s", "namespace": "ns"}}),
        ])
        .unwrap();
        let owned: Vec<_> = obs.owned_keys().collect();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].kind, "Service");
        assert_eq!(obs.of_kind("Pod").count(), 1);
    }
}
