//! The user-declared Cluster resource.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Affinity, PersistentVolumeClaimSpec, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{labels, CairnError, ClusterKey, Result};

/// A multi-component database deployment.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "apps.cairn.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Definition","type":"string","jsonPath":".spec.clusterDefinitionRef"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.clusterVersionRef"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub cluster_definition_ref: String,
    pub cluster_version_ref: String,
    #[serde(default)]
    pub termination_policy: TerminationPolicy,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub name: String,
    /// Name of the `ComponentDef` in the referenced ClusterDefinition.
    pub component_def_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
    #[serde(default)]
    pub monitor: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

/// What happens to owned objects when the Cluster is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, JsonSchema)]
pub enum TerminationPolicy {
    /// Deletion is blocked: the finalizer stays until the policy changes.
    DoNotTerminate,
    /// Compute, network and config objects go; storage claims and credentials stay.
    #[default]
    #[serde(alias = "Retain")]
    Halt,
    /// Everything goes, data included.
    WipeOut,
}

impl TerminationPolicy {
    /// Whether an object of `kind` is removed under this policy.
    pub fn removes(self, kind: &str) -> bool {
        match self {
            TerminationPolicy::DoNotTerminate => false,
            TerminationPolicy::Halt => !labels::DATA_KINDS.contains(&kind),
            TerminationPolicy::WipeOut => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, JsonSchema)]
pub enum Phase {
    #[default]
    Creating,
    Running,
    Updating,
    Stopped,
    Abnormal,
    Failed,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub phase: Phase,
    /// Problems keyed by `Kind/name` of the object reporting them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl ComponentStatus {
    pub fn object_message(&self, kind: &str, name: &str) -> Option<&str> {
        self.message.get(&format!("{}/{}", kind, name)).map(|s| s.as_str())
    }
}

impl Cluster {
    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("default") }
    pub fn key(&self) -> ClusterKey { ClusterKey::new(self.namespace(), self.name()) }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.as_ref().map(|f| f.iter().any(|x| x == finalizer)).unwrap_or(false)
    }

    /// Returns true when the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        match self.metadata.finalizers.as_mut() {
            Some(list) => {
                let before = list.len();
                list.retain(|f| f != finalizer);
                before != list.len()
            }
            None => false,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
    }

    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata.labels.get_or_insert_with(BTreeMap::new)
    }

    pub fn status_or_default(&self) -> ClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.spec.components.iter().find(|c| c.name == name)
    }

    /// Controller ownerReference pointing at this Cluster, when it has a uid.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.metadata.uid.as_deref()?;
        Some(OwnerReference {
            api_version: labels::CLUSTER_API_VERSION.to_string(),
            kind: labels::CLUSTER_KIND.to_string(),
            name: self.name().to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Structural checks that need no template lookup.
    pub fn validate(&self) -> Result<()> {
        if self.name().is_empty() {
            return Err(CairnError::Validation("cluster has no metadata.name".into()));
        }
        if self.spec.cluster_definition_ref.is_empty() {
            return Err(CairnError::Validation(format!("cluster {}: clusterDefinitionRef is empty", self.name())));
        }
        if self.spec.cluster_version_ref.is_empty() {
            return Err(CairnError::Validation(format!("cluster {}: clusterVersionRef is empty", self.name())));
        }
        if self.spec.components.is_empty() {
            return Err(CairnError::Validation(format!("cluster {}: no components declared", self.name())));
        }
        let mut seen = BTreeSet::new();
        for c in &self.spec.components {
            if c.name.is_empty() {
                return Err(CairnError::Validation(format!("cluster {}: component with empty name", self.name())));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(CairnError::Validation(format!("cluster {}: duplicate component {}", self.name(), c.name)));
            }
            if c.replicas.map(|r| r < 0).unwrap_or(false) {
                return Err(CairnError::Validation(format!("component {}: negative replicas", c.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::{CustomResourceExt, Resource};

    fn cluster() -> Cluster {
        Cluster {
            metadata: ObjectMeta { name: Some("pg".into()), namespace: Some("db".into()), ..Default::default() },
            spec: ClusterSpec {
                cluster_definition_ref: "postgres".into(),
                cluster_version_ref: "postgres-15".into(),
                components: vec![ComponentSpec { name: "main".into(), component_def_ref: "pg".into(), ..Default::default() }],
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn finalizer_add_remove_is_idempotent() {
        let mut c = cluster();
        assert!(c.add_finalizer(labels::CLUSTER_FINALIZER));
        assert!(!c.add_finalizer(labels::CLUSTER_FINALIZER));
        assert_eq!(c.metadata.finalizers.as_ref().unwrap().len(), 1);
        assert!(c.remove_finalizer(labels::CLUSTER_FINALIZER));
        assert!(!c.remove_finalizer(labels::CLUSTER_FINALIZER));
    }

    #[test]
    fn validate_rejects_duplicate_components() {
        let mut c = cluster();
        assert!(c.validate().is_ok());
        c.spec.components.push(c.spec.components[0].clone());
        let e = c.validate().unwrap_err();
        assert!(matches!(e, CairnError::Validation(_)));
        assert!(e.to_string().contains("duplicate component main"));
    }

    #[test]
    fn owner_reference_matches_the_served_resource() {
        assert_eq!(Cluster::api_version(&()), labels::CLUSTER_API_VERSION);
        assert_eq!(Cluster::kind(&()), labels::CLUSTER_KIND);
        let mut c = cluster();
        assert!(c.owner_reference().is_none());
        c.metadata.uid = Some("u-1".into());
        let r = c.owner_reference().unwrap();
        assert_eq!((r.api_version.as_str(), r.kind.as_str(), r.controller), (labels::CLUSTER_API_VERSION, "Cluster", Some(true)));

        let crd = Cluster::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.plural, "clusters");
        let v = &crd.spec.versions[0];
        assert!(v.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn retain_is_an_alias_for_halt() {
        let p: TerminationPolicy = serde_json::from_value(serde_json::json!("Retain")).unwrap();
        assert_eq!(p, TerminationPolicy::Halt);
        assert!(p.removes("StatefulSet"));
        assert!(!p.removes("PersistentVolumeClaim"));
        assert!(TerminationPolicy::WipeOut.removes("PersistentVolumeClaim"));
        assert!(!TerminationPolicy::DoNotTerminate.removes("Service"));
    }
}
