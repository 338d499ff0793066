//! Topology (ClusterDefinition) and version (ClusterVersion) templates a
//! Cluster references by name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ServicePort, VolumeMount};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "apps.cairn.io",
    version = "v1alpha1",
    kind = "ClusterDefinition",
    plural = "clusterdefinitions",
    shortname = "cd",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinitionSpec {
    #[serde(default)]
    pub components: Vec<ComponentDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, JsonSchema)]
pub enum WorkloadType {
    #[default]
    Stateless,
    Stateful,
    Consensus,
    Replication,
}

impl WorkloadType {
    /// Stateless components run as Deployments, everything else as StatefulSets.
    pub fn is_stateful(self) -> bool { !matches!(self, WorkloadType::Stateless) }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadType::Stateless => "Stateless",
            WorkloadType::Stateful => "Stateful",
            WorkloadType::Consensus => "Consensus",
            WorkloadType::Replication => "Replication",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDef {
    pub name: String,
    #[serde(default)]
    pub workload_type: WorkloadType,
    #[serde(default = "default_replicas")]
    pub default_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_ports: Vec<ServicePort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_templates: Vec<ConfigTemplate>,
    /// Mounts for volume claim templates, matched by volume name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_port: Option<i32>,
}

fn default_replicas() -> i32 { 1 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigTemplate {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "apps.cairn.io",
    version = "v1alpha1",
    kind = "ClusterVersion",
    plural = "clusterversions",
    shortname = "cv",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Definition","type":"string","jsonPath":".spec.clusterDefinitionRef"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    pub cluster_definition_ref: String,
    #[serde(default)]
    pub components: Vec<ComponentVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersion {
    pub component_def_ref: String,
    pub image: String,
}

impl ClusterDefinition {
    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }

    pub fn component(&self, name: &str) -> Option<&ComponentDef> {
        self.spec.components.iter().find(|c| c.name == name)
    }
}

impl ClusterVersion {
    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }

    pub fn component(&self, def_ref: &str) -> Option<&ComponentVersion> {
        self.spec.components.iter().find(|c| c.component_def_ref == def_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn templates_are_cluster_scoped() {
        for crd in [ClusterDefinition::crd(), ClusterVersion::crd()] {
            assert_eq!(crd.spec.group, "apps.cairn.io");
            assert_eq!(crd.spec.scope, "Cluster");
        }
    }

    #[test]
    fn component_defaults_apply_on_decode() {
        let def: ComponentDef = serde_json::from_value(serde_json::json!({ "name": "main" })).unwrap();
        assert_eq!(def.default_replicas, 1);
        assert_eq!(def.workload_type, WorkloadType::Stateless);
        assert!(!def.workload_type.is_stateful());
    }
}
