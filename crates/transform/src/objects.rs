//! Naming and construction of the child objects a Cluster expands into.

use std::collections::BTreeMap;

use cairn_core::{labels, CairnError, Cluster, ComponentDef, ComponentSpec, ComponentVersion, ConfigTemplate, Result, VolumeClaimTemplate};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim, PodSpec,
    PodTemplateSpec, Secret, SecretKeySelector, Service, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use serde_json::Value as Json;

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
const DEFAULT_USERNAME: &str = "root";

pub fn workload_name(cluster: &str, component: &str) -> String {
    format!("{}-{}", cluster, component)
}

pub fn headless_service_name(cluster: &str, component: &str) -> String {
    format!("{}-{}-headless", cluster, component)
}

pub fn config_map_name(cluster: &str, component: &str, template: &str) -> String {
    format!("{}-{}-{}", cluster, component, template)
}

pub fn credential_secret_name(cluster: &str) -> String {
    format!("{}-conn-credential", cluster)
}

/// Matches the claim names a StatefulSet generates, so pre-created claims are adopted.
pub fn pvc_name(template: &str, cluster: &str, component: &str, ordinal: i32) -> String {
    format!("{}-{}-{}-{}", template, cluster, component, ordinal)
}

pub fn cluster_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::INSTANCE.to_string(), cluster.name().to_string()),
        (labels::MANAGED_BY.to_string(), labels::MANAGED_BY_CAIRN.to_string()),
    ])
}

pub fn component_labels(cluster: &Cluster, component: &str) -> BTreeMap<String, String> {
    let mut l = cluster_labels(cluster);
    l.insert(labels::COMPONENT_NAME.to_string(), component.to_string());
    l
}

fn meta(cluster: &Cluster, name: String, labels: BTreeMap<String, String>, owned: bool) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(cluster.namespace().to_string()),
        labels: Some(labels),
        owner_references: if owned { cluster.owner_reference().map(|r| vec![r]) } else { None },
        ..Default::default()
    }
}

fn selector(cluster: &Cluster, component: &str) -> LabelSelector {
    LabelSelector { match_labels: Some(component_labels(cluster, component)), ..Default::default() }
}

pub fn to_json<T: Serialize>(obj: &T) -> Result<Json> {
    serde_json::to_value(obj).map_err(|e| CairnError::Transform(format!("rendering object: {}", e)))
}

/// Credentials shared by every component of the cluster.
pub fn credential_secret(cluster: &Cluster, password: &str) -> Secret {
    Secret {
        metadata: meta(cluster, credential_secret_name(cluster.name()), cluster_labels(cluster), true),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            (USERNAME_KEY.to_string(), DEFAULT_USERNAME.to_string()),
            (PASSWORD_KEY.to_string(), password.to_string()),
        ])),
        ..Default::default()
    }
}

/// Read the password back from an observed credential Secret.
pub fn observed_password(obj: &Json) -> Option<String> {
    if let Some(p) = obj.pointer("/stringData/password").and_then(|v| v.as_str()) {
        return Some(p.to_string());
    }
    let secret: Secret = serde_json::from_value(obj.clone()).ok()?;
    let bytes = secret.data?.remove(PASSWORD_KEY)?;
    String::from_utf8(bytes.0).ok().filter(|s| !s.is_empty())
}

fn render_template(raw: &str, cluster: &Cluster, component: &ComponentSpec, replicas: i32) -> String {
    raw.replace("$(CLUSTER_NAME)", cluster.name())
        .replace("$(COMPONENT_NAME)", &component.name)
        .replace("$(REPLICAS)", &replicas.to_string())
}

pub fn config_map(cluster: &Cluster, component: &ComponentSpec, tpl: &ConfigTemplate, replicas: i32) -> ConfigMap {
    let data = tpl
        .data
        .iter()
        .map(|(k, v)| (k.clone(), render_template(v, cluster, component, replicas)))
        .collect();
    ConfigMap {
        metadata: meta(
            cluster,
            config_map_name(cluster.name(), &component.name, &tpl.name),
            component_labels(cluster, &component.name),
            true,
        ),
        data: Some(data),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector { key: key.to_string(), name: secret.to_string().into(), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), ..Default::default() }
}

/// Pod template shared by Deployments and StatefulSets. Component placement
/// overrides the cluster-level one when set.
pub fn pod_template(cluster: &Cluster, component: &ComponentSpec, def: &ComponentDef, version: &ComponentVersion) -> PodTemplateSpec {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for tpl in &def.config_templates {
        volumes.push(Volume {
            name: tpl.name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name(cluster.name(), &component.name, &tpl.name).into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount { name: tpl.name.clone(), mount_path: tpl.mount_path.clone(), ..Default::default() });
    }
    if def.workload_type.is_stateful() {
        for vct in &component.volume_claim_templates {
            if let Some(m) = def.volume_mounts.iter().find(|m| m.name == vct.name) {
                mounts.push(m.clone());
            }
        }
    }

    let secret = credential_secret_name(cluster.name());
    let container = Container {
        name: def.name.clone(),
        image: Some(version.image.clone()),
        ports: def.container_port.map(|p| vec![ContainerPort { container_port: p, ..Default::default() }]),
        env: Some(vec![
            plain_env("CAIRN_CLUSTER_NAME", cluster.name()),
            plain_env("CAIRN_COMPONENT_NAME", &component.name),
            secret_env("CAIRN_USER", &secret, USERNAME_KEY),
            secret_env("CAIRN_PASSWORD", &secret, PASSWORD_KEY),
        ]),
        resources: component.resources.clone(),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        ..Default::default()
    };

    let affinity = component.affinity.clone().or_else(|| cluster.spec.affinity.clone());
    let tolerations = if component.tolerations.is_empty() { &cluster.spec.tolerations } else { &component.tolerations };

    let mut pod_labels = component_labels(cluster, &component.name);
    pod_labels.insert(labels::WORKLOAD_TYPE.to_string(), def.workload_type.as_str().to_string());
    let annotations = match (component.monitor, def.monitor_port) {
        (true, Some(port)) => Some(BTreeMap::from([
            (labels::PROMETHEUS_SCRAPE.to_string(), "true".to_string()),
            (labels::PROMETHEUS_PORT.to_string(), port.to_string()),
        ])),
        _ => None,
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(pod_labels), annotations, ..Default::default() }),
        spec: Some(PodSpec {
            containers: vec![container],
            affinity,
            tolerations: if tolerations.is_empty() { None } else { Some(tolerations.clone()) },
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
    }
}

fn claim_template(cluster: &Cluster, component: &ComponentSpec, vct: &VolumeClaimTemplate) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(vct.name.clone()),
            labels: Some(component_labels(cluster, &component.name)),
            ..Default::default()
        },
        spec: Some(vct.spec.clone()),
        ..Default::default()
    }
}

pub fn stateful_set(
    cluster: &Cluster,
    component: &ComponentSpec,
    def: &ComponentDef,
    version: &ComponentVersion,
    replicas: i32,
) -> StatefulSet {
    let claims: Vec<_> = component.volume_claim_templates.iter().map(|v| claim_template(cluster, component, v)).collect();
    StatefulSet {
        metadata: meta(cluster, workload_name(cluster.name(), &component.name), component_labels(cluster, &component.name), true),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: selector(cluster, &component.name),
            service_name: headless_service_name(cluster.name(), &component.name).into(),
            template: pod_template(cluster, component, def, version),
            volume_claim_templates: if claims.is_empty() { None } else { Some(claims) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deployment(
    cluster: &Cluster,
    component: &ComponentSpec,
    def: &ComponentDef,
    version: &ComponentVersion,
    replicas: i32,
) -> Deployment {
    Deployment {
        metadata: meta(cluster, workload_name(cluster.name(), &component.name), component_labels(cluster, &component.name), true),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: selector(cluster, &component.name),
            template: pod_template(cluster, component, def, version),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn headless_service(cluster: &Cluster, component: &ComponentSpec, def: &ComponentDef) -> Service {
    Service {
        metadata: meta(
            cluster,
            headless_service_name(cluster.name(), &component.name),
            component_labels(cluster, &component.name),
            true,
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(component_labels(cluster, &component.name)),
            ports: if def.service_ports.is_empty() { None } else { Some(def.service_ports.clone()) },
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Client-facing Service; only when the definition exposes ports.
pub fn client_service(cluster: &Cluster, component: &ComponentSpec, def: &ComponentDef) -> Option<Service> {
    if def.service_ports.is_empty() {
        return None;
    }
    Some(Service {
        metadata: meta(cluster, workload_name(cluster.name(), &component.name), component_labels(cluster, &component.name), true),
        spec: Some(ServiceSpec {
            type_: Some(component.service_type.clone().unwrap_or_else(|| "ClusterIP".to_string())),
            selector: Some(component_labels(cluster, &component.name)),
            ports: Some(def.service_ports.clone()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Claims carry no ownerReference: retained data must survive the Cluster.
pub fn pvc(cluster: &Cluster, component: &ComponentSpec, vct: &VolumeClaimTemplate, ordinal: i32) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(
            cluster,
            pvc_name(&vct.name, cluster.name(), &component.name, ordinal),
            component_labels(cluster, &component.name),
            false,
        ),
        spec: Some(vct.spec.clone()),
        ..Default::default()
    }
}

pub fn pod_disruption_budget(cluster: &Cluster, component: &ComponentSpec) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: meta(cluster, workload_name(cluster.name(), &component.name), component_labels(cluster, &component.name), true),
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(selector(cluster, &component.name)),
            ..Default::default()
        }),
        ..Default::default()
    }
}
