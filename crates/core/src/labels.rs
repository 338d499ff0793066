//! Label, annotation and finalizer names shared by every transformer.

pub const INSTANCE: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_CAIRN: &str = "cairn";
pub const COMPONENT_NAME: &str = "apps.cairn.io/component-name";
pub const WORKLOAD_TYPE: &str = "apps.cairn.io/workload-type";

/// Immutable identity labels kept in sync with the Cluster spec.
pub const CLUSTER_DEF: &str = "clusterdefinition.cairn.io/name";
pub const CLUSTER_VERSION: &str = "clusterversion.cairn.io/name";

pub const CLUSTER_FINALIZER: &str = "cluster.cairn.io/finalizer";

pub const PROMETHEUS_SCRAPE: &str = "prometheus.io/scrape";
pub const PROMETHEUS_PORT: &str = "prometheus.io/port";

pub const CLUSTER_API_VERSION: &str = "apps.cairn.io/v1alpha1";
pub const CLUSTER_KIND: &str = "Cluster";

/// Kinds cairn derives, creates and garbage collects.
pub const MANAGED_KINDS: &[&str] = &[
    "ConfigMap",
    "Secret",
    "Service",
    "PersistentVolumeClaim",
    "Deployment",
    "StatefulSet",
    "PodDisruptionBudget",
];

/// Data-bearing kinds, subject to the termination policy.
pub const DATA_KINDS: &[&str] = &["PersistentVolumeClaim", "Secret"];

pub fn api_version_of(kind: &str) -> &'static str {
    match kind {
        "Deployment" | "StatefulSet" => "apps/v1",
        "PodDisruptionBudget" => "policy/v1",
        CLUSTER_KIND => CLUSTER_API_VERSION,
        _ => "v1",
    }
}

/// Selector matching every object belonging to a cluster instance.
pub fn instance_selector(cluster: &str) -> String {
    format!("{}={},{}={}", INSTANCE, cluster, MANAGED_BY, MANAGED_BY_CAIRN)
}
