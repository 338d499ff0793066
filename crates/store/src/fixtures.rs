//! Sample templates and Clusters: a PostgreSQL-style topology with a
//! stateful database component and a stateless connection proxy.

use cairn_core::{CairnError, Cluster, ClusterDefinition, ClusterVersion, Result};
use serde::de::DeserializeOwned;

pub const DEFINITION_YAML: &str = r#"
metadata:
  name: postgresql
spec:
  components:
    - name: postgresql
      workloadType: Stateful
      defaultReplicas: 1
      containerPort: 5432
      monitorPort: 9187
      servicePorts:
        - name: tcp-postgresql
          port: 5432
          targetPort: 5432
      configTemplates:
        - name: config
          mountPath: /etc/postgresql
          data:
            postgresql.conf: |
              cluster_name = '$(CLUSTER_NAME)'
              max_wal_senders = $(REPLICAS)
      volumeMounts:
        - name: data
          mountPath: /var/lib/postgresql/data
    - name: pgbouncer
      workloadType: Stateless
      containerPort: 6432
      servicePorts:
        - name: tcp-pgbouncer
          port: 6432
          targetPort: 6432
"#;

pub const VERSION_YAML: &str = r#"
metadata:
  name: postgresql-15.4
spec:
  clusterDefinitionRef: postgresql
  components:
    - componentDefRef: postgresql
      image: docker.io/library/postgres:15.4
    - componentDefRef: pgbouncer
      image: docker.io/bitnami/pgbouncer:1.21.0
"#;

pub const CLUSTER_YAML: &str = r#"
metadata:
  name: pg
  namespace: db
spec:
  clusterDefinitionRef: postgresql
  clusterVersionRef: postgresql-15.4
  terminationPolicy: Halt
  components:
    - name: main
      componentDefRef: postgresql
      replicas: 2
      monitor: true
      volumeClaimTemplates:
        - name: data
          spec:
            accessModes: [ReadWriteOnce]
            resources:
              requests:
                storage: 1Gi
    - name: proxy
      componentDefRef: pgbouncer
      replicas: 1
"#;

/// Parse a YAML document into one of the model types.
pub fn from_yaml<T: DeserializeOwned>(doc: &str) -> Result<T> {
    serde_yaml::from_str(doc).map_err(|e| CairnError::Validation(format!("yaml: {}", e)))
}

pub fn definition() -> Result<ClusterDefinition> { from_yaml(DEFINITION_YAML) }
pub fn version() -> Result<ClusterVersion> { from_yaml(VERSION_YAML) }
pub fn cluster() -> Result<Cluster> { from_yaml(CLUSTER_YAML) }

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{TerminationPolicy, WorkloadType};

    #[test]
    fn samples_parse_and_agree() {
        let def = definition().unwrap();
        let ver = version().unwrap();
        let c = cluster().unwrap();
        assert_eq!(ver.spec.cluster_definition_ref, def.name());
        assert_eq!(c.spec.cluster_definition_ref, def.name());
        assert_eq!(c.spec.cluster_version_ref, ver.name());
        assert_eq!(c.spec.termination_policy, TerminationPolicy::Halt);
        assert_eq!(def.component("postgresql").unwrap().workload_type, WorkloadType::Stateful);
        assert_eq!(def.component("pgbouncer").unwrap().default_replicas, 1);
        for comp in &c.spec.components {
            assert!(def.component(&comp.component_def_ref).is_some());
            assert!(ver.component(&comp.component_def_ref).is_some());
        }
        c.validate().unwrap();
    }
}
