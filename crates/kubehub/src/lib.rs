//! Cairn kubehub: discovery and the platform traits over the API server.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use cairn_core::{
    labels, CairnError, Cluster, ClusterDefinition, ClusterKey, ClusterStore, ClusterVersion, ObjectKey, ObjectReader,
    ObjectStore, Result, TemplateResolver,
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};
use tracing::{debug, info};

/// A served resource and its scope.
#[derive(Debug, Clone)]
pub struct Served {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Connection to one API server with its discovered resources.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
    served: FxHashMap<String, Served>,
    field_manager: String,
}

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

fn parse_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((g, v)) => GroupVersionKind::gvk(g, v, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// Map an API error onto the reconcile error taxonomy.
pub fn map_kube_err(context: &str, err: kube::Error) -> CairnError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 => CairnError::Conflict(format!("{}: {}", context, resp.message)),
            404 => CairnError::NotFound(format!("{}: {}", context, resp.message)),
            400 | 422 => CairnError::Validation(format!("{}: {}", context, resp.message)),
            _ => CairnError::Platform(format!("{}: {} ({})", context, resp.message, resp.code)),
        },
        other => CairnError::Platform(format!("{}: {}", context, other)),
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// List items come back without apiVersion/kind; restore them.
fn to_json(obj: &DynamicObject, ar: &ApiResource) -> Result<Json> {
    let mut v = serde_json::to_value(obj)?;
    strip_managed_fields(&mut v);
    if let Some(map) = v.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(ar.api_version.clone()));
        map.insert("kind".into(), Json::String(ar.kind.clone()));
    }
    Ok(v)
}

impl KubeHub {
    /// Connect with the default kube config and discover served resources once.
    pub async fn connect(field_manager: &str) -> AnyResult<Self> {
        let client = Client::try_default().await?;
        let discovery = Discovery::new(client.clone()).run().await?;
        let mut served = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                served.insert(gvk_key(&ar.group, &ar.version, &ar.kind), Served { resource: ar.clone(), namespaced });
            }
        }
        info!(resources = served.len(), "discovery complete");
        let hub = Self { client, served, field_manager: field_manager.to_string() };
        hub.lookup(labels::CLUSTER_API_VERSION, labels::CLUSTER_KIND)
            .map_err(|_| anyhow!("{} {} is not served; is the CRD installed?", labels::CLUSTER_API_VERSION, labels::CLUSTER_KIND))?;
        Ok(hub)
    }

    pub fn client(&self) -> &Client { &self.client }

    fn lookup(&self, api_version: &str, kind: &str) -> Result<&Served> {
        let gvk = parse_api_version(api_version, kind);
        self.served
            .get(&gvk_key(&gvk.group, &gvk.version, &gvk.kind))
            .ok_or_else(|| CairnError::Platform(format!("resource {}/{} is not served", api_version, kind)))
    }

    fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<(Api<DynamicObject>, &ApiResource)> {
        let served = self.lookup(api_version, kind)?;
        let api = match (served.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &served.resource),
            (true, None) => return Err(CairnError::Validation(format!("{} is namespaced; namespace required", kind))),
            (false, _) => Api::all_with(self.client.clone(), &served.resource),
        };
        Ok((api, &served.resource))
    }

    fn api_for(&self, key: &ObjectKey) -> Result<(Api<DynamicObject>, &ApiResource)> {
        self.api(&key.api_version, &key.kind, key.namespace.as_deref())
    }

    fn clusters(&self, namespace: &str) -> Api<Cluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectReader for KubeHub {
    async fn list_owned(&self, cluster: &ClusterKey) -> Result<Vec<Json>> {
        let lp = ListParams::default().labels(&labels::instance_selector(&cluster.name));
        let mut out = Vec::new();
        for kind in labels::MANAGED_KINDS.iter().chain(std::iter::once(&"Pod")) {
            let (api, ar) = self.api(labels::api_version_of(kind), kind, Some(&cluster.namespace))?;
            let list = api.list(&lp).await.map_err(|e| map_kube_err(kind, e))?;
            for obj in &list.items {
                out.push(to_json(obj, ar)?);
            }
        }
        debug!(cluster = %cluster, objects = out.len(), "listed owned objects");
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for KubeHub {
    async fn create(&self, obj: &Json) -> Result<Json> {
        let key = ObjectKey::from_json(obj)?;
        let (api, ar) = self.api_for(&key)?;
        let dynobj: DynamicObject = serde_json::from_value(obj.clone())?;
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let created = api.create(&pp, &dynobj).await.map_err(|e| map_kube_err(&key.to_string(), e))?;
        to_json(&created, ar)
    }

    /// Server-side apply, forced: cairn owns the fields it sends. A
    /// resourceVersion in `obj` still makes the write conditional.
    async fn update(&self, obj: &Json) -> Result<Json> {
        let key = ObjectKey::from_json(obj)?;
        let (api, ar) = self.api_for(&key)?;
        let pp = PatchParams::apply(&self.field_manager).force();
        let applied = api.patch(&key.name, &pp, &Patch::Apply(obj)).await.map_err(|e| map_kube_err(&key.to_string(), e))?;
        to_json(&applied, ar)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let (api, _) = self.api_for(key)?;
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_kube_err(&key.to_string(), e))?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for KubeHub {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Cluster>> {
        self.clusters(&key.namespace).get_opt(&key.name).await.map_err(|e| map_kube_err(&key.to_string(), e))
    }

    /// Merge patch of finalizers and labels, conditional on the resourceVersion read this cycle.
    async fn patch_metadata(&self, cluster: &Cluster) -> Result<Cluster> {
        let key = cluster.key();
        let patch = json!({
            "metadata": {
                "resourceVersion": cluster.metadata.resource_version,
                "finalizers": cluster.metadata.finalizers.clone().unwrap_or_default(),
                "labels": cluster.metadata.labels,
            }
        });
        self.clusters(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err(&key.to_string(), e))
    }

    async fn patch_status(&self, cluster: &Cluster) -> Result<()> {
        let key = cluster.key();
        let patch = json!({ "status": cluster.status });
        self.clusters(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err(&key.to_string(), e))?;
        Ok(())
    }
}

#[async_trait]
impl TemplateResolver for KubeHub {
    async fn cluster_definition(&self, name: &str) -> Result<Option<ClusterDefinition>> {
        Api::<ClusterDefinition>::all(self.client.clone()).get_opt(name).await.map_err(|e| map_kube_err(name, e))
    }

    async fn cluster_version(&self, name: &str) -> Result<Option<ClusterVersion>> {
        Api::<ClusterVersion>::all(self.client.clone()).get_opt(name).await.map_err(|e| map_kube_err(name, e))
    }
}
