//! Object store seam over the Kubernetes API.
//!
//! The probes, the status aggregator and the syncer only talk to the API
//! server through [`ObjectStore`]. In production every store is a
//! [`KubeStore`] wrapping a namespaced `Api<K>`; tests swap in an in-memory
//! implementation.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::{Backup, MysqlCluster};
use crate::error::Result;

/// How dependents of a deleted object are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Platform default for the kind.
    Default,
    /// Leave dependents running without an owner.
    Orphan,
}

/// Namespaced CRUD over one object kind.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Get an object, `None` when it does not exist.
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// List objects carrying every label of `selector`.
    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object; `metadata.resourceVersion` guards the write.
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource.
    async fn replace_status(&self, obj: &K) -> Result<K>;

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<()>;
}

/// [`ObjectStore`] backed by the API server.
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        Ok(self.api.list(&lp).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        Ok(self.api.replace(&obj.name_any(), &PostParams::default(), obj).await?)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj)?;
        Ok(self
            .api
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<()> {
        let dp = match propagation {
            Propagation::Default => DeleteParams::default(),
            Propagation::Orphan => DeleteParams::orphan(),
        };
        self.api.delete(name, &dp).await?;
        Ok(())
    }
}

/// Every store one cluster's reconciliation touches.
#[derive(Clone)]
pub struct ClusterStores {
    pub clusters: Arc<dyn ObjectStore<MysqlCluster>>,
    pub statefulsets: Arc<dyn ObjectStore<StatefulSet>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
    pub pvcs: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub backups: Arc<dyn ObjectStore<Backup>>,
}

impl ClusterStores {
    /// API-backed stores scoped to `namespace`.
    pub fn kube(client: Client, namespace: &str) -> Self {
        Self {
            clusters: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            statefulsets: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            pods: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            pvcs: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            secrets: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            backups: Arc::new(KubeStore::new(Api::namespaced(client, namespace))),
        }
    }
}

/// Render an equality label selector (`a=1,b=2`).
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` satisfy every pair of `selector`.
pub fn matches_selector(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Read a label value of any object.
pub fn label<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta().labels.as_ref()?.get(key).map(String::as_str)
}
