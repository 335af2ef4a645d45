//! Cluster model.
//!
//! [`Cluster`] wraps one `MysqlCluster` object and derives everything the
//! probes and syncers need from it: resource names, labels, member hostnames
//! and the owner reference. It performs no I/O.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::{MysqlCluster, MysqlClusterSpec, MysqlClusterStatus, GROUP};
use crate::error::{Error, Result};
use crate::syncer::storage::parse_quantity;

pub const MYSQL_PORT: i32 = 3306;
pub const XENON_PORT: i32 = 8801;
pub const XENON_PEER_PORT: u16 = 6601;
pub const METRICS_PORT: i32 = 9104;

pub const LABEL_CLUSTER: &str = "mysql.radondb.com/cluster";
pub const LABEL_ROLE: &str = "role";
pub const LABEL_HEALTHY: &str = "healthy";
pub const LABEL_REVISION: &str = "controller-revision-hash";

pub const SECRET_OPERATOR_USER: &str = "operator-user";
pub const SECRET_OPERATOR_PASSWORD: &str = "operator-password";
pub const SECRET_ROOT_PASSWORD: &str = "root-password";

/// Member counts a consensus group of this kind can run with.
pub const ALLOWED_REPLICAS: [i32; 5] = [0, 1, 2, 3, 5];

/// Kinds of objects owned by a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    StatefulSet,
    HeadlessService,
    ConfigMap,
    PodDisruptionBudget,
    Secret,
    LeaderService,
    FollowerService,
    MetricsService,
    ServiceAccount,
}

/// Read-mostly view of a cluster's desired and observed state.
#[derive(Debug, Clone)]
pub struct Cluster {
    inner: MysqlCluster,
}

impl Cluster {
    pub fn new(inner: MysqlCluster) -> Self {
        Self { inner }
    }

    /// The wrapped object, for handing to the API client.
    pub fn unwrap(&self) -> &MysqlCluster {
        &self.inner
    }

    pub fn name(&self) -> String {
        self.inner.name_any()
    }

    pub fn namespace(&self) -> String {
        self.inner.namespace().unwrap_or_default()
    }

    /// `namespace/name`, used in logs and metrics.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn spec(&self) -> &MysqlClusterSpec {
        &self.inner.spec
    }

    pub fn status(&self) -> Option<&MysqlClusterStatus> {
        self.inner.status.as_ref()
    }

    pub fn replicas(&self) -> i32 {
        self.inner.spec.replicas
    }

    pub fn is_being_deleted(&self) -> bool {
        self.inner.meta().deletion_timestamp.is_some()
    }

    pub fn resource_name(&self, kind: ResourceKind) -> String {
        let name = self.name();
        match kind {
            ResourceKind::StatefulSet
            | ResourceKind::HeadlessService
            | ResourceKind::ConfigMap
            | ResourceKind::PodDisruptionBudget => format!("{}-mysql", name),
            ResourceKind::Secret => format!("{}-secret", name),
            ResourceKind::LeaderService => format!("{}-leader", name),
            ResourceKind::FollowerService => format!("{}-follower", name),
            ResourceKind::MetricsService => format!("{}-metrics", name),
            ResourceKind::ServiceAccount => name,
        }
    }

    /// Labels carried by every object of the cluster.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert("app.kubernetes.io/version".to_string(), self.spec().mysql_version.clone());
        labels.insert("app.kubernetes.io/component".to_string(), "database".to_string());
        labels
    }

    /// Stable subset used in selectors, never changed after creation.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let name = self.name();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER.to_string(), name.clone());
        labels.insert("app.kubernetes.io/name".to_string(), "mysql".to_string());
        labels.insert("app.kubernetes.io/instance".to_string(), name);
        labels.insert("app.kubernetes.io/managed-by".to_string(), GROUP.to_string());
        labels
    }

    pub fn pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.resource_name(ResourceKind::StatefulSet), ordinal)
    }

    /// Fully qualified hostname of a member pod.
    pub fn pod_hostname(&self, pod_name: &str) -> String {
        format!(
            "{}.{}.{}",
            pod_name,
            self.resource_name(ResourceKind::HeadlessService),
            self.namespace()
        )
    }

    /// Hostnames of every desired member, ordinal order.
    pub fn member_hostnames(&self) -> Vec<String> {
        (0..self.replicas().max(0))
            .map(|i| self.pod_hostname(&self.pod_name(i)))
            .collect()
    }

    /// Consensus peer addresses of every desired member.
    pub fn peers(&self) -> Vec<String> {
        self.member_hostnames()
            .into_iter()
            .map(|host| format!("{}:{}", host, XENON_PORT))
            .collect()
    }

    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.inner.controller_owner_ref(&())
    }

    /// Reject specs the consensus group cannot run with.
    pub fn validate(&self) -> Result<()> {
        let replicas = self.replicas();
        if !ALLOWED_REPLICAS.contains(&replicas) {
            return Err(Error::InvalidSpec(format!(
                "replicas must be one of {:?}, got {}",
                ALLOWED_REPLICAS, replicas
            )));
        }

        let persistence = &self.spec().persistence;
        if persistence.enabled && parse_quantity(&persistence.size).is_none() {
            return Err(Error::InvalidSpec(format!(
                "persistence.size {:?} is not a valid quantity",
                persistence.size
            )));
        }

        Ok(())
    }
}

/// Ordinal suffix of a member pod or claim name (`sample-mysql-2` is 2).
pub fn ordinal_of(name: &str) -> Option<i32> {
    name.rsplit_once('-')?.1.parse().ok()
}
