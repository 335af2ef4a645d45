//! Custom Resource Definitions for MySQL clusters

pub mod status;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use status::{
    ClusterCondition, ClusterState, ConditionStatus, ConditionType, MysqlClusterStatus,
    NodeConditionType, NodeConditions, NodeStatus, RaftRole, RaftStatus,
};

/// API group shared by every resource of the operator.
pub const GROUP: &str = "mysql.radondb.com";

// ============================================================================
// MysqlCluster CRD
// ============================================================================

/// MysqlCluster is a replicated MySQL cluster coordinated by Xenon.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "mysql.radondb.com",
    version = "v1alpha1",
    kind = "MysqlCluster",
    plural = "mysqlclusters",
    shortname = "mysql",
    status = "MysqlClusterStatus",
    namespaced,
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MysqlClusterSpec {
    /// Number of members: 0, 1, 2, 3 or 5
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// MySQL version to run
    #[serde(default = "default_mysql_version")]
    pub mysql_version: String,

    /// Options of the mysql container
    #[serde(default)]
    pub mysql_opts: MysqlOpts,

    /// Options of the xenon container
    #[serde(default)]
    pub xenon_opts: XenonOpts,

    /// Options of the metrics container
    #[serde(default)]
    pub metrics_opts: MetricsOpts,

    /// Pod-level placement and extra containers
    #[serde(default)]
    pub pod_policy: PodPolicy,

    /// Data volume
    #[serde(default)]
    pub persistence: Persistence,

    /// Secret holding ca.crt, tls.crt and tls.key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

fn default_replicas() -> i32 {
    3
}

fn default_mysql_version() -> String {
    "5.7".to_string()
}

/// Options of the mysql container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlOpts {
    #[serde(default = "default_mysql_image")]
    pub image: String,

    /// Replication delay tolerated by the readiness check
    #[serde(default = "default_max_lag_seconds")]
    pub max_lag_seconds: i32,

    #[serde(default, rename = "initTokuDB")]
    pub init_tokudb: bool,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Default for MysqlOpts {
    fn default() -> Self {
        Self {
            image: default_mysql_image(),
            max_lag_seconds: default_max_lag_seconds(),
            init_tokudb: false,
            resources: ResourceRequirements::default(),
        }
    }
}

fn default_mysql_image() -> String {
    "percona/percona-server:5.7.34".to_string()
}

fn default_max_lag_seconds() -> i32 {
    30
}

/// Options of the xenon container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct XenonOpts {
    #[serde(default = "default_xenon_image")]
    pub image: String,

    /// Heartbeats a leader may miss before admitting defeat
    #[serde(default = "default_admit_defeat_hearbeat_count")]
    pub admit_defeat_hearbeat_count: i32,

    /// Election timeout in milliseconds
    #[serde(default = "default_election_timeout")]
    pub election_timeout: i32,

    /// Rebuild members whose data diverged
    #[serde(default)]
    pub enable_auto_rebuild: bool,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Default for XenonOpts {
    fn default() -> Self {
        Self {
            image: default_xenon_image(),
            admit_defeat_hearbeat_count: default_admit_defeat_hearbeat_count(),
            election_timeout: default_election_timeout(),
            enable_auto_rebuild: false,
            resources: ResourceRequirements::default(),
        }
    }
}

fn default_xenon_image() -> String {
    "radondb/xenon:v2.3.0".to_string()
}

fn default_admit_defeat_hearbeat_count() -> i32 {
    5
}

fn default_election_timeout() -> i32 {
    10000
}

/// Options of the metrics exporter container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsOpts {
    #[serde(default = "default_metrics_image")]
    pub image: String,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Default for MetricsOpts {
    fn default() -> Self {
        Self {
            image: default_metrics_image(),
            enabled: false,
            resources: ResourceRequirements::default(),
        }
    }
}

fn default_metrics_image() -> String {
    "prom/mysqld-exporter:v0.12.1".to_string()
}

/// Pod-level policy shared by every member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPolicy {
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    /// Resources of the small helper containers
    #[serde(default)]
    pub extra_resources: ResourceRequirements,

    #[serde(default = "default_sidecar_image")]
    pub sidecar_image: String,

    #[serde(default = "default_busybox_image")]
    pub busybox_image: String,

    #[serde(default)]
    pub slow_log_tail: bool,

    #[serde(default)]
    pub audit_log_tail: bool,
}

impl Default for PodPolicy {
    fn default() -> Self {
        Self {
            image_pull_policy: default_image_pull_policy(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            affinity: None,
            priority_class_name: None,
            tolerations: Vec::new(),
            scheduler_name: None,
            extra_resources: ResourceRequirements::default(),
            sidecar_image: default_sidecar_image(),
            busybox_image: default_busybox_image(),
            slow_log_tail: false,
            audit_log_tail: false,
        }
    }
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_sidecar_image() -> String {
    "radondb/mysql57-sidecar:v2.3.0".to_string()
}

fn default_busybox_image() -> String {
    "busybox:1.32".to_string()
}

/// Persistent data volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(default = "default_size")]
    pub size: String,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            enabled: true,
            access_modes: default_access_modes(),
            storage_class: None,
            size: default_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

fn default_size() -> String {
    "10Gi".to_string()
}

// ============================================================================
// Backup CRD
// ============================================================================

/// Backup of a MysqlCluster taken by the backup sidecar.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "mysql.radondb.com",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    status = "BackupStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Completed","type":"boolean","jsonPath":".status.completed"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Cluster to back up
    pub cluster_name: String,

    /// Member to take the backup from, any follower when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
}

/// Backup status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub completed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Backup {
    /// Whether this backup targets `cluster` and has not finished yet.
    pub fn is_running_for(&self, cluster: &str) -> bool {
        self.spec.cluster_name == cluster && !self.status.as_ref().map_or(false, |s| s.completed)
    }
}
