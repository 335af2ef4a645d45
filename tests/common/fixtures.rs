//! Test fixtures for clusters, member pods and the objects around them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Pod,
    PodCondition, PodStatus, ResourceRequirements, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use mysql_operator::cluster::{
    Cluster, ResourceKind, LABEL_HEALTHY, LABEL_REVISION, LABEL_ROLE, SECRET_OPERATOR_PASSWORD,
    SECRET_OPERATOR_USER, SECRET_ROOT_PASSWORD,
};
use mysql_operator::crd::{Backup, BackupSpec, MysqlCluster, MysqlClusterSpec};
use mysql_operator::syncer::podspec::build_statefulset;

pub const CLUSTER_NAME: &str = "sample";
pub const NAMESPACE: &str = "db";
pub const ROOT_PASSWORD: &str = "r00t-pw";

/// A cluster named `sample` in namespace `db`.
pub fn sample_cluster(replicas: i32) -> MysqlCluster {
    let mut spec: MysqlClusterSpec = serde_json::from_str("{}").expect("default spec");
    spec.replicas = replicas;
    let mut obj = MysqlCluster::new(CLUSTER_NAME, spec);
    obj.metadata.namespace = Some(NAMESPACE.to_string());
    obj.metadata.uid = Some("cluster-uid-1".to_string());
    obj
}

fn pod_condition(type_: &str, status: &str) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        ..Default::default()
    }
}

/// A running member pod. `role` is the pod label value (leader, follower,
/// candidate).
pub fn member_pod(cluster: &Cluster, ordinal: i32, role: &str, revision: &str, healthy: bool) -> Pod {
    let mut labels = cluster.selector_labels();
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels.insert(LABEL_HEALTHY.to_string(), if healthy { "yes" } else { "no" }.to_string());
    labels.insert(LABEL_REVISION.to_string(), revision.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(cluster.pod_name(ordinal)),
            namespace: Some(cluster.namespace()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![
                pod_condition("PodScheduled", "True"),
                pod_condition("ContainersReady", "True"),
                pod_condition("Ready", "True"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A member pod the scheduler cannot place.
pub fn unschedulable_pod(cluster: &Cluster, ordinal: i32, message: &str) -> Pod {
    let mut pod = member_pod(cluster, ordinal, "candidate", "rev-1", false);
    pod.status = Some(PodStatus {
        phase: Some("Pending".to_string()),
        conditions: Some(vec![PodCondition {
            reason: Some("Unschedulable".to_string()),
            message: Some(message.to_string()),
            ..pod_condition("PodScheduled", "False")
        }]),
        ..Default::default()
    });
    pod
}

pub fn secret_data(user: &str, password: &str, root_password: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SECRET_OPERATOR_USER.to_string(), user.to_string()),
        (SECRET_OPERATOR_PASSWORD.to_string(), password.to_string()),
        (SECRET_ROOT_PASSWORD.to_string(), root_password.to_string()),
    ])
}

/// The cluster secret with operator and root credentials.
pub fn secret(cluster: &Cluster) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(cluster.resource_name(ResourceKind::Secret)),
            namespace: Some(cluster.namespace()),
            ..Default::default()
        },
        string_data: Some(secret_data("operator", "0p-pw", ROOT_PASSWORD)),
        ..Default::default()
    }
}

/// The desired workload with a settled status at `revision`.
pub fn statefulset_for(cluster: &Cluster, revision: &str, ready: i32, updated: i32) -> StatefulSet {
    let mut sts = build_statefulset(cluster);
    sts.status = Some(StatefulSetStatus {
        replicas: cluster.replicas(),
        ready_replicas: Some(ready),
        updated_replicas: Some(updated),
        current_revision: Some("rev-1".to_string()),
        update_revision: Some(revision.to_string()),
        observed_generation: Some(1),
        ..Default::default()
    });
    sts
}

fn storage(size: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])
}

/// Data claim of member `ordinal`, bound at `size`.
pub fn data_claim(cluster: &Cluster, ordinal: i32, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(format!("data-{}", cluster.pod_name(ordinal))),
            namespace: Some(cluster.namespace()),
            labels: Some(cluster.selector_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(storage(size)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: Some(storage(size)),
            ..Default::default()
        }),
    }
}

/// A backup of `cluster` that has not completed.
pub fn running_backup(cluster: &Cluster) -> Backup {
    let mut backup = Backup::new(
        "nightly",
        BackupSpec {
            cluster_name: cluster.name(),
            host_name: None,
        },
    );
    backup.metadata.namespace = Some(cluster.namespace());
    backup
}
