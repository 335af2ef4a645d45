//! Rolling update integration tests
//!
//! Drives the StatefulSet syncer against in-memory stores and fake members.

#[allow(dead_code)]
mod common;

use common::{data_claim, member_pod, running_backup, statefulset_for, TestEnv};
use kube::ResourceExt;
use mysql_operator::cluster::{Cluster, LABEL_HEALTHY, LABEL_REVISION, LABEL_ROLE};
use mysql_operator::error::Error;
use mysql_operator::syncer::{StatefulSetSyncer, SyncOutcome};

const NEW_IMAGE: &str = "percona/percona-server:5.7.35";

/// A three-member cluster at `rev-1`, leader at ordinal 0, whose workload
/// controller answers every write with a pending update to `rev-2`.
fn rolling_env() -> TestEnv {
    let env = TestEnv::with_cluster(3);
    let cluster = env.cluster();
    env.statefulsets.seed(statefulset_for(&cluster, "rev-1", 3, 3));
    env.seed_members("rev-1", 0);

    env.statefulsets.on_write(|sts| {
        let generation = sts.metadata.generation;
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = sts.status.get_or_insert_with(Default::default);
        status.observed_generation = generation;
        status.replicas = replicas;
        status.ready_replicas = Some(replicas);
        status.updated_replicas = Some(0);
        status.update_revision = Some("rev-2".to_string());
    });
    recreate_pods(&env, "rev-2", None);
    env
}

/// Pods come back after deletion at `revision`, healthy, as followers.
fn recreate_pods(env: &TestEnv, revision: &str, phase: Option<&str>) {
    let revision = revision.to_string();
    let phase = phase.map(str::to_string);
    env.pods.on_delete(move |pod| {
        let mut fresh = pod.clone();
        fresh.metadata.deletion_timestamp = None;
        let labels = fresh.labels_mut();
        labels.insert(LABEL_REVISION.to_string(), revision.clone());
        labels.insert(LABEL_ROLE.to_string(), "follower".to_string());
        labels.insert(LABEL_HEALTHY.to_string(), "yes".to_string());
        if let (Some(phase), Some(status)) = (&phase, fresh.status.as_mut()) {
            status.phase = Some(phase.clone());
        }
        Some(fresh)
    });
}

fn change_image(env: &TestEnv) -> Cluster {
    env.edit_cluster(|c| c.spec.mysql_opts.image = NEW_IMAGE.to_string());
    env.cluster()
}

async fn sync(env: &TestEnv, cluster: &Cluster) -> mysql_operator::Result<SyncOutcome> {
    StatefulSetSyncer::new(cluster, &env.services).sync().await
}

fn pod_deletes(env: &TestEnv) -> Vec<String> {
    env.journal.matching("delete pod/")
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn test_creates_missing_statefulset() {
    let env = TestEnv::with_cluster(3);
    let cluster = env.cluster();

    let outcome = sync(&env, &cluster).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Created);
    let sts = env.statefulsets.get_now("sample-mysql").unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(3));
    assert_eq!(env.journal.entries(), vec!["create statefulset/sample-mysql"]);
}

#[tokio::test]
async fn test_deleting_cluster_is_skipped() {
    let env = TestEnv::with_cluster(3);
    env.edit_cluster(|c| {
        c.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ))
    });

    let outcome = sync(&env, &env.cluster()).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Skipped);
    assert!(env.journal.entries().is_empty());
}

// =============================================================================
// Rolling Update Tests
// =============================================================================

#[tokio::test]
async fn test_rollout_updates_leader_last() {
    let env = rolling_env();
    let cluster = change_image(&env);

    let outcome = sync(&env, &cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Updated);

    assert_eq!(
        pod_deletes(&env),
        vec![
            "delete pod/sample-mysql-1",
            "delete pod/sample-mysql-2",
            "delete pod/sample-mysql-0",
        ]
    );

    let transfer = format!("trytoleader {}", env.host(2));
    let transfer_at = env.journal.position(&transfer).expect("leadership transferred");
    let last_follower = env.journal.position("delete pod/sample-mysql-2").unwrap();
    let leader_delete = env.journal.position("delete pod/sample-mysql-0").unwrap();
    assert!(last_follower < transfer_at && transfer_at < leader_delete);

    let read_only = format!("sql {} SET GLOBAL super_read_only=on", env.host(0));
    let read_only_at = env.journal.position(&read_only).expect("leader made read-only");
    assert!(read_only_at < transfer_at);

    assert_eq!(env.members.role(&env.host(2)).as_deref(), Some("LEADER"));
    for pod in env.pods.all() {
        assert_eq!(pod.labels().get(LABEL_REVISION).map(String::as_str), Some("rev-2"));
    }
    assert!(!env.services.handoffs.in_progress(&cluster.key()));
}

#[tokio::test]
async fn test_noop_pass_resumes_pending_rollout() {
    let env = rolling_env();
    let cluster = env.cluster();
    env.statefulsets.seed(statefulset_for(&cluster, "rev-2", 3, 1));
    env.pods.seed(member_pod(&cluster, 1, "follower", "rev-2", true));

    let outcome = sync(&env, &cluster).await.unwrap();

    assert_eq!(outcome, SyncOutcome::NoOp);
    assert_eq!(
        pod_deletes(&env),
        vec!["delete pod/sample-mysql-2", "delete pod/sample-mysql-0"]
    );
    assert!(env.journal.matching("replace statefulset/").is_empty());
}

#[tokio::test]
async fn test_rollout_waits_for_backup() {
    let env = rolling_env();
    env.backups.seed(running_backup(&env.cluster()));
    let cluster = change_image(&env);

    let err = sync(&env, &cluster).await.unwrap_err();

    assert!(matches!(err, Error::BackupInProgress(ref name) if name == "sample"));
    assert!(err.is_retryable());
    assert!(pod_deletes(&env).is_empty());
}

#[tokio::test]
async fn test_completed_backup_does_not_block() {
    let env = rolling_env();
    let mut backup = running_backup(&env.cluster());
    backup.status = Some(mysql_operator::crd::BackupStatus {
        completed: true,
        ..Default::default()
    });
    env.backups.seed(backup);
    let cluster = change_image(&env);

    assert_eq!(sync(&env, &cluster).await.unwrap(), SyncOutcome::Updated);
    assert_eq!(pod_deletes(&env).len(), 3);
}

#[tokio::test]
async fn test_rollout_refuses_unhealthy_member() {
    let env = rolling_env();
    let cluster = env.cluster();
    env.pods.seed(member_pod(&cluster, 1, "follower", "rev-1", false));
    let cluster = change_image(&env);

    let err = sync(&env, &cluster).await.unwrap_err();

    assert!(matches!(err, Error::MemberUnhealthy(ref pod) if pod == "sample-mysql-1"));
    assert!(pod_deletes(&env).is_empty());
}

#[tokio::test]
async fn test_rollout_deferred_until_members_ready() {
    let env = rolling_env();
    env.statefulsets.on_write(|sts| {
        let generation = sts.metadata.generation;
        let status = sts.status.get_or_insert_with(Default::default);
        status.observed_generation = generation;
        status.ready_replicas = Some(2);
        status.updated_replicas = Some(0);
        status.update_revision = Some("rev-2".to_string());
    });
    let cluster = change_image(&env);

    assert_eq!(sync(&env, &cluster).await.unwrap(), SyncOutcome::Updated);
    assert!(pod_deletes(&env).is_empty());
}

#[tokio::test]
async fn test_recreated_pod_at_old_revision() {
    let env = rolling_env();
    recreate_pods(&env, "rev-1", None);
    let cluster = change_image(&env);

    let err = sync(&env, &cluster).await.unwrap_err();

    assert!(matches!(err, Error::PodRevisionMismatch(ref pod) if pod == "sample-mysql-1"));
    assert_eq!(pod_deletes(&env), vec!["delete pod/sample-mysql-1"]);
}

#[tokio::test]
async fn test_recreated_pod_failed() {
    let env = rolling_env();
    recreate_pods(&env, "rev-2", Some("Failed"));
    let cluster = change_image(&env);

    let err = sync(&env, &cluster).await.unwrap_err();

    assert!(matches!(err, Error::PodFailed(ref pod) if pod == "sample-mysql-1"));
}

#[tokio::test]
async fn test_pod_not_recreated_times_out() {
    let env = rolling_env();
    env.pods.on_delete(|_| None);
    let cluster = change_image(&env);

    let err = sync(&env, &cluster).await.unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(pod_deletes(&env), vec!["delete pod/sample-mysql-1"]);
}

#[tokio::test]
async fn test_transfer_waits_for_binlog() {
    let env = rolling_env();
    env.members.set_binlog_sent(false);
    let cluster = change_image(&env);

    let err = sync(&env, &cluster).await.unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert!(env.journal.matching("trytoleader").is_empty());
    assert!(env.journal.position("delete pod/sample-mysql-0").is_none());
    assert!(!env.services.handoffs.in_progress(&cluster.key()));
}

#[tokio::test]
async fn test_converged_cluster_is_idempotent() {
    let env = rolling_env();
    let cluster = env.cluster();

    assert_eq!(sync(&env, &cluster).await.unwrap(), SyncOutcome::NoOp);
    assert_eq!(sync(&env, &cluster).await.unwrap(), SyncOutcome::NoOp);

    assert!(pod_deletes(&env).is_empty());
    assert!(env.journal.matching("replace").is_empty());
}

// =============================================================================
// Scaling Tests
// =============================================================================

#[tokio::test]
async fn test_scale_in_drops_claims_and_peers() {
    let env = TestEnv::with_cluster(5);
    let five = env.cluster();
    env.statefulsets.seed(statefulset_for(&five, "rev-1", 5, 5));
    env.seed_members("rev-1", 0);
    for ordinal in 0..5 {
        env.pvcs.seed(data_claim(&five, ordinal, "10Gi"));
    }
    env.statefulsets.on_write(|sts| {
        let generation = sts.metadata.generation;
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = sts.status.get_or_insert_with(Default::default);
        status.observed_generation = generation;
        status.replicas = replicas;
        status.updated_replicas = Some(replicas);
    });
    env.edit_cluster(|c| c.spec.replicas = 3);
    let three = env.cluster();

    assert_eq!(sync(&env, &three).await.unwrap(), SyncOutcome::Updated);

    let sts = env.statefulsets.get_now("sample-mysql").unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(3));
    assert_eq!(
        env.journal.matching("delete persistentvolumeclaim/"),
        vec![
            "delete persistentvolumeclaim/data-sample-mysql-3",
            "delete persistentvolumeclaim/data-sample-mysql-4",
        ]
    );
    assert_eq!(
        env.journal.matching("cluster_remove"),
        vec![
            format!("cluster_remove {}:8801", env.host(3)),
            format!("cluster_remove {}:8801", env.host(4)),
        ]
    );
    assert_eq!(env.members.peers(), three.peers());
    assert!(pod_deletes(&env).is_empty());
}

#[tokio::test]
async fn test_scale_out_adds_healthy_peers() {
    let env = scaled_out_env();
    let three = env.cluster();
    env.pods.seed(member_pod(&three, 2, "follower", "rev-1", true));

    assert_eq!(sync(&env, &three).await.unwrap(), SyncOutcome::Updated);

    assert_eq!(
        env.journal.matching("cluster_add"),
        vec![format!("cluster_add {}:8801", env.host(2))]
    );
    assert!(env.journal.matching("cluster_remove").is_empty());
}

/// A two-member cluster scaled to three, whose workload controller reports
/// every write as fully rolled out.
fn scaled_out_env() -> TestEnv {
    let env = TestEnv::with_cluster(2);
    let two = env.cluster();
    env.statefulsets.seed(statefulset_for(&two, "rev-1", 2, 2));
    env.seed_members("rev-1", 0);
    env.statefulsets.on_write(|sts| {
        let generation = sts.metadata.generation;
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = sts.status.get_or_insert_with(Default::default);
        status.observed_generation = generation;
        status.replicas = replicas;
        status.updated_replicas = Some(replicas);
    });
    env.edit_cluster(|c| c.spec.replicas = 3);
    env
}

#[tokio::test]
async fn test_peer_added_once_member_turns_healthy() {
    let env = scaled_out_env();
    let three = env.cluster();
    env.pods.seed(member_pod(&three, 2, "candidate", "rev-1", false));

    assert_eq!(sync(&env, &three).await.unwrap(), SyncOutcome::Updated);
    assert!(env.journal.matching("cluster_add").is_empty());

    env.pods.update(&three.pod_name(2), |pod| {
        pod.labels_mut().insert(LABEL_HEALTHY.to_string(), "yes".to_string());
    });
    assert_eq!(sync(&env, &three).await.unwrap(), SyncOutcome::NoOp);

    let peer = format!("{}:8801", env.host(2));
    assert_eq!(env.journal.matching("cluster_add"), vec![format!("cluster_add {}", peer)]);
    assert!(env.members.peers().contains(&peer));

    assert_eq!(sync(&env, &three).await.unwrap(), SyncOutcome::NoOp);
    assert_eq!(env.journal.matching("cluster_add").len(), 1);
}

#[tokio::test]
async fn test_failed_membership_change_retried() {
    let env = scaled_out_env();
    let three = env.cluster();
    env.pods.seed(member_pod(&three, 2, "follower", "rev-1", true));
    let leader = env.host(0);
    env.members.set_consensus_down(&leader);

    assert_eq!(sync(&env, &three).await.unwrap(), SyncOutcome::Updated);
    assert!(env.journal.matching("cluster_add").is_empty());

    env.members.set_consensus_up(&leader);
    assert_eq!(sync(&env, &three).await.unwrap(), SyncOutcome::NoOp);

    assert_eq!(
        env.journal.matching("cluster_add"),
        vec![format!("cluster_add {}:8801", env.host(2))]
    );
}
