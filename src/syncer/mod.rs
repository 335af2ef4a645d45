//! Topology syncer.
//!
//! [`StatefulSetSyncer`] keeps the cluster's StatefulSet in line with the
//! desired one built by [`podspec::build_statefulset`]. The workload uses the
//! `OnDelete` strategy, so rolling members onto a new revision is driven
//! here: followers first in ordinal order, then a leadership transfer to the
//! last updated follower, then the old leader.

pub mod merge;
pub mod podspec;
pub mod storage;

use std::collections::HashSet;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::{ordinal_of, Cluster, ResourceKind, LABEL_HEALTHY, LABEL_REVISION, LABEL_ROLE};
use crate::context::Services;
use crate::crd::RaftRole;
use crate::error::{Error, Result};
use crate::metrics;
use crate::probe::{self, sql, Credentials, SqlRunner};
use crate::retry::poll;
use crate::store::{label, Propagation};

const READ_ONLY_ON: &str = "SET GLOBAL super_read_only=on";

/// What a sync pass did to the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    NoOp,
    Updated,
    /// Recreated around a storage expansion.
    Expanded,
    /// Skipped because the cluster is being deleted.
    Skipped,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Created => "created",
            SyncOutcome::NoOp => "unchanged",
            SyncOutcome::Updated => "updated",
            SyncOutcome::Expanded => "expanded",
            SyncOutcome::Skipped => "skipped",
        }
    }
}

/// Whether the workload still has members on an older revision.
pub fn update_pending(sts: &StatefulSet) -> bool {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let updated = sts.status.as_ref().and_then(|s| s.updated_replicas).unwrap_or(0);
    updated < desired
}

fn ready_replicas(sts: &StatefulSet) -> i32 {
    sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
}

fn update_revision(sts: &StatefulSet) -> Option<String> {
    sts.status.as_ref()?.update_revision.clone()
}

fn is_healthy(pod: &Pod) -> bool {
    label(pod, LABEL_HEALTHY) == Some("yes")
}

/// Syncs the StatefulSet of one cluster.
pub struct StatefulSetSyncer<'a> {
    cluster: &'a Cluster,
    services: &'a Services,
}

impl<'a> StatefulSetSyncer<'a> {
    pub fn new(cluster: &'a Cluster, services: &'a Services) -> Self {
        Self { cluster, services }
    }

    /// Create, update or roll the workload.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        match self.sync_inner().await {
            Err(Error::OwnerDeleted) => {
                debug!(cluster = %self.cluster.key(), "Cluster is being deleted, skipping sync");
                Ok(SyncOutcome::Skipped)
            }
            other => other,
        }
    }

    async fn sync_inner(&self) -> Result<SyncOutcome> {
        if self.cluster.is_being_deleted() {
            return Err(Error::OwnerDeleted);
        }

        let key = self.cluster.key();
        let stores = &self.services.stores;
        let name = self.cluster.resource_name(ResourceKind::StatefulSet);
        let desired = podspec::build_statefulset(self.cluster);

        let Some(live) = stores.statefulsets.get(&name).await? else {
            stores.statefulsets.create(&desired).await?;
            info!(cluster = %key, statefulset = %name, "Created StatefulSet");
            return Ok(SyncOutcome::Created);
        };

        let merged = merge::merge_into(&live, &desired)?;
        if !merged.changed {
            if update_pending(&live) {
                self.rollout(&live).await?;
            }
            self.reconcile_membership().await;
            return Ok(SyncOutcome::NoOp);
        }

        if let Err(e) = stores.statefulsets.replace(&merged.object).await {
            return self.handle_rejected_update(e, &live, &desired).await;
        }
        info!(cluster = %key, statefulset = %name, "Updated StatefulSet");

        let observed = self.wait_observed(&name).await?;
        if update_pending(&observed) {
            self.rollout(&observed).await?;
        }

        let removed = storage::cleanup_excess_claims(self.cluster, stores).await?;
        if removed > 0 {
            info!(cluster = %key, claims = removed, "Removed claims of scaled-in members");
        }

        self.reconcile_membership().await;
        Ok(SyncOutcome::Updated)
    }

    /// A rejected replace is retried as a storage expansion when the only
    /// way forward is growing the data claims.
    async fn handle_rejected_update(
        &self,
        error: Error,
        live: &StatefulSet,
        desired: &StatefulSet,
    ) -> Result<SyncOutcome> {
        if !error.is_invalid() {
            return Err(error);
        }
        let grows = match (storage::requested_storage(desired), storage::requested_storage(live)) {
            (Some(new), Some(old)) => storage::is_strictly_larger(&new, &old),
            _ => false,
        };
        if !grows {
            return Err(error);
        }

        let key = self.cluster.key();
        info!(cluster = %key, "StatefulSet update rejected, expanding storage");
        storage::expand(
            self.cluster,
            &self.services.stores,
            desired,
            self.services.config.storage.resize_wait,
        )
        .await?;
        metrics::record_storage_expansion(&key);
        Ok(SyncOutcome::Expanded)
    }

    /// Wait until the workload controller has seen the latest generation and
    /// return the refreshed object.
    async fn wait_observed(&self, name: &str) -> Result<StatefulSet> {
        let statefulsets = &self.services.stores.statefulsets;
        let what = format!("statefulset {} to observe its generation", name);
        poll(&what, self.services.config.rollout.generation_wait, move || async move {
            Ok(statefulsets.get(name).await?.map_or(false, |sts| {
                let observed = sts.status.as_ref().and_then(|s| s.observed_generation);
                match (observed, sts.metadata.generation) {
                    (Some(observed), Some(generation)) => observed >= generation,
                    _ => false,
                }
            }))
        })
        .await?;

        statefulsets
            .get(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("statefulset {}", name)))
    }

    // ========================================================================
    // Rolling update
    // ========================================================================

    async fn rollout(&self, sts: &StatefulSet) -> Result<()> {
        let key = self.cluster.key();
        let replicas = self.cluster.replicas();
        let stores = &self.services.stores;

        if ready_replicas(sts) < replicas {
            info!(
                cluster = %key,
                ready = ready_replicas(sts),
                replicas = replicas,
                "Not every member is ready, deferring rolling update"
            );
            return Ok(());
        }

        let Some(revision) = update_revision(sts) else {
            debug!(cluster = %key, "StatefulSet has no update revision yet");
            return Ok(());
        };

        let backups = stores.backups.list(&Default::default()).await?;
        if backups.iter().any(|b| b.is_running_for(&self.cluster.name())) {
            return Err(Error::BackupInProgress(self.cluster.name()));
        }

        let mut pods: Vec<Pod> = stores
            .pods
            .list(&self.cluster.selector_labels())
            .await?
            .into_iter()
            .filter(|pod| !self.is_exempt(&pod.name_any()))
            .collect();
        pods.sort_by_key(|pod| ordinal_of(&pod.name_any()));

        for pod in &pods {
            self.wait_healthy(&pod.name_any()).await?;
        }

        info!(cluster = %key, revision = %revision, members = pods.len(), "Starting rolling update");

        let leader = pods
            .iter()
            .find(|pod| label(*pod, LABEL_ROLE) == Some(RaftRole::Leader.pod_label()));
        let leader_name = leader.map(|pod| pod.name_any());

        let mut last_follower = None;
        for pod in pods.iter().filter(|pod| Some(pod.name_any()) != leader_name) {
            self.apply_and_wait(pod, &revision).await?;
            last_follower = Some(pod.name_any());
        }

        if let Some(leader) = leader {
            let needs_update = label(leader, LABEL_REVISION) != Some(revision.as_str());
            if let (true, Some(follower)) = (needs_update, last_follower.as_deref()) {
                self.transfer_leadership(&leader.name_any(), follower).await?;
            }
            self.apply_and_wait(leader, &revision).await?;
        }

        info!(cluster = %key, revision = %revision, "Rolling update finished");
        Ok(())
    }

    /// Members beyond the desired count are on their way out.
    fn is_exempt(&self, pod_name: &str) -> bool {
        ordinal_of(pod_name).map_or(false, |ordinal| ordinal >= self.cluster.replicas())
    }

    async fn wait_healthy(&self, pod_name: &str) -> Result<()> {
        let pods = &self.services.stores.pods;
        let what = format!("pod {} to be healthy", pod_name);
        poll(&what, self.services.config.rollout.healthy_wait, move || async move {
            Ok(pods.get(pod_name).await?.map_or(false, |pod| is_healthy(&pod)))
        })
        .await
        .map_err(|e| match e {
            Error::Timeout(_) => Error::MemberUnhealthy(pod_name.to_string()),
            other => other,
        })
    }

    /// Delete `pod` unless it already runs `revision`, then wait for its
    /// replacement to come back healthy at that revision.
    async fn apply_and_wait(&self, pod: &Pod, revision: &str) -> Result<()> {
        let name = pod.name_any();
        if self.is_exempt(&name) {
            return Ok(());
        }
        let key = self.cluster.key();
        let pods = &self.services.stores.pods;

        let mut replaced_uid = None;
        if label(pod, LABEL_REVISION) == Some(revision) {
            debug!(cluster = %key, pod = %name, "Pod already runs the update revision");
        } else if pod.metadata.deletion_timestamp.is_some() {
            debug!(cluster = %key, pod = %name, "Pod is already being deleted");
            replaced_uid = pod.metadata.uid.clone();
        } else {
            info!(cluster = %key, pod = %name, revision = %revision, "Deleting pod to update it");
            match pods.delete(&name, Propagation::Default).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
            replaced_uid = pod.metadata.uid.clone();
            metrics::record_member_update(&key);
        }

        let what = format!("pod {} to be updated", name);
        let (pod_name, replaced_uid) = (name.as_str(), replaced_uid.as_deref());
        poll(&what, self.services.config.rollout.pod_wait, move || async move {
            let Some(current) = pods.get(pod_name).await? else {
                return Ok(false);
            };
            if replaced_uid.is_some() && current.metadata.uid.as_deref() == replaced_uid {
                return Ok(false);
            }
            let phase = current.status.as_ref().and_then(|s| s.phase.as_deref());
            if phase == Some("Failed") {
                return Err(Error::PodFailed(pod_name.to_string()));
            }
            if !is_healthy(&current) {
                return Ok(false);
            }
            if label(&current, LABEL_REVISION) == Some(revision) {
                Ok(true)
            } else {
                Err(Error::PodRevisionMismatch(pod_name.to_string()))
            }
        })
        .await?;

        info!(cluster = %key, pod = %name, "Pod updated");
        Ok(())
    }

    // ========================================================================
    // Leadership transfer
    // ========================================================================

    async fn credentials(&self) -> Result<Credentials> {
        Credentials::load(self.cluster, self.services.stores.secrets.as_ref())
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("secret {}", self.cluster.resource_name(ResourceKind::Secret)))
            })
    }

    /// Make the leader read-only, let it ship its remaining binlog and hand
    /// leadership to `follower`.
    async fn transfer_leadership(&self, leader: &str, follower: &str) -> Result<()> {
        let key = self.cluster.key();
        let config = &self.services.config;
        let _handoff = self.services.handoffs.begin(&key);
        let credentials = self.credentials().await?;

        let leader_host = self.cluster.pod_hostname(leader);
        let runner = probe::connect(
            self.services.connector.as_ref(),
            &credentials,
            &leader_host,
            &config.probe,
        )
        .await?;
        let runner: &Mutex<Box<dyn SqlRunner>> = &Mutex::new(runner);

        info!(cluster = %key, leader = %leader, "Switching leader to read-only");
        let what = format!("leader {} to send all binlog", leader);
        poll(&what, config.rollout.binlog_drain, move || async move {
            let mut session = runner.lock().await;
            let session: &mut dyn SqlRunner = &mut **session;
            session.run_query(READ_ONLY_ON).await?;
            sql::check_processlist(session).await
        })
        .await?;

        info!(cluster = %key, from = %leader, to = %follower, "Transferring leadership");
        let consensus = self.services.consensus.as_ref();
        let follower_host = &self.cluster.pod_hostname(follower);
        let root_password = credentials.root_password.as_str();
        let what = format!("{} to become leader", follower);
        poll(&what, config.rollout.leader_transfer, move || async move {
            match consensus.raft_status(follower_host, root_password).await {
                Ok(view) if view.role() == RaftRole::Leader => return Ok(true),
                Ok(_) => {}
                Err(e) => {
                    warn!(host = %follower_host, error = %e, "Failed to check the member role");
                    return Ok(false);
                }
            }
            if let Err(e) = consensus.try_to_leader(follower_host, root_password).await {
                debug!(host = %follower_host, error = %e, "Election request failed");
            }
            Ok(false)
        })
        .await?;

        metrics::record_leader_transfer(&key);
        info!(cluster = %key, leader = %follower, "Leadership transferred");
        Ok(())
    }

    // ========================================================================
    // Consensus membership
    // ========================================================================

    /// Bring the leader's Raft membership in line with the member pods:
    /// drop peers of removed members and add healthy members it lacks.
    /// Runs after every Updated or NoOp pass, so a failed call or a member
    /// that turns healthy later is picked up by a following pass. Failures
    /// are logged.
    async fn reconcile_membership(&self) {
        if let Err(e) = self.try_reconcile_membership().await {
            warn!(cluster = %self.cluster.key(), error = %e, "Failed to reconcile consensus membership");
        }
    }

    async fn try_reconcile_membership(&self) -> Result<()> {
        let key = self.cluster.key();
        let pods = self.services.stores.pods.list(&self.cluster.selector_labels()).await?;
        let Some(leader) = pods
            .iter()
            .find(|pod| label(*pod, LABEL_ROLE) == Some(RaftRole::Leader.pod_label()))
        else {
            debug!(cluster = %key, "No leader, skipping membership reconcile");
            return Ok(());
        };
        let Some(credentials) =
            Credentials::load(self.cluster, self.services.stores.secrets.as_ref()).await?
        else {
            return Ok(());
        };

        let consensus = self.services.consensus.as_ref();
        let password = credentials.root_password.as_str();
        let host = self.cluster.pod_hostname(&leader.name_any());
        consensus.ping(&host, password).await?;
        let view = consensus.raft_status(&host, password).await?;
        let known: HashSet<&str> = view.nodes.iter().map(String::as_str).collect();

        let stale: Vec<&String> = view
            .nodes
            .iter()
            .filter(|peer| self.is_stale_peer(peer))
            .collect();
        for peer in stale {
            info!(cluster = %key, peer = %peer, "Removing consensus peer");
            consensus.cluster_remove(&host, password, peer).await?;
        }

        let ready: HashSet<String> = pods
            .iter()
            .filter(|pod| is_healthy(pod))
            .map(|pod| self.cluster.pod_hostname(&pod.name_any()))
            .collect();
        for (hostname, peer) in self.cluster.member_hostnames().iter().zip(self.cluster.peers()) {
            if known.contains(peer.as_str()) || !ready.contains(hostname) {
                continue;
            }
            info!(cluster = %key, peer = %peer, "Adding consensus peer");
            consensus.cluster_add(&host, password, &peer).await?;
        }
        Ok(())
    }

    /// A peer belonging to this cluster whose member ordinal is out of range.
    fn is_stale_peer(&self, peer: &str) -> bool {
        let pod = peer.split('.').next().unwrap_or_default();
        let prefix = format!("{}-", self.cluster.resource_name(ResourceKind::StatefulSet));
        pod.starts_with(&prefix) && self.is_exempt(pod)
    }
}
