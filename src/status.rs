//! Status aggregator.
//!
//! One pass lists the member pods, probes the ready ones, refreshes the
//! per-member node entries and pod labels, then derives the next cluster
//! condition and state. The status subresource is written only when the
//! result differs from the status the pass started from, and only onto that
//! same object version.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ResourceKind, LABEL_HEALTHY, LABEL_ROLE};
use crate::context::Services;
use crate::crd::status::{raft_ready as quorum_ready, REASON_RAFT_NOT_READY, REASON_UNSCHEDULABLE};
use crate::crd::{ClusterCondition, ClusterState, MysqlClusterStatus, NodeConditionType, NodeStatus, RaftRole};
use crate::error::Result;
use crate::metrics;
use crate::probe::{Credentials, MemberProbe, MemberReport};
use crate::store::label;

/// What one pass observed about the cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Desired member count from the cluster spec.
    pub desired: i32,
    /// Member count the workload currently asks for, if it exists.
    pub workload_replicas: Option<i32>,
    /// Pods passing container readiness.
    pub ready: i32,
    pub raft_ready: bool,
    /// Scheduler message of an unschedulable member, if any.
    pub unschedulable: Option<String>,
}

/// Next condition proposed by a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    State(ClusterState),
    Error { reason: &'static str, message: String },
}

/// Derive the next candidate from the previous state and an observation.
pub fn next_candidate(previous: Option<ClusterState>, obs: &Observation) -> Candidate {
    use ClusterState::*;

    let Some(previous) = previous else {
        return Candidate::State(Initializing);
    };

    if let Some(message) = &obs.unschedulable {
        return Candidate::Error {
            reason: REASON_UNSCHEDULABLE,
            message: message.clone(),
        };
    }

    if obs.desired == 0 && obs.ready == 0 {
        return Candidate::State(Closed);
    }

    if matches!(previous, Ready | Closed | Error) {
        if let Some(current) = obs.workload_replicas {
            if obs.desired > current {
                return Candidate::State(ScaleOut);
            }
            if obs.desired < current {
                return Candidate::State(ScaleIn);
            }
        }
    }

    if previous == Ready && obs.ready < obs.desired {
        return Candidate::State(Updating);
    }

    if matches!(previous, Ready | Error) {
        return if obs.raft_ready {
            Candidate::State(Ready)
        } else {
            raft_not_ready()
        };
    }

    if obs.desired > 0 && obs.ready == obs.desired && obs.raft_ready {
        Candidate::State(Ready)
    } else {
        Candidate::State(previous)
    }
}

fn raft_not_ready() -> Candidate {
    Candidate::Error {
        reason: REASON_RAFT_NOT_READY,
        message: "consensus group has no single confirmed leader".to_string(),
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod_conditions(pod).any(|c| c.type_ == "ContainersReady" && c.status == "True")
}

fn unschedulable_message(pod: &Pod) -> Option<String> {
    pod_conditions(pod)
        .find(|c| c.type_ == "PodScheduled" && c.reason.as_deref() == Some(REASON_UNSCHEDULABLE))
        .map(|c| c.message.clone().unwrap_or_else(|| format!("pod {} is unschedulable", pod.name_any())))
}

fn pod_conditions(pod: &Pod) -> impl Iterator<Item = &k8s_openapi::api::core::v1::PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
}

/// Aggregates the status of one cluster.
pub struct StatusAggregator<'a> {
    cluster: &'a Cluster,
    services: &'a Services,
}

impl<'a> StatusAggregator<'a> {
    pub fn new(cluster: &'a Cluster, services: &'a Services) -> Self {
        Self { cluster, services }
    }

    /// Run one pass and persist the result. Returns the computed status.
    pub async fn sync(&self) -> Result<MysqlClusterStatus> {
        let now = Utc::now();
        let key = self.cluster.key();
        let stores = &self.services.stores;

        let previous = self.cluster.status().cloned().unwrap_or_default();
        let mut status = previous.clone();

        let pods = stores.pods.list(&self.cluster.selector_labels()).await?;
        let ready: Vec<&Pod> = pods.iter().filter(|pod| is_ready(pod)).collect();
        status.ready_nodes = ready.len() as i32;

        self.refresh_nodes(&mut status, &ready, now).await;

        let workload = stores
            .statefulsets
            .get(&self.cluster.resource_name(ResourceKind::StatefulSet))
            .await?;
        let observation = Observation {
            desired: self.cluster.replicas(),
            workload_replicas: workload.and_then(|sts| sts.spec).and_then(|spec| spec.replicas),
            ready: status.ready_nodes,
            raft_ready: self.raft_ready(&status),
            unschedulable: pods.iter().find_map(unschedulable_message),
        };
        let candidate = next_candidate(previous.state, &observation);
        debug!(cluster = %key, ?observation, ?candidate, "Derived cluster condition");
        self.apply(&mut status, candidate, now);

        if previous.state != status.state {
            info!(
                cluster = %key,
                from = ?previous.state,
                to = ?status.state,
                ready = status.ready_nodes,
                "Cluster state changed"
            );
        }
        metrics::set_cluster_status(&key, status.ready_nodes, status.state);

        self.write(&status).await?;
        Ok(status)
    }

    fn apply(&self, status: &mut MysqlClusterStatus, candidate: Candidate, now: DateTime<Utc>) {
        match candidate {
            Candidate::State(state) => {
                status.append_condition(ClusterCondition::new(state.condition_type(), now));
                status.state = Some(state);
            }
            Candidate::Error { reason, message } => {
                status.append_condition(ClusterCondition::error(reason, message, now));
                let tolerance = self.tolerance(reason);
                let persisted = status.error_age(reason, now).map_or(false, |age| age >= tolerance);
                if persisted {
                    status.state = Some(ClusterState::Error);
                } else if status.state.is_none() {
                    status.state = Some(ClusterState::Initializing);
                }
            }
        }
    }

    fn tolerance(&self, reason: &str) -> Duration {
        let config = &self.services.config.status;
        match reason {
            REASON_UNSCHEDULABLE => config.unschedulable_tolerance,
            REASON_RAFT_NOT_READY => config.raft_not_ready_tolerance,
            _ => Duration::ZERO,
        }
    }

    /// Quorum over the current members only. A single-member cluster is
    /// ready when its one member leads.
    fn raft_ready(&self, status: &MysqlClusterStatus) -> bool {
        let members = self.cluster.member_hostnames();
        let nodes: Vec<&NodeStatus> = status
            .nodes
            .iter()
            .filter(|node| members.contains(&node.name))
            .collect();

        if self.cluster.replicas() == 1 {
            return nodes.len() == 1 && nodes[0].raft_status.role() == RaftRole::Leader;
        }
        quorum_ready(nodes)
    }

    // ========================================================================
    // Member probes
    // ========================================================================

    async fn refresh_nodes(&self, status: &mut MysqlClusterStatus, ready: &[&Pod], now: DateTime<Utc>) {
        let key = self.cluster.key();
        let credentials =
            match Credentials::load(self.cluster, self.services.stores.secrets.as_ref()).await {
                Ok(Some(credentials)) => credentials,
                Ok(None) => {
                    debug!(cluster = %key, "Secret not found, skipping member probes");
                    return;
                }
                Err(e) => {
                    warn!(cluster = %key, error = %e, "Failed to load credentials, skipping member probes");
                    return;
                }
            };

        let probe = MemberProbe {
            connector: self.services.connector.as_ref(),
            consensus: self.services.consensus.as_ref(),
            config: &self.services.config.probe,
            credentials: &credentials,
        };

        for pod in ready {
            let host = self.cluster.pod_hostname(&pod.name_any());
            let allow_write_fix = !self.services.handoffs.in_progress(&key);
            let report = probe.probe(&host, allow_write_fix).await;

            let node = status.node_entry(&host, now);
            record_report(node, &report, now);
            let healthy = node.conditions.is_healthy();

            self.label_pod(pod, report.role(), healthy).await;
        }
    }

    /// Set the `role` and `healthy` labels, writing only on change.
    async fn label_pod(&self, pod: &Pod, role: RaftRole, healthy: bool) {
        let wanted = [
            (LABEL_ROLE, role.pod_label()),
            (LABEL_HEALTHY, if healthy { "yes" } else { "no" }),
        ];
        if wanted.iter().all(|(k, v)| label(pod, k) == Some(*v)) {
            return;
        }

        let name = pod.name_any();
        let mut updated = pod.clone();
        let labels = updated.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in wanted {
            labels.insert(k.to_string(), v.to_string());
        }

        match self.services.stores.pods.replace(&updated).await {
            Ok(_) => debug!(pod = %name, role = role.pod_label(), healthy = healthy, "Updated pod labels"),
            Err(e) if e.is_not_found() => debug!(pod = %name, "Pod vanished before labelling"),
            Err(e) => warn!(pod = %name, error = %e, "Failed to update pod labels"),
        }
    }

    /// Write onto the object the pass started from. Its resourceVersion
    /// makes the API server reject the write with a conflict when another
    /// pass stored a status in between; the caller requeues and recomputes.
    async fn write(&self, status: &MysqlClusterStatus) -> Result<()> {
        let key = self.cluster.key();
        if self.cluster.status() == Some(status) {
            debug!(cluster = %key, "Status unchanged, skipping write");
            return Ok(());
        }

        let mut obj = self.cluster.unwrap().clone();
        obj.status = Some(status.clone());
        match self.services.stores.clusters.replace_status(&obj).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(cluster = %key, "Cluster vanished, dropping status");
                Ok(())
            }
            Err(e) => {
                if e.is_conflict() {
                    debug!(cluster = %key, "Status changed since the pass started");
                }
                Err(e)
            }
        }
    }
}

fn record_report(node: &mut NodeStatus, report: &MemberReport, now: DateTime<Utc>) {
    node.message = report.message.clone();
    node.raft_status = report.raft.clone();
    let conditions = &mut node.conditions;
    conditions.set(NodeConditionType::Leader, report.leader, now);
    conditions.set(NodeConditionType::Lagged, report.lagged, now);
    conditions.set(NodeConditionType::Replicating, report.replicating, now);
    conditions.set(NodeConditionType::ReadOnly, report.read_only, now);
}
