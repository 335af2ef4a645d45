//! Observed state of a MysqlCluster.
//!
//! The status is owned by the operator. Conditions form a capped history that
//! only grows along the transitions allowed by [`transition_allowed`]; node
//! entries accumulate per hostname and are never pruned.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound of the condition history.
pub const MAX_CONDITIONS: usize = 10;

/// Reason used when a member pod cannot be scheduled.
pub const REASON_UNSCHEDULABLE: &str = "Unschedulable";

/// Reason used when the consensus group has no single confirmed leader.
pub const REASON_RAFT_NOT_READY: &str = "RaftNotReady";

/// Observed state of a MysqlCluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlClusterStatus {
    /// Number of members passing container readiness
    #[serde(default)]
    pub ready_nodes: i32,

    /// Coarse lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClusterState>,

    /// Capped condition history, oldest first
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// One entry per member hostname ever observed
    #[serde(default)]
    pub nodes: Vec<NodeStatus>,
}

/// Cluster lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ClusterState {
    Initializing,
    Updating,
    Ready,
    Closed,
    ScaleIn,
    ScaleOut,
    Error,
}

impl ClusterState {
    pub const ALL: [ClusterState; 7] = [
        ClusterState::Initializing,
        ClusterState::Updating,
        ClusterState::Ready,
        ClusterState::Closed,
        ClusterState::ScaleIn,
        ClusterState::ScaleOut,
        ClusterState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Initializing => "Initializing",
            ClusterState::Updating => "Updating",
            ClusterState::Ready => "Ready",
            ClusterState::Closed => "Closed",
            ClusterState::ScaleIn => "ScaleIn",
            ClusterState::ScaleOut => "ScaleOut",
            ClusterState::Error => "Error",
        }
    }

    /// The condition type recorded when the cluster is in this state.
    pub fn condition_type(&self) -> ConditionType {
        match self {
            ClusterState::Initializing => ConditionType::Initializing,
            ClusterState::Updating => ConditionType::Updating,
            ClusterState::Ready => ConditionType::Ready,
            ClusterState::Closed => ConditionType::Closed,
            ClusterState::ScaleIn => ConditionType::ScaleIn,
            ClusterState::ScaleOut => ConditionType::ScaleOut,
            ClusterState::Error => ConditionType::Error,
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a cluster condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Initializing,
    Updating,
    Ready,
    Closed,
    Error,
    ScaleIn,
    ScaleOut,
}

/// Status of a condition (True, False, Unknown).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// One entry of the cluster condition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Status (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterCondition {
    pub fn new(condition_type: ConditionType, now: DateTime<Utc>) -> Self {
        Self {
            condition_type,
            status: ConditionStatus::True,
            last_transition_time: now,
            reason: None,
            message: None,
        }
    }

    pub fn error(reason: &str, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            ..Self::new(ConditionType::Error, now)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Decide whether `next` may follow `last` in the condition history.
///
/// | last    | accepted next                              |
/// |---------|--------------------------------------------|
/// | Error   | Ready, Closed, Error with another reason   |
/// | Closed  | ScaleOut, Updating                         |
/// | Ready   | anything but Ready with the same message   |
/// | other   | Ready, Closed, Error                       |
pub fn transition_allowed(last: &ClusterCondition, next: &ClusterCondition) -> bool {
    use ConditionType::*;

    match last.condition_type {
        Error => match next.condition_type {
            Ready | Closed => true,
            Error => last.reason != next.reason,
            _ => false,
        },
        Closed => matches!(next.condition_type, ScaleOut | Updating),
        Ready => !(next.condition_type == Ready && last.message == next.message),
        _ => matches!(next.condition_type, Ready | Closed | Error),
    }
}

impl MysqlClusterStatus {
    /// Append `candidate` if the transition table accepts it, trimming the
    /// history to [`MAX_CONDITIONS`] from the oldest end. Returns whether the
    /// condition was recorded.
    pub fn append_condition(&mut self, candidate: ClusterCondition) -> bool {
        let accepted = match self.conditions.last() {
            None => true,
            Some(last) => transition_allowed(last, &candidate),
        };
        if !accepted {
            return false;
        }

        self.conditions.push(candidate);
        if self.conditions.len() > MAX_CONDITIONS {
            let excess = self.conditions.len() - MAX_CONDITIONS;
            self.conditions.drain(..excess);
        }
        true
    }

    pub fn last_condition(&self) -> Option<&ClusterCondition> {
        self.conditions.last()
    }

    /// How long the latest condition has been an Error with `reason`.
    pub fn error_age(&self, reason: &str, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let last = self.conditions.last()?;
        if last.condition_type != ConditionType::Error || last.reason.as_deref() != Some(reason) {
            return None;
        }
        (now - last.last_transition_time).to_std().ok().or(Some(std::time::Duration::ZERO))
    }

    /// True iff exactly one node reports LEADER and at least two nodes in
    /// total report LEADER or FOLLOWER.
    pub fn raft_ready(&self) -> bool {
        raft_ready(self.nodes.iter())
    }

    /// Find the entry for `name`, appending a fresh one when it is new.
    pub fn node_entry(&mut self, name: &str, now: DateTime<Utc>) -> &mut NodeStatus {
        let index = match self.nodes.iter().position(|n| n.name == name) {
            Some(index) => index,
            None => {
                self.nodes.push(NodeStatus::new(name, now));
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[index]
    }

    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Quorum check over an arbitrary set of node entries.
pub fn raft_ready<'a>(nodes: impl IntoIterator<Item = &'a NodeStatus>) -> bool {
    let mut leaders = 0;
    let mut confirmed = 0;
    for node in nodes {
        match node.raft_status.role() {
            RaftRole::Leader => {
                leaders += 1;
                confirmed += 1;
            }
            RaftRole::Follower => confirmed += 1,
            _ => {}
        }
    }
    leaders == 1 && confirmed >= 2
}

/// Status of one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Fully qualified pod hostname
    pub name: String,

    /// Last probe error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Consensus view of this member
    #[serde(default)]
    pub raft_status: RaftStatus,

    /// Lagged, Leader, ReadOnly and Replicating, in that order
    #[serde(default)]
    #[schemars(with = "Vec<NodeCondition>")]
    pub conditions: NodeConditions,
}

impl NodeStatus {
    pub fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            message: None,
            raft_status: RaftStatus::default(),
            conditions: NodeConditions::unknown(now),
        }
    }
}

/// Consensus roles reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
    Idle,
    Unknown,
}

impl RaftRole {
    pub fn parse(state: &str) -> Self {
        match state {
            "LEADER" => RaftRole::Leader,
            "FOLLOWER" => RaftRole::Follower,
            "CANDIDATE" => RaftRole::Candidate,
            "IDLE" => RaftRole::Idle,
            _ => RaftRole::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RaftRole::Leader => "LEADER",
            RaftRole::Follower => "FOLLOWER",
            RaftRole::Candidate => "CANDIDATE",
            RaftRole::Idle => "IDLE",
            RaftRole::Unknown => "UNKNOWN",
        }
    }

    /// Value of the `role` pod label for this consensus role.
    pub fn pod_label(&self) -> &'static str {
        match self {
            RaftRole::Leader => "leader",
            RaftRole::Follower => "follower",
            _ => "candidate",
        }
    }
}

/// Raft view reported by a member's consensus agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RaftStatus {
    /// One of LEADER, FOLLOWER, CANDIDATE, IDLE, UNKNOWN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,

    /// Leader known to this member
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leader: String,

    /// Peers known to this member
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

impl RaftStatus {
    pub fn role(&self) -> RaftRole {
        RaftRole::parse(&self.role)
    }
}

/// Type of a node condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodeConditionType {
    Lagged,
    Leader,
    ReadOnly,
    Replicating,
}

/// Wire form of a single node condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: NodeConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
}

/// A status together with the time it last changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionSlot {
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
}

impl ConditionSlot {
    fn unknown(now: DateTime<Utc>) -> Self {
        Self {
            status: ConditionStatus::Unknown,
            last_transition_time: now,
        }
    }
}

/// The four per-member conditions addressed by name.
///
/// Serialized as the legacy four-element array so existing status readers
/// keep working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<NodeCondition>", into = "Vec<NodeCondition>")]
pub struct NodeConditions {
    pub lagged: ConditionSlot,
    pub leader: ConditionSlot,
    pub read_only: ConditionSlot,
    pub replicating: ConditionSlot,
}

impl Default for NodeConditions {
    fn default() -> Self {
        Self::unknown(Utc::now())
    }
}

impl NodeConditions {
    pub fn unknown(now: DateTime<Utc>) -> Self {
        Self {
            lagged: ConditionSlot::unknown(now),
            leader: ConditionSlot::unknown(now),
            read_only: ConditionSlot::unknown(now),
            replicating: ConditionSlot::unknown(now),
        }
    }

    pub fn get(&self, condition_type: NodeConditionType) -> ConditionStatus {
        self.slot(condition_type).status
    }

    fn slot(&self, condition_type: NodeConditionType) -> &ConditionSlot {
        match condition_type {
            NodeConditionType::Lagged => &self.lagged,
            NodeConditionType::Leader => &self.leader,
            NodeConditionType::ReadOnly => &self.read_only,
            NodeConditionType::Replicating => &self.replicating,
        }
    }

    fn slot_mut(&mut self, condition_type: NodeConditionType) -> &mut ConditionSlot {
        match condition_type {
            NodeConditionType::Lagged => &mut self.lagged,
            NodeConditionType::Leader => &mut self.leader,
            NodeConditionType::ReadOnly => &mut self.read_only,
            NodeConditionType::Replicating => &mut self.replicating,
        }
    }

    /// Set a condition, moving its transition time only on change.
    pub fn set(
        &mut self,
        condition_type: NodeConditionType,
        status: ConditionStatus,
        now: DateTime<Utc>,
    ) -> bool {
        let slot = self.slot_mut(condition_type);
        if slot.status == status {
            return false;
        }
        slot.status = status;
        slot.last_transition_time = now;
        true
    }

    /// Health as consumed by the rolling update: not lagged, and either a
    /// read-only replicating non-leader or a writable non-replicating leader.
    pub fn is_healthy(&self) -> bool {
        use ConditionStatus::{False, True};

        if self.lagged.status != False {
            return false;
        }
        let follower_ok =
            self.leader.status == False && self.read_only.status == True && self.replicating.status == True;
        let leader_ok =
            self.leader.status == True && self.read_only.status == False && self.replicating.status == False;
        follower_ok || leader_ok
    }
}

const NODE_CONDITION_ORDER: [NodeConditionType; 4] = [
    NodeConditionType::Lagged,
    NodeConditionType::Leader,
    NodeConditionType::ReadOnly,
    NodeConditionType::Replicating,
];

impl From<NodeConditions> for Vec<NodeCondition> {
    fn from(conditions: NodeConditions) -> Self {
        NODE_CONDITION_ORDER
            .iter()
            .map(|t| {
                let slot = conditions.slot(*t);
                NodeCondition {
                    condition_type: *t,
                    status: slot.status,
                    last_transition_time: slot.last_transition_time,
                }
            })
            .collect()
    }
}

impl From<Vec<NodeCondition>> for NodeConditions {
    fn from(list: Vec<NodeCondition>) -> Self {
        let oldest = list
            .iter()
            .map(|c| c.last_transition_time)
            .min()
            .unwrap_or_else(Utc::now);
        let mut conditions = NodeConditions::unknown(oldest);
        for entry in list {
            *conditions.slot_mut(entry.condition_type) = ConditionSlot {
                status: entry.status,
                last_transition_time: entry.last_transition_time,
            };
        }
        conditions
    }
}
