//! Member health probe.
//!
//! [`MemberProbe`] asks one member two questions: what the consensus agent
//! thinks its role is, and what the database says about replication and
//! writability. Failures of either path are folded into the report as
//! `Unknown` conditions plus a message; probing never fails as a whole.

pub mod consensus;
pub mod sql;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, warn};

use crate::cluster::{
    Cluster, ResourceKind, MYSQL_PORT, SECRET_OPERATOR_PASSWORD, SECRET_OPERATOR_USER,
    SECRET_ROOT_PASSWORD,
};
use crate::config::ProbeConfig;
use crate::crd::{ConditionStatus, RaftRole, RaftStatus};
use crate::error::{Error, Result};
use crate::retry::retry;
use crate::store::ObjectStore;

pub use consensus::{ConsensusClient, RaftView, XenonClient};
pub use sql::{ConnParams, MysqlConnector, SqlConnector, SqlRunner};

/// Statements that make a leader writable again.
const WRITE_ENABLE: [&str; 2] = ["SET GLOBAL read_only=off", "SET GLOBAL super_read_only=off"];

// ============================================================================
// Credentials
// ============================================================================

/// Credentials read from the cluster secret.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub root_password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Load the cluster's credentials; `None` when the secret does not
    /// exist yet.
    pub async fn load(cluster: &Cluster, secrets: &dyn ObjectStore<Secret>) -> Result<Option<Self>> {
        let name = cluster.resource_name(ResourceKind::Secret);
        match secrets.get(&name).await? {
            Some(secret) => Self::from_secret(&name, &secret).map(Some),
            None => Ok(None),
        }
    }

    pub fn from_secret(name: &str, secret: &Secret) -> Result<Self> {
        let value = |key: &str| -> Result<String> {
            let from_data = secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned());
            let from_string_data = || secret.string_data.as_ref().and_then(|data| data.get(key)).cloned();
            from_data.or_else(from_string_data).ok_or_else(|| Error::MissingSecretKey {
                secret: name.to_string(),
                key: key.to_string(),
            })
        };

        Ok(Self {
            user: value(SECRET_OPERATOR_USER)?,
            password: value(SECRET_OPERATOR_PASSWORD)?,
            root_password: value(SECRET_ROOT_PASSWORD)?,
        })
    }

    fn conn_params(&self, host: &str, config: &ProbeConfig) -> ConnParams {
        ConnParams {
            host: host.to_string(),
            port: MYSQL_PORT as u16,
            user: self.user.clone(),
            password: self.password.clone(),
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Open a session on `host`, retrying transient connection failures.
pub async fn connect(
    connector: &dyn SqlConnector,
    credentials: &Credentials,
    host: &str,
    config: &ProbeConfig,
) -> Result<Box<dyn SqlRunner>> {
    let params = &credentials.conn_params(host, config);
    retry(config.sql_retries, config.sql_retry_interval, move || {
        connector.connect(params)
    })
    .await
}

// ============================================================================
// Leader handoffs
// ============================================================================

/// Clusters whose leader is deliberately read-only while leadership moves.
///
/// The probe's write-enable fix must not undo the read-only switch made
/// before a transfer, so it is suppressed while a handoff is registered.
#[derive(Debug, Clone, Default)]
pub struct Handoffs {
    active: Arc<Mutex<HashSet<String>>>,
}

impl Handoffs {
    /// Mark `cluster` as handing off until the guard is dropped.
    pub fn begin(&self, cluster: &str) -> HandoffGuard {
        self.lock().insert(cluster.to_string());
        HandoffGuard {
            handoffs: self.clone(),
            cluster: cluster.to_string(),
        }
    }

    pub fn in_progress(&self, cluster: &str) -> bool {
        self.lock().contains(cluster)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ends a handoff when dropped.
#[derive(Debug)]
pub struct HandoffGuard {
    handoffs: Handoffs,
    cluster: String,
}

impl Drop for HandoffGuard {
    fn drop(&mut self) {
        self.handoffs.lock().remove(&self.cluster);
    }
}

// ============================================================================
// Member probe
// ============================================================================

/// Normalized result of probing one member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberReport {
    pub host: String,
    pub raft: RaftStatus,
    pub leader: ConditionStatus,
    pub lagged: ConditionStatus,
    pub replicating: ConditionStatus,
    pub read_only: ConditionStatus,
    /// Last error seen while probing, if any.
    pub message: Option<String>,
}

impl MemberReport {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            raft: RaftStatus {
                role: RaftRole::Unknown.as_str().to_string(),
                ..Default::default()
            },
            leader: ConditionStatus::Unknown,
            lagged: ConditionStatus::Unknown,
            replicating: ConditionStatus::Unknown,
            read_only: ConditionStatus::Unknown,
            message: None,
        }
    }

    pub fn role(&self) -> RaftRole {
        self.raft.role()
    }
}

/// Probes members of one cluster.
pub struct MemberProbe<'a> {
    pub connector: &'a dyn SqlConnector,
    pub consensus: &'a dyn ConsensusClient,
    pub config: &'a ProbeConfig,
    pub credentials: &'a Credentials,
}

impl<'a> MemberProbe<'a> {
    /// Probe `host`. `allow_write_fix` gates the corrective write-enable on a
    /// leader that reports itself read-only.
    pub async fn probe(&self, host: &str, allow_write_fix: bool) -> MemberReport {
        let mut report = MemberReport::new(host);

        match self.consensus.raft_status(host, &self.credentials.root_password).await {
            Ok(view) => {
                report.leader = match view.role() {
                    RaftRole::Leader => ConditionStatus::True,
                    RaftRole::Follower => ConditionStatus::False,
                    _ => ConditionStatus::Unknown,
                };
                report.raft = view.into();
            }
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to check the member role");
                report.message = Some(e.to_string());
            }
        }

        let mut runner = match connect(self.connector, self.credentials, host, self.config).await {
            Ok(runner) => runner,
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to connect to member");
                report.message = Some(e.to_string());
                return report;
            }
        };

        let replication = sql::check_slave_status_with_retry(
            runner.as_mut(),
            self.config.sql_retries,
            self.config.sql_retry_interval,
        )
        .await;
        report.lagged = replication.lagged;
        report.replicating = replication.replicating;
        if let Some(error) = replication.error {
            warn!(host = %host, error = %error, "Failed to check replication");
            report.message = Some(error);
        }

        match sql::check_read_only(runner.as_mut()).await {
            Ok(read_only) => report.read_only = read_only,
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to check read only");
                report.message = Some(e.to_string());
            }
        }

        if allow_write_fix
            && report.leader == ConditionStatus::True
            && report.read_only != ConditionStatus::False
        {
            debug!(host = %host, "Making the leader writable");
            for stmt in WRITE_ENABLE {
                if let Err(e) = runner.run_query(stmt).await {
                    debug!(host = %host, error = %e, "Write-enable statement failed");
                }
            }
        }

        report
    }
}
