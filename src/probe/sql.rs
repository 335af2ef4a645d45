//! SQL side of the member probe.
//!
//! [`SqlConnector`] opens a [`SqlRunner`] against one member. The checks in
//! this module only see rows as column-name maps, so they run unchanged
//! against a real server and against test doubles.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row, Value};
use tracing::debug;

use crate::crd::ConditionStatus;
use crate::error::{Error, Result};

/// One result row keyed by column name; `None` is SQL NULL.
pub type SqlRow = BTreeMap<String, Option<String>>;

/// Replica IO states meaning the replica lost its source.
pub const CONNECTION_ERROR_STATES: [&str; 5] = [
    "connecting to master",
    "reconnecting after a failed binlog dump request",
    "reconnecting after a failed master event read",
    "waiting to reconnect after a failed binlog dump request",
    "waiting to reconnect after a failed master event read",
];

/// Process state of a binlog dump thread that has nothing left to send.
pub const BINLOG_SENT_STATE: &str = "Master has sent all binlog to slave";

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
}

/// An open session on one member.
#[async_trait]
pub trait SqlRunner: Send {
    /// Execute a statement, discarding any result.
    async fn run_query(&mut self, stmt: &str) -> Result<()>;

    /// Execute a query and collect every row.
    async fn query_rows(&mut self, stmt: &str) -> Result<Vec<SqlRow>>;
}

/// Opens sessions.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self, params: &ConnParams) -> Result<Box<dyn SqlRunner>>;
}

// ============================================================================
// mysql_async implementation
// ============================================================================

/// [`SqlConnector`] speaking the MySQL protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlConnector;

#[async_trait]
impl SqlConnector for MysqlConnector {
    async fn connect(&self, params: &ConnParams) -> Result<Box<dyn SqlRunner>> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(params.host.clone())
            .tcp_port(params.port)
            .user(Some(params.user.clone()))
            .pass(Some(params.password.clone()))
            .prefer_socket(false);

        let conn = tokio::time::timeout(params.connect_timeout, Conn::new(opts))
            .await
            .map_err(|_| Error::Timeout(format!("mysql connection to {}", params.host)))??;

        debug!(host = %params.host, "Connected to member");
        Ok(Box::new(MysqlRunner { conn }))
    }
}

/// Session on a MySQL server. Dropping it closes the connection.
pub struct MysqlRunner {
    conn: Conn,
}

#[async_trait]
impl SqlRunner for MysqlRunner {
    async fn run_query(&mut self, stmt: &str) -> Result<()> {
        self.conn.query_drop(stmt).await?;
        Ok(())
    }

    async fn query_rows(&mut self, stmt: &str) -> Result<Vec<SqlRow>> {
        let rows: Vec<Row> = self.conn.query(stmt).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }
}

fn row_to_map(row: &Row) -> SqlRow {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = row.as_ref(i).and_then(value_to_string);
            (column.name_str().into_owned(), value)
        })
        .collect()
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(n) => Some(n.to_string()),
        Value::UInt(n) => Some(n.to_string()),
        Value::Float(n) => Some(n.to_string()),
        Value::Double(n) => Some(n.to_string()),
        other => Some(other.as_sql(true)),
    }
}

// ============================================================================
// Checks
// ============================================================================

/// Outcome of one replication check.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationCheck {
    pub lagged: ConditionStatus,
    pub replicating: ConditionStatus,
    pub error: Option<String>,
}

impl ReplicationCheck {
    fn failed(replicating: ConditionStatus, error: String) -> Self {
        Self {
            lagged: ConditionStatus::Unknown,
            replicating,
            error: Some(error),
        }
    }
}

/// What a `show slave status` result says before lag is considered.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaState {
    /// No replication channel: a source, or a member that never replicated.
    NotReplica,
    /// Replication is configured but broken.
    Broken(String),
    /// Both threads running; carries the reported delay in seconds.
    Running { seconds_behind: f64 },
}

fn column<'a>(row: &'a SqlRow, name: &str) -> &'a str {
    row.get(name).and_then(|v| v.as_deref()).unwrap_or("")
}

/// Classify the first row of `show slave status`.
pub fn classify_replica(rows: &[SqlRow]) -> ReplicaState {
    let Some(row) = rows.first() else {
        return ReplicaState::NotReplica;
    };

    let io_state = column(row, "Slave_IO_State").to_lowercase();
    if CONNECTION_ERROR_STATES.contains(&io_state.as_str()) {
        return ReplicaState::Broken(format!("Slave_IO_State: {}", io_state));
    }

    if column(row, "Slave_SQL_Running") != "Yes" {
        return ReplicaState::Broken(format!("Last_SQL_Error: {}", column(row, "Last_SQL_Error")));
    }

    ReplicaState::Running {
        seconds_behind: column(row, "Seconds_Behind_Master").parse().unwrap_or(0.0),
    }
}

/// A replica is lagged once its delay exceeds a hundred slow-query windows.
pub fn lag_status(seconds_behind: f64, long_query_time: f64) -> ConditionStatus {
    (seconds_behind > long_query_time * 100.0).into()
}

async fn global_variable(runner: &mut dyn SqlRunner, name: &str) -> Result<Option<String>> {
    let rows = runner.query_rows(&format!("select @@global.{}", name)).await?;
    Ok(rows
        .into_iter()
        .next()
        .and_then(|row| row.into_values().next())
        .flatten())
}

/// Inspect replication on a member once.
pub async fn check_slave_status(runner: &mut dyn SqlRunner) -> ReplicationCheck {
    let unknown = ConditionStatus::Unknown;

    let rows = match runner.query_rows("show slave status").await {
        Ok(rows) => rows,
        Err(e) => return ReplicationCheck::failed(unknown, e.to_string()),
    };

    let seconds_behind = match classify_replica(&rows) {
        ReplicaState::NotReplica => {
            return ReplicationCheck {
                lagged: ConditionStatus::False,
                replicating: ConditionStatus::False,
                error: None,
            }
        }
        ReplicaState::Broken(reason) => return ReplicationCheck::failed(ConditionStatus::False, reason),
        ReplicaState::Running { seconds_behind } => seconds_behind,
    };

    let long_query_time = match global_variable(runner, "long_query_time").await {
        Ok(Some(value)) => value.parse::<f64>().unwrap_or(0.0),
        Ok(None) => 0.0,
        Err(e) => return ReplicationCheck::failed(ConditionStatus::True, e.to_string()),
    };

    ReplicationCheck {
        lagged: lag_status(seconds_behind, long_query_time),
        replicating: ConditionStatus::True,
        error: None,
    }
}

/// Repeat [`check_slave_status`] until it succeeds or `attempts` run out,
/// returning the last outcome.
pub async fn check_slave_status_with_retry(
    runner: &mut dyn SqlRunner,
    attempts: u32,
    interval: Duration,
) -> ReplicationCheck {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let check = check_slave_status(runner).await;
        if check.error.is_none() || attempt >= attempts {
            return check;
        }
        debug!(attempt = attempt, error = ?check.error, "Replication check failed, retrying");
        tokio::time::sleep(interval).await;
    }
}

/// Whether the member refuses writes.
pub async fn check_read_only(runner: &mut dyn SqlRunner) -> Result<ConditionStatus> {
    match global_variable(runner, "read_only").await?.as_deref() {
        Some("0") => Ok(ConditionStatus::False),
        Some(value) if value.parse::<u8>().is_ok() => Ok(ConditionStatus::True),
        other => Err(Error::Replication(format!(
            "unexpected @@global.read_only value {:?}",
            other
        ))),
    }
}

/// Whether some binlog dump thread reports it has shipped everything.
pub async fn check_processlist(runner: &mut dyn SqlRunner) -> Result<bool> {
    let rows = runner.query_rows("show processlist").await?;
    Ok(rows
        .iter()
        .any(|row| column(row, "State").contains(BINLOG_SENT_STATE)))
}
