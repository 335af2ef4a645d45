//! Fake cluster members answering both the consensus agent and SQL.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mysql_operator::cluster::XENON_PORT;
use mysql_operator::error::{Error, Result};
use mysql_operator::probe::sql::{SqlRow, BINLOG_SENT_STATE};
use mysql_operator::probe::{ConnParams, ConsensusClient, RaftView, SqlConnector, SqlRunner};

use super::memory_store::Journal;

#[derive(Default)]
struct World {
    /// host -> consensus state (LEADER, FOLLOWER, ...)
    roles: BTreeMap<String, String>,
    /// host -> read_only; unset means followers are read-only.
    read_only: BTreeMap<String, bool>,
    /// Peers known by the consensus group.
    peers: Vec<String>,
    consensus_down: HashSet<String>,
    sql_down: HashSet<String>,
    lagging: HashSet<String>,
    /// Whether `show processlist` reports the binlog as sent.
    binlog_sent: bool,
}

/// Shared state of every fake member of one test.
#[derive(Clone)]
pub struct FakeMembers {
    world: Arc<Mutex<World>>,
    journal: Journal,
}

impl FakeMembers {
    pub fn new(journal: Journal) -> Self {
        let world = World {
            binlog_sent: true,
            ..Default::default()
        };
        Self {
            world: Arc::new(Mutex::new(world)),
            journal,
        }
    }

    /// Register `host` with a consensus state and add it as a peer.
    pub fn set_role(&self, host: &str, state: &str) {
        let mut world = self.world.lock().unwrap();
        world.roles.insert(host.to_string(), state.to_string());
        let peer = format!("{}:{}", host, XENON_PORT);
        if !world.peers.contains(&peer) {
            world.peers.push(peer);
        }
    }

    pub fn role(&self, host: &str) -> Option<String> {
        self.world.lock().unwrap().roles.get(host).cloned()
    }

    pub fn set_read_only(&self, host: &str, read_only: bool) {
        self.world.lock().unwrap().read_only.insert(host.to_string(), read_only);
    }

    pub fn read_only(&self, host: &str) -> bool {
        let world = self.world.lock().unwrap();
        Self::effective_read_only(&world, host)
    }

    pub fn set_consensus_down(&self, host: &str) {
        self.world.lock().unwrap().consensus_down.insert(host.to_string());
    }

    pub fn set_consensus_up(&self, host: &str) {
        self.world.lock().unwrap().consensus_down.remove(host);
    }

    pub fn set_sql_down(&self, host: &str) {
        self.world.lock().unwrap().sql_down.insert(host.to_string());
    }

    pub fn set_lagging(&self, host: &str) {
        self.world.lock().unwrap().lagging.insert(host.to_string());
    }

    pub fn set_binlog_sent(&self, sent: bool) {
        self.world.lock().unwrap().binlog_sent = sent;
    }

    pub fn peers(&self) -> Vec<String> {
        self.world.lock().unwrap().peers.clone()
    }

    fn effective_read_only(world: &World, host: &str) -> bool {
        match world.read_only.get(host) {
            Some(read_only) => *read_only,
            None => world.roles.get(host).map(String::as_str) != Some("LEADER"),
        }
    }

    fn check_consensus(&self, host: &str) -> Result<()> {
        if self.world.lock().unwrap().consensus_down.contains(host) {
            return Err(Error::ConsensusStatus {
                host: host.to_string(),
                path: "/v1/raft/status".to_string(),
                status: 503,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConsensusClient for FakeMembers {
    async fn raft_status(&self, host: &str, _root_password: &str) -> Result<RaftView> {
        self.check_consensus(host)?;
        let world = self.world.lock().unwrap();
        let leader = world
            .roles
            .iter()
            .find(|(_, state)| state.as_str() == "LEADER")
            .map(|(h, _)| format!("{}:{}", h, XENON_PORT))
            .unwrap_or_default();
        Ok(RaftView {
            state: world.roles.get(host).cloned().unwrap_or_else(|| "UNKNOWN".to_string()),
            leader,
            nodes: world.peers.clone(),
        })
    }

    async fn try_to_leader(&self, host: &str, _root_password: &str) -> Result<()> {
        self.check_consensus(host)?;
        self.journal.record(format!("trytoleader {}", host));
        let mut world = self.world.lock().unwrap();
        for state in world.roles.values_mut() {
            if *state == "LEADER" {
                *state = "FOLLOWER".to_string();
            }
        }
        world.roles.insert(host.to_string(), "LEADER".to_string());
        Ok(())
    }

    async fn ping(&self, host: &str, _root_password: &str) -> Result<()> {
        self.check_consensus(host)
    }

    async fn cluster_add(&self, host: &str, _root_password: &str, peer: &str) -> Result<()> {
        self.check_consensus(host)?;
        self.journal.record(format!("cluster_add {}", peer));
        let mut world = self.world.lock().unwrap();
        if !world.peers.iter().any(|p| p == peer) {
            world.peers.push(peer.to_string());
        }
        Ok(())
    }

    async fn cluster_remove(&self, host: &str, _root_password: &str, peer: &str) -> Result<()> {
        self.check_consensus(host)?;
        self.journal.record(format!("cluster_remove {}", peer));
        self.world.lock().unwrap().peers.retain(|p| p != peer);
        Ok(())
    }
}

#[async_trait]
impl SqlConnector for FakeMembers {
    async fn connect(&self, params: &ConnParams) -> Result<Box<dyn SqlRunner>> {
        if self.world.lock().unwrap().sql_down.contains(&params.host) {
            return Err(Error::Internal(format!("connection to {} refused", params.host)));
        }
        Ok(Box::new(FakeSession {
            host: params.host.clone(),
            members: self.clone(),
        }))
    }
}

struct FakeSession {
    host: String,
    members: FakeMembers,
}

fn row(pairs: &[(&str, &str)]) -> SqlRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect()
}

#[async_trait]
impl SqlRunner for FakeSession {
    async fn run_query(&mut self, stmt: &str) -> Result<()> {
        self.members.journal.record(format!("sql {} {}", self.host, stmt));
        let mut world = self.members.world.lock().unwrap();
        if stmt.contains("read_only=off") {
            world.read_only.insert(self.host.clone(), false);
        } else if stmt.contains("read_only=on") {
            world.read_only.insert(self.host.clone(), true);
        }
        Ok(())
    }

    async fn query_rows(&mut self, stmt: &str) -> Result<Vec<SqlRow>> {
        let world = self.members.world.lock().unwrap();
        let is_leader = world.roles.get(&self.host).map(String::as_str) == Some("LEADER");
        let rows = match stmt {
            "show slave status" if is_leader => vec![],
            "show slave status" => {
                let behind = if world.lagging.contains(&self.host) { "5000" } else { "0" };
                vec![row(&[
                    ("Slave_IO_State", "Waiting for master to send event"),
                    ("Slave_SQL_Running", "Yes"),
                    ("Seconds_Behind_Master", behind),
                    ("Last_SQL_Error", ""),
                ])]
            }
            "select @@global.long_query_time" => vec![row(&[("@@global.long_query_time", "3")])],
            "select @@global.read_only" => {
                let value = if FakeMembers::effective_read_only(&world, &self.host) { "1" } else { "0" };
                vec![row(&[("@@global.read_only", value)])]
            }
            "show processlist" => {
                let state = if world.binlog_sent { BINLOG_SENT_STATE } else { "Sending binlog event to slave" };
                vec![row(&[("Id", "7"), ("Command", "Binlog Dump"), ("State", state)])]
            }
            other => return Err(Error::Internal(format!("unexpected query {:?}", other))),
        };
        Ok(rows)
    }
}
