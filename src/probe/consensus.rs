//! HTTP client for the per-member consensus agent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::XENON_PEER_PORT;
use crate::crd::{RaftRole, RaftStatus};
use crate::error::{Error, Result};

pub const RAFT_STATUS_PATH: &str = "/v1/raft/status";
pub const TRY_TO_LEADER_PATH: &str = "/v1/raft/trytoleader";
pub const PING_PATH: &str = "/v1/xenon/ping";
pub const CLUSTER_ADD_PATH: &str = "/v1/cluster/add";
pub const CLUSTER_REMOVE_PATH: &str = "/v1/cluster/remove";

/// Raft view returned by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftView {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub leader: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl RaftView {
    pub fn role(&self) -> RaftRole {
        RaftRole::parse(&self.state)
    }
}

impl From<RaftView> for RaftStatus {
    fn from(view: RaftView) -> Self {
        RaftStatus {
            role: view.role().as_str().to_string(),
            leader: view.leader,
            nodes: view.nodes,
        }
    }
}

#[derive(Debug, Serialize)]
struct PeerRequest<'a> {
    address: &'a str,
}

/// Operations offered by a member's consensus agent.
///
/// Every call authenticates as `root` with the cluster's root password.
#[async_trait]
pub trait ConsensusClient: Send + Sync {
    async fn raft_status(&self, host: &str, root_password: &str) -> Result<RaftView>;

    /// Ask `host` to start an election it should win.
    async fn try_to_leader(&self, host: &str, root_password: &str) -> Result<()>;

    async fn ping(&self, host: &str, root_password: &str) -> Result<()>;

    /// Add `peer` to the Raft membership known by `host`.
    async fn cluster_add(&self, host: &str, root_password: &str, peer: &str) -> Result<()>;

    /// Remove `peer` from the Raft membership known by `host`.
    async fn cluster_remove(&self, host: &str, root_password: &str, peer: &str) -> Result<()>;
}

/// [`ConsensusClient`] for Xenon agents.
#[derive(Debug, Clone)]
pub struct XenonClient {
    http: reqwest::Client,
    port: u16,
}

impl XenonClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            port: XENON_PEER_PORT,
        })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.port, path)
    }

    async fn send(
        &self,
        method: Method,
        host: &str,
        path: &str,
        root_password: &str,
        body: Option<PeerRequest<'_>>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method, self.url(host, path))
            .basic_auth("root", Some(root_password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        debug!(host = %host, path = %path, status = %response.status(), "Consensus agent answered");
        if response.status() != StatusCode::OK {
            return Err(Error::ConsensusStatus {
                host: host.to_string(),
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ConsensusClient for XenonClient {
    async fn raft_status(&self, host: &str, root_password: &str) -> Result<RaftView> {
        let response = self
            .send(Method::GET, host, RAFT_STATUS_PATH, root_password, None)
            .await?;
        Ok(response.json::<RaftView>().await?)
    }

    async fn try_to_leader(&self, host: &str, root_password: &str) -> Result<()> {
        self.send(Method::POST, host, TRY_TO_LEADER_PATH, root_password, None)
            .await?;
        Ok(())
    }

    async fn ping(&self, host: &str, root_password: &str) -> Result<()> {
        self.send(Method::GET, host, PING_PATH, root_password, None).await?;
        Ok(())
    }

    async fn cluster_add(&self, host: &str, root_password: &str, peer: &str) -> Result<()> {
        let body = PeerRequest { address: peer };
        self.send(Method::POST, host, CLUSTER_ADD_PATH, root_password, Some(body))
            .await?;
        Ok(())
    }

    async fn cluster_remove(&self, host: &str, root_password: &str, peer: &str) -> Result<()> {
        let body = PeerRequest { address: peer };
        self.send(Method::POST, host, CLUSTER_REMOVE_PATH, root_password, Some(body))
            .await?;
        Ok(())
    }
}
