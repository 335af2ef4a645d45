//! Common test utilities for integration tests.

pub mod fixtures;
pub mod members;
pub mod memory_store;

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};

use mysql_operator::cluster::Cluster;
use mysql_operator::config::OperatorConfig;
use mysql_operator::context::Services;
use mysql_operator::crd::{Backup, MysqlCluster};
use mysql_operator::probe::Handoffs;
use mysql_operator::store::ClusterStores;

pub use fixtures::*;
pub use members::FakeMembers;
pub use memory_store::{api_error, Journal, MemoryStore};

/// In-memory world for one test: object stores, fake members and the
/// services wired over them.
pub struct TestEnv {
    pub journal: Journal,
    pub clusters: Arc<MemoryStore<MysqlCluster>>,
    pub statefulsets: Arc<MemoryStore<StatefulSet>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub pvcs: Arc<MemoryStore<PersistentVolumeClaim>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub backups: Arc<MemoryStore<Backup>>,
    pub members: Arc<FakeMembers>,
    pub services: Services,
}

impl TestEnv {
    pub fn new() -> Self {
        let journal = Journal::default();
        let clusters = Arc::new(MemoryStore::new(journal.clone()));
        let statefulsets = Arc::new(MemoryStore::new(journal.clone()));
        let pods = Arc::new(MemoryStore::new(journal.clone()));
        let pvcs = Arc::new(MemoryStore::new(journal.clone()));
        let secrets = Arc::new(MemoryStore::new(journal.clone()));
        let backups = Arc::new(MemoryStore::new(journal.clone()));
        let members = Arc::new(FakeMembers::new(journal.clone()));

        let services = Services {
            stores: ClusterStores {
                clusters: clusters.clone(),
                statefulsets: statefulsets.clone(),
                pods: pods.clone(),
                pvcs: pvcs.clone(),
                secrets: secrets.clone(),
                backups: backups.clone(),
            },
            connector: members.clone(),
            consensus: members.clone(),
            handoffs: Handoffs::default(),
            config: Arc::new(OperatorConfig::fast()),
        };

        Self {
            journal,
            clusters,
            statefulsets,
            pods,
            pvcs,
            secrets,
            backups,
            members,
            services,
        }
    }

    /// An environment holding the `sample` cluster and its secret.
    pub fn with_cluster(replicas: i32) -> Self {
        let env = Self::new();
        let cluster = Cluster::new(env.clusters.seed(sample_cluster(replicas)));
        env.secrets.seed(secret(&cluster));
        env
    }

    /// The cluster as currently stored.
    pub fn cluster(&self) -> Cluster {
        let obj = self.clusters.get_now(CLUSTER_NAME).expect("cluster is seeded");
        Cluster::new(obj)
    }

    pub fn edit_cluster(&self, f: impl FnOnce(&mut MysqlCluster)) {
        self.clusters.update(CLUSTER_NAME, f);
    }

    pub fn host(&self, ordinal: i32) -> String {
        let cluster = self.cluster();
        cluster.pod_hostname(&cluster.pod_name(ordinal))
    }

    /// Seed one healthy pod per member at `revision`, the `leader` ordinal
    /// leading both in pod labels and in the consensus group.
    pub fn seed_members(&self, revision: &str, leader: i32) {
        let cluster = self.cluster();
        for ordinal in 0..cluster.replicas() {
            let (role, state) = if ordinal == leader {
                ("leader", "LEADER")
            } else {
                ("follower", "FOLLOWER")
            };
            self.pods.seed(member_pod(&cluster, ordinal, role, revision, true));
            self.members.set_role(&self.host(ordinal), state);
        }
    }
}
