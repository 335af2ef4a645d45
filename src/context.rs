//! Collaborators shared by one reconciliation pass.

use std::sync::Arc;

use crate::config::OperatorConfig;
use crate::probe::{ConsensusClient, Handoffs, SqlConnector};
use crate::store::ClusterStores;

/// Everything the status aggregator and the syncer talk to.
#[derive(Clone)]
pub struct Services {
    pub stores: ClusterStores,
    pub connector: Arc<dyn SqlConnector>,
    pub consensus: Arc<dyn ConsensusClient>,
    pub handoffs: Handoffs,
    pub config: Arc<OperatorConfig>,
}
