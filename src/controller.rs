//! Kubernetes controllers for MysqlCluster resources
//!
//! Two controllers watch the same objects. The cluster controller runs a
//! status pass followed by a workload sync and requeues every minute. The
//! status controller only runs the status pass, on a short period, so pod
//! health labels keep refreshing while a long rolling update holds the
//! cluster controller inside its pass.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::config::OperatorConfig;
use crate::context::Services;
use crate::crd::MysqlCluster;
use crate::error::{Error, Result};
use crate::metrics;
use crate::probe::{ConsensusClient, Handoffs, MysqlConnector, SqlConnector, XenonClient};
use crate::status::StatusAggregator;
use crate::store::ClusterStores;
use crate::syncer::{StatefulSetSyncer, SyncOutcome};

/// Name reported on published events.
pub const REPORTER: &str = "mysql-operator";

const REASON_SYNC_SUCCESSFUL: &str = "StatefulSetSyncSuccessful";
const REASON_SYNC_FAILED: &str = "StatefulSetSyncFailed";
const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Controller state shared by every reconciliation.
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    pub connector: Arc<dyn SqlConnector>,
    pub consensus: Arc<dyn ConsensusClient>,
    /// Shared between both controllers so the status pass sees handoffs
    pub handoffs: Handoffs,
    pub reporter: Reporter,
}

impl Context {
    /// Collaborators scoped to one namespace.
    pub fn services(&self, namespace: &str) -> Services {
        Services {
            stores: ClusterStores::kube(self.client.clone(), namespace),
            connector: Arc::clone(&self.connector),
            consensus: Arc::clone(&self.consensus),
            handoffs: self.handoffs.clone(),
            config: Arc::clone(&self.config),
        }
    }

    fn recorder(&self, cluster: &MysqlCluster) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), cluster.object_ref(&()))
    }
}

/// Main controller for MysqlCluster resources
pub struct Controller {
    client: Client,
    namespace: String,
    context: Arc<Context>,
}

impl Controller {
    /// Create a new controller
    pub async fn new(namespace: String, config: OperatorConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        let consensus = XenonClient::new(config.probe.http_timeout)?;

        let context = Context {
            client: client.clone(),
            config: Arc::new(config),
            connector: Arc::new(MysqlConnector),
            consensus: Arc::new(consensus),
            handoffs: Handoffs::default(),
            reporter: Reporter::from(REPORTER),
        };

        Ok(Self {
            client,
            namespace,
            context: Arc::new(context),
        })
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }

    /// Fail fast when the CRD is not installed.
    async fn verify_crd(&self) -> Result<()> {
        let clusters: Api<MysqlCluster> = self.api();
        let lp = ListParams::default().limit(1);
        if let Err(e) = clusters.list(&lp).await {
            error!("Failed to list MysqlClusters. Is the CRD installed? Error: {}", e);
            return Err(Error::CrdNotInstalled);
        }
        info!("CRD verification successful");
        Ok(())
    }

    /// Run the cluster controller
    pub async fn run(&self) -> Result<()> {
        info!("Starting MysqlCluster controller");
        self.verify_crd().await?;

        let clusters: Api<MysqlCluster> = self.api();
        let statefulsets: Api<StatefulSet> = self.api();

        KubeController::new(clusters, Config::default())
            .owns(statefulsets, Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::clone(&self.context))
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(name = %obj.name, ?action, "Reconciliation successful");
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation error");
                    }
                }
            })
            .await;

        info!("Cluster controller stopped");
        Ok(())
    }

    /// Run the periodic status controller
    pub async fn run_status(&self) -> Result<()> {
        info!("Starting MysqlCluster status controller");
        self.verify_crd().await?;

        let clusters: Api<MysqlCluster> = self.api();

        KubeController::new(clusters, Config::default())
            .shutdown_on_signal()
            .run(reconcile_status, status_error_policy, Arc::clone(&self.context))
            .for_each(|result| async move {
                if let Err(e) = result {
                    debug!(error = %e, "Status pass error");
                }
            })
            .await;

        info!("Status controller stopped");
        Ok(())
    }
}

async fn publish(recorder: &Recorder, type_: EventType, reason: &str, note: String) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(event).await {
        warn!(error = %e, reason = %reason, "Failed to publish event");
    }
}

/// Reconcile a MysqlCluster resource
async fn reconcile(obj: Arc<MysqlCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let cluster = Cluster::new(obj.as_ref().clone());
    let key = cluster.key();
    info!(cluster = %key, "Reconciling MysqlCluster");

    let recorder = ctx.recorder(&obj);
    if let Err(e) = cluster.validate() {
        warn!(cluster = %key, error = %e, "Rejecting invalid cluster spec");
        metrics::record_error(e.metric_label());
        publish(&recorder, EventType::Warning, REASON_INVALID_SPEC, e.to_string()).await;
        return Ok(Action::await_change());
    }

    let services = ctx.services(&cluster.namespace());
    let result = reconcile_cluster(&cluster, &services, &recorder).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            metrics::record_reconciliation_success(&key, elapsed);
            info!(cluster = %key, outcome = outcome.as_str(), "Reconciliation finished");
            Ok(Action::requeue(ctx.config.controller.requeue_after))
        }
        Err(e) => {
            metrics::record_reconciliation_failure(&key, elapsed);
            metrics::record_error(e.metric_label());
            error!(cluster = %key, error = %e, "Reconciliation failed");
            Err(e)
        }
    }
}

async fn reconcile_cluster(
    cluster: &Cluster,
    services: &Services,
    recorder: &Recorder,
) -> Result<SyncOutcome> {
    if !cluster.is_being_deleted() {
        match StatusAggregator::new(cluster, services).sync().await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(cluster = %cluster.key(), "Status written by a concurrent pass, leaving it");
            }
            Err(e) => {
                metrics::record_error(e.metric_label());
                warn!(cluster = %cluster.key(), error = %e, "Status pass failed");
            }
        }
    }

    let workload = cluster.resource_name(crate::cluster::ResourceKind::StatefulSet);
    match StatefulSetSyncer::new(cluster, services).sync().await {
        Ok(outcome) => {
            let note = format!("StatefulSet {} {}", workload, outcome.as_str());
            publish(recorder, EventType::Normal, REASON_SYNC_SUCCESSFUL, note).await;
            Ok(outcome)
        }
        Err(e) => {
            let note = format!("StatefulSet {}: {}", workload, e);
            publish(recorder, EventType::Warning, REASON_SYNC_FAILED, note).await;
            Err(e)
        }
    }
}

/// Error policy for reconciliation failures
fn error_policy(_cluster: Arc<MysqlCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(error = %error, retryable = error.is_retryable(), "Reconciliation error, will retry");
    Action::requeue(ctx.config.controller.error_requeue_after)
}

async fn reconcile_status(obj: Arc<MysqlCluster>, ctx: Arc<Context>) -> Result<Action> {
    let cluster = Cluster::new(obj.as_ref().clone());
    if cluster.is_being_deleted() || cluster.validate().is_err() {
        return Ok(Action::await_change());
    }

    let services = ctx.services(&cluster.namespace());
    StatusAggregator::new(&cluster, &services).sync().await?;
    Ok(Action::requeue(ctx.config.status.interval))
}

/// A conflicting status write is requeued like any failure; the rerun reads
/// the object the other pass stored.
fn status_error_policy(obj: Arc<MysqlCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(name = %obj.name_any(), "Status changed during the pass, recomputing");
        return Action::requeue(ctx.config.status.interval);
    }
    metrics::record_error(error.metric_label());
    warn!(name = %obj.name_any(), error = %error, "Status pass failed, will retry");
    Action::requeue(ctx.config.status.interval)
}
