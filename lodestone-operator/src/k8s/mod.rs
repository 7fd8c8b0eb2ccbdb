//! Kubernetes controller.
//!
//! This controller observes SearchCluster CRs, caches the ones of its
//! namespace, and runs one rollout pass per cluster per reconcile task. A
//! pass always runs to completion (or failure) before the same cluster is
//! visited again; distinct clusters are independent of each other. Failed
//! passes are requeued with a delay rather than crashing the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use lodestone_core::crd::{RequiredMetadata, SearchCluster, SearchClusterStatus};

use crate::cluster::backend::KubeBackend;
use crate::cluster::fingerprint::{ConfigMapBundles, SecretBundles};
use crate::cluster::membership::HttpMembershipClient;
use crate::cluster::{ClusterReconciler, Collaborators, ReconcileOutcome};
use crate::config::Config;

/// The app name used by the operator.
const APP_NAME: &str = "lodestone-operator";
/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The timeout duration used before requeueing a reconcile task.
const RECONCILE_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

const METRIC_RECONCILE_PASSES: &str = "lodestone_reconcile_passes";
const METRIC_RECONCILE_FAILURES: &str = "lodestone_reconcile_failures";
const METRIC_WATCHER_ERRORS: &str = "lodestone_cluster_watcher_errors";

type EventResult = std::result::Result<Event<SearchCluster>, WatcherError>;

/// A reconciliation task to be performed.
#[derive(Debug)]
pub enum ReconcileTask {
    /// A cluster CR was created, updated or re-listed.
    ClusterUpdated(Arc<String>),
    /// A cluster CR was deleted.
    ClusterDeleted(Arc<String>, SearchCluster),
}

/// Kubernetes controller for watching SearchCluster CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of reconcile tasks.
    tasks_tx: mpsc::Sender<ReconcileTask>,
    /// A channel of reconcile tasks.
    tasks_rx: ReceiverStream<ReconcileTask>,

    /// All known SearchCluster CRs of this namespace.
    clusters: HashMap<Arc<String>, SearchCluster>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_RECONCILE_PASSES, metrics::Unit::Count, "reconcile passes started by this operator");
        metrics::register_counter!(METRIC_RECONCILE_FAILURES, metrics::Unit::Count, "reconcile passes which completed with failures");
        metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "k8s watcher errors from the clusters watcher");
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            clusters: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let api: Api<SearchCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters_watcher = watcher(api, ListParams::default());
        tokio::pin!(clusters_watcher);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res).await,
                Some(task) = self.tasks_rx.next() => self.handle_reconcile_task(task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_cluster_event(&mut self, res: EventResult) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from k8s watch stream");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS);
                tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(cluster) => {
                let name = Arc::new(cluster.name().to_string());
                self.clusters.insert(name.clone(), cluster);
                self.spawn_reconcile_task(ReconcileTask::ClusterUpdated(name), false);
            }
            Event::Deleted(cluster) => {
                let name = Arc::new(cluster.name().to_string());
                self.clusters.remove(&name);
                self.spawn_reconcile_task(ReconcileTask::ClusterDeleted(name, cluster), false);
            }
            Event::Restarted(clusters) => {
                tracing::debug!("cluster CR watcher restarted");
                self.clusters.clear();
                for cluster in clusters {
                    let name = Arc::new(cluster.name().to_string());
                    self.clusters.insert(name.clone(), cluster);
                    self.spawn_reconcile_task(ReconcileTask::ClusterUpdated(name), false);
                }
            }
        }
    }

    /// Handle reconcile tasks.
    async fn handle_reconcile_task(&mut self, task: ReconcileTask) {
        match task {
            ReconcileTask::ClusterUpdated(name) => self.reconcile_cluster(name).await,
            ReconcileTask::ClusterDeleted(name, cluster) => self.cluster_deleted(name, cluster).await,
        }
    }

    /// Run one rollout pass over the named cluster and publish its status.
    #[tracing::instrument(level = "debug", skip(self, name), fields(cluster = %name))]
    async fn reconcile_cluster(&mut self, name: Arc<String>) {
        let cluster = match self.clusters.get(&name) {
            Some(cluster) => cluster.clone(),
            None => return,
        };
        metrics::increment_counter!(METRIC_RECONCILE_PASSES);

        let collaborators = self.collaborators(&cluster);
        let reconciler = ClusterReconciler::new(cluster.clone(), collaborators);
        let outcome = reconciler.reconcile().await;

        if let Err(err) = self.patch_cluster_status(&cluster, &outcome).await {
            tracing::error!(error = ?err, cluster = cluster.name(), "error updating cluster status");
            self.spawn_reconcile_task(ReconcileTask::ClusterUpdated(name), true);
            return;
        }

        if !outcome.is_settled() {
            metrics::increment_counter!(METRIC_RECONCILE_FAILURES);
            tracing::warn!(
                cluster = cluster.name(),
                failures = outcome.failures.len(),
                "reconcile pass completed with failures, requeueing",
            );
            self.spawn_reconcile_task(ReconcileTask::ClusterUpdated(name), true);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _name, _cluster))]
    async fn cluster_deleted(&mut self, _name: Arc<String>, _cluster: SearchCluster) {
        tracing::debug!("handling cluster deleted");
        // NOTE: backing workloads carry an owner reference to the CR and are
        // garbage collected by K8s; nothing further to do here.
    }

    /// Build the collaborator set for the given cluster.
    fn collaborators(&self, cluster: &SearchCluster) -> Collaborators {
        Collaborators {
            backend: Arc::new(KubeBackend::new(self.client.clone())),
            membership: Arc::new(HttpMembershipClient::new(cluster.name(), cluster.namespace())),
            config_bundles: Arc::new(ConfigMapBundles::new(self.client.clone())),
            credential_bundles: Arc::new(SecretBundles::new(self.client.clone())),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Patch the given cluster's status in K8s using Server-Side Apply.
    async fn patch_cluster_status(&self, cluster: &SearchCluster, outcome: &ReconcileOutcome) -> Result<()> {
        tracing::info!(cluster = cluster.name(), "patching cluster CR status");
        let mut cluster = cluster.clone();
        cluster.status = Some(SearchClusterStatus {
            nodes: outcome.statuses.clone(),
        });
        cluster.metadata.managed_fields = None;

        let api: Api<SearchCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        timeout(API_TIMEOUT, api.patch_status(cluster.name(), &params, &Patch::Apply(&cluster)))
            .await
            .context("timeout while updating cluster status")?
            .context("error updating cluster status")?;
        Ok(())
    }

    /// Spawn a task which emits a new reconcile task.
    ///
    /// This indirection is used to ensure that we don't use an unlimited
    /// amount of memory with an unbounded queue, and also so that we do not
    /// block the controller from making progress and dead-locking when we hit
    /// the task queue cap.
    fn spawn_reconcile_task(&self, task: ReconcileTask, is_retry: bool) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RECONCILE_RETRY_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }
}
