//! Cluster rollout orchestration.
//!
//! One reconciler instance owns one declared cluster for the duration of a
//! single pass: it derives the topology, rebuilds each node group's desired
//! state, and drives the groups through their rollout state machines in a
//! quorum-preserving order. Master-eligible groups roll strictly one at a
//! time, and each must verifiably rejoin the cluster before the next is
//! touched; a failure in that chain halts it without blocking independent
//! groups.

pub mod backend;
pub mod compare;
pub mod fingerprint;
#[cfg(test)]
mod fingerprint_test;
pub mod manifests;
pub mod membership;
#[cfg(test)]
mod mod_test;
pub mod nodes;
pub mod topology;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;

use lodestone_core::crd::{NodeGroupStatus, RequiredMetadata, SearchCluster};
use lodestone_core::Error;

use crate::cluster::backend::WorkloadBackend;
use crate::cluster::fingerprint::BundleSource;
use crate::cluster::membership::MembershipClient;
use crate::cluster::nodes::NodeGroup;
use crate::cluster::topology::{ClusterTopology, NodeGroupSpec};

/// Shared handles to the external collaborators of the rollout core.
#[derive(Clone)]
pub struct Collaborators {
    /// The workload backend.
    pub backend: Arc<dyn WorkloadBackend>,
    /// The cluster-membership client.
    pub membership: Arc<dyn MembershipClient>,
    /// The configuration-bundle store.
    pub config_bundles: Arc<dyn BundleSource>,
    /// The credential-bundle store.
    pub credential_bundles: Arc<dyn BundleSource>,
    /// The channel signalling process shutdown, used to cancel waits.
    pub shutdown_tx: broadcast::Sender<()>,
}

/// A failure recorded while advancing one node group.
#[derive(Debug)]
pub struct GroupFailure {
    /// The name of the failed group.
    pub group: String,
    /// The error which stopped the group's transition.
    pub error: Error,
}

/// The aggregate result of one reconcile pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Status conditions of every visited group, in visitation order.
    pub statuses: Vec<NodeGroupStatus>,
    /// Failures recorded during the pass.
    pub failures: Vec<GroupFailure>,
}

impl ReconcileOutcome {
    /// True if every group completed its cycle.
    pub fn is_settled(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The rollout orchestrator for one declared cluster.
pub struct ClusterReconciler {
    cluster: SearchCluster,
    topology: ClusterTopology,
    collaborators: Collaborators,
}

impl ClusterReconciler {
    /// Create a new instance, deriving the topology from the cluster spec.
    pub fn new(cluster: SearchCluster, collaborators: Collaborators) -> Self {
        let topology = topology::build(&cluster);
        Self {
            cluster,
            topology,
            collaborators,
        }
    }

    /// Run one full reconcile pass over every node group of the cluster.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.topology.cluster, namespace = %self.topology.namespace))]
    pub async fn reconcile(&self) -> ReconcileOutcome {
        tracing::debug!(
            masters = self.topology.master_count,
            data = self.topology.data_count,
            quorum = self.topology.quorum,
            primary_shards = self.topology.primary_shards,
            replica_shards = self.topology.replica_shards,
            groups = self.topology.groups.len(),
            "derived cluster topology",
        );
        let mut outcome = ReconcileOutcome::default();
        let mut master_chain_blocked = false;

        for spec in &self.topology.groups {
            let mut group = self.build_group(spec);

            // A blocked master chain must not compound quorum risk; only
            // independent, non-master-eligible groups keep being visited.
            if spec.is_master_eligible() && master_chain_blocked {
                tracing::warn!(group = %spec.name, "master chain is blocked, not advancing group this pass");
                self.push_status(&group, &mut outcome).await;
                continue;
            }

            if let Err(error) = self.advance_group(&mut group).await {
                tracing::error!(error = ?error, group = %spec.name, phase = %group.phase(), "error progressing node group");
                if spec.is_master_eligible() {
                    master_chain_blocked = true;
                }
                outcome.failures.push(GroupFailure {
                    group: spec.name.clone(),
                    error,
                });
            }
            self.push_status(&group, &mut outcome).await;
        }

        self.remove_undeclared_groups(&mut outcome).await;
        outcome
    }

    fn build_group(&self, spec: &NodeGroupSpec) -> NodeGroup {
        let desired = manifests::desired_workload(&self.cluster, spec);
        NodeGroup::new(
            &self.topology.cluster,
            &self.topology.namespace,
            spec.roles.clone(),
            spec.replicas,
            desired,
            self.collaborators.clone(),
        )
    }

    /// Drive one group through its cycle for this pass.
    ///
    /// A master-eligible group with desired replicas must have verifiably
    /// rejoined the cluster before the next group may be touched.
    async fn advance_group(&self, group: &mut NodeGroup) -> Result<(), Error> {
        if group.is_missing().await? {
            group.create().await?;
        } else {
            group.ensure_scale().await?;
            group.progress_node_changes().await?;
        }
        if group.is_master_eligible() && group.replicas() > 0 {
            group.wait_for_node_rejoin_cluster().await?;
        }
        Ok(())
    }

    async fn push_status(&self, group: &NodeGroup, outcome: &mut ReconcileOutcome) {
        match group.state().await {
            Ok(status) => outcome.statuses.push(status),
            Err(error) => {
                tracing::error!(error = ?error, group = group.name(), "error deriving node group status");
                outcome.failures.push(GroupFailure {
                    group: group.name().to_string(),
                    error,
                });
            }
        }
    }

    /// Retire workloads carrying this cluster's labels but absent from the
    /// declared topology: scale to zero, wait for the nodes to leave the
    /// cluster, then delete.
    async fn remove_undeclared_groups(&self, outcome: &mut ReconcileOutcome) {
        let selector = manifests::cluster_selector(&self.topology.cluster);
        let live = match self.collaborators.backend.list(&self.topology.namespace, &selector).await {
            Ok(live) => live,
            Err(error) => {
                tracing::error!(error = ?error, "error listing cluster workloads for removal check");
                outcome.failures.push(GroupFailure {
                    group: self.topology.cluster.clone(),
                    error,
                });
                return;
            }
        };

        let declared: HashSet<&str> = self.topology.groups.iter().map(|group| group.name.as_str()).collect();
        for workload in live {
            // Only node-group workloads are subject to retirement.
            if !workload.labels().contains_key(manifests::LABEL_NODE_GROUP) {
                continue;
            }
            if declared.contains(workload.name()) {
                continue;
            }
            tracing::info!(
                workload = workload.name(),
                live_replicas = workload.status_replicas(),
                "retiring node group absent from declared topology",
            );
            let group = NodeGroup::from_live(&self.topology.cluster, &self.topology.namespace, workload, self.collaborators.clone());
            if let Err(error) = self.retire_group(&group).await {
                tracing::error!(error = ?error, group = group.name(), "error retiring node group");
                outcome.failures.push(GroupFailure {
                    group: group.name().to_string(),
                    error,
                });
            }
        }
    }

    async fn retire_group(&self, group: &NodeGroup) -> Result<(), Error> {
        group.scale_down().await?;
        group.wait_for_node_leave_cluster().await?;
        group.delete().await
    }
}

impl std::fmt::Debug for ClusterReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterReconciler")
            .field("cluster", &self.cluster.name())
            .field("namespace", &self.cluster.namespace())
            .finish()
    }
}
