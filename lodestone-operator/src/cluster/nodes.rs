//! The per-node-group rollout state machine.
//!
//! A node group is one named set of identically-configured search nodes
//! backed by one workload object. The state machine stages template drift
//! behind the workload's pause gate, releases it for exactly as long as the
//! rollout needs, and re-arms the gate before reporting the group settled.
//! Observed state is always refreshed from the backend before a transition is
//! decided; nothing carried in memory across reconcile passes is trusted.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

use lodestone_core::crd::{NodeGroupStatus, NodeRole, NodeUpgradeStatus};
use lodestone_core::Error;

use crate::cluster::backend::{CreateOutcome, NodeWorkload, WorkloadKey};
use crate::cluster::compare::{pod_specs_differ, pod_templates_differ};
use crate::cluster::fingerprint::{fetch_fingerprint, VOLATILE_CONFIG_KEYS};
use crate::cluster::manifests::group_selector;
use crate::cluster::Collaborators;

/// The annotation recording the last-applied configuration-bundle fingerprint.
pub const CONFIG_FINGERPRINT_ANNOTATION: &str = "lodestone.rs/config-fingerprint";
/// The annotation recording the last-applied credential-bundle fingerprint.
pub const CREDENTIAL_FINGERPRINT_ANNOTATION: &str = "lodestone.rs/credential-fingerprint";

/// The interval between wait-loop polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// The deadline for template and pod-spec convergence waits.
const ROLLOUT_DEADLINE: Duration = Duration::from_secs(30);
/// The deadline for cluster-membership waits.
const MEMBERSHIP_DEADLINE: Duration = Duration::from_secs(60);

/// The rollout phase of a node group.
///
/// `Paused` is the terminal-per-cycle state; the machine re-enters
/// `UpdatePending` whenever a new reconcile detects drift.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RolloutPhase {
    /// The backing workload does not exist.
    Missing,
    /// The backing workload is being created.
    Creating,
    /// Stable, no pending change.
    Paused,
    /// The template has diverged from live, still paused.
    UpdatePending,
    /// Unpaused, waiting for the new template to be observed on all pods.
    RollingOut,
    /// Rolled out, waiting for cluster-membership confirmation.
    RejoinPending,
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Missing => "missing",
                Self::Creating => "creating",
                Self::Paused => "paused",
                Self::UpdatePending => "update-pending",
                Self::RollingOut => "rolling-out",
                Self::RejoinPending => "rejoin-pending",
            }
        )
    }
}

/// The rollout state machine for one node group.
pub struct NodeGroup {
    /// The name of the owning cluster.
    cluster: String,
    /// The namespace of the owning cluster.
    namespace: String,
    /// The desired workload, rebuilt from the cluster spec each reconcile.
    desired: NodeWorkload,
    /// The target replica count of the group.
    replicas: i32,
    /// The roles carried by every node of the group.
    roles: Vec<NodeRole>,
    /// The current rollout phase.
    phase: RolloutPhase,
    /// The labels selecting this group's pods.
    selector: BTreeMap<String, String>,
    /// Handles to the external collaborators.
    collaborators: Collaborators,
}

impl NodeGroup {
    /// Create a new instance from the desired shape of the group.
    pub fn new(cluster: &str, namespace: &str, roles: Vec<NodeRole>, replicas: i32, desired: NodeWorkload, collaborators: Collaborators) -> Self {
        let selector = group_selector(cluster, desired.name());
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            desired,
            replicas,
            roles,
            phase: RolloutPhase::Paused,
            selector,
            collaborators,
        }
    }

    /// Create an instance for a live workload with no declared counterpart.
    ///
    /// Used to retire groups removed from the topology; the live object is
    /// taken as its own desired state.
    pub fn from_live(cluster: &str, namespace: &str, live: NodeWorkload, collaborators: Collaborators) -> Self {
        let replicas = live.replicas();
        Self::new(cluster, namespace, Vec::new(), replicas, live, collaborators)
    }

    /// The name of the group's backing workload.
    pub fn name(&self) -> &str {
        self.desired.name()
    }

    /// The current rollout phase of the group.
    pub fn phase(&self) -> RolloutPhase {
        self.phase
    }

    /// The target replica count of the group.
    pub fn replicas(&self) -> i32 {
        self.replicas
    }

    /// True if nodes of this group may participate in master election.
    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }

    fn key(&self) -> WorkloadKey {
        self.desired.key()
    }

    /// True if the backing workload does not exist.
    pub async fn is_missing(&mut self) -> Result<bool, Error> {
        match self.collaborators.backend.get(&self.key()).await {
            Ok(_workload) => Ok(false),
            Err(err) if err.is_not_found() => {
                self.phase = RolloutPhase::Missing;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Create the backing workload in a paused state and record baselines.
    ///
    /// Idempotent: an already-existing workload gets its pause gate
    /// re-asserted instead of erroring. Creation is only complete once the
    /// backend has assigned its first revision token; failure to observe one
    /// within the wait bound is fatal for this pass.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.cluster, group = %self.name()))]
    pub async fn create(&mut self) -> Result<(), Error> {
        self.phase = RolloutPhase::Creating;
        let mut workload = self.desired.clone();
        workload.set_replicas(self.replicas);
        workload.set_paused(true);
        match self.collaborators.backend.create(&workload).await? {
            CreateOutcome::Created => {
                tracing::info!(group = self.name(), cluster = %self.cluster, namespace = %self.namespace, "created node group workload");
            }
            CreateOutcome::AlreadyExists => {
                self.pause().await?;
            }
        }
        self.wait_for_initial_rollout().await?;
        self.refresh_fingerprints().await?;
        self.phase = RolloutPhase::Paused;
        Ok(())
    }

    /// Block until the backend assigns the workload its first revision token.
    async fn wait_for_initial_rollout(&self) -> Result<(), Error> {
        let backend = self.collaborators.backend.clone();
        let key = self.key();
        let what = format!("initial rollout of node group {}", self.name());
        poll_until(&self.collaborators.shutdown_tx, what, POLL_INTERVAL, ROLLOUT_DEADLINE, move || {
            let (backend, key) = (backend.clone(), key.clone());
            async move {
                match backend.get(&key).await {
                    Ok(workload) => Ok(workload.revision_token().is_some()),
                    Err(err) if err.is_not_found() => Ok(false),
                    Err(err) => Err(err),
                }
            }
        })
        .await
    }

    /// True if the group must be (re)created or its live template has
    /// diverged from the desired template.
    pub async fn is_changed(&self) -> Result<bool, Error> {
        let current = match self.collaborators.backend.get(&self.key()).await {
            Ok(current) => current,
            Err(err) if err.is_not_found() => return Ok(true),
            Err(err) => return Err(err),
        };
        match (current.template(), self.desired.template()) {
            (Some(current), Some(desired)) => Ok(pod_templates_differ(current, desired)),
            (None, None) => Ok(false),
            _ => Ok(true),
        }
    }

    /// True if every live pod of the group already runs the desired spec.
    ///
    /// Evaluated pod-by-pod since the backend may still be converging; the
    /// toleration check is non-strict because the control plane injects
    /// additional tolerations into live pods.
    pub async fn pod_specs_match(&self) -> Result<bool, Error> {
        let pods = self.collaborators.backend.list_pods(&self.namespace, &self.selector).await?;
        let desired_spec = self.desired.template().and_then(|template| template.spec.as_ref());
        let all_match = pods.iter().all(|pod| !pod_specs_differ(pod.spec.as_ref(), desired_spec, false));
        Ok(all_match && (self.replicas == 0 || !pods.is_empty()))
    }

    /// Merge the desired template into the live object, preserving all other
    /// live fields, gated on the pod-template difference rule.
    pub async fn execute_update(&self) -> Result<(), Error> {
        self.collaborators
            .backend
            .update(
                &self.desired,
                &|current, desired| match (current.template(), desired.template()) {
                    (Some(current), Some(desired)) => pod_templates_differ(current, desired),
                    (None, None) => false,
                    _ => true,
                },
                &|current, desired| {
                    if let Some(template) = desired.template() {
                        current.set_template(template.clone());
                    }
                },
            )
            .await?;
        tracing::info!(group = self.name(), cluster = %self.cluster, namespace = %self.namespace, "reconciled node group template");
        Ok(())
    }

    /// Arm the pause gate on the live object.
    pub async fn pause(&self) -> Result<(), Error> {
        self.set_paused(true).await
    }

    /// Release the pause gate on the live object.
    pub async fn unpause(&self) -> Result<(), Error> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<(), Error> {
        self.collaborators
            .backend
            .update(&self.desired, &|_, _| true, &move |current, _| current.set_paused(paused))
            .await?;
        tracing::debug!(group = self.name(), paused, "set node group pause state");
        Ok(())
    }

    /// Propagate a declared replica-count change to the live object.
    pub async fn ensure_scale(&self) -> Result<(), Error> {
        let live = self.collaborators.backend.get(&self.key()).await?;
        if live.replicas() != self.replicas {
            self.scale_up().await?;
        }
        Ok(())
    }

    /// Scale the group to its declared replica count.
    pub async fn scale_up(&self) -> Result<(), Error> {
        self.set_replica_count(self.replicas).await
    }

    /// Scale the group to zero replicas.
    pub async fn scale_down(&self) -> Result<(), Error> {
        self.set_replica_count(0).await
    }

    async fn set_replica_count(&self, replicas: i32) -> Result<(), Error> {
        self.collaborators
            .backend
            .update(&self.desired, &|_, _| true, &move |current, _| current.set_replicas(replicas))
            .await?;
        tracing::info!(group = self.name(), replicas, "scaled node group");
        Ok(())
    }

    /// Block until every live pod of the group runs the desired spec.
    ///
    /// A timeout is fatal for this pass; the group is intentionally left
    /// unpaused so the unconverged rollout stays visible on retry.
    pub async fn wait_for_node_rollout(&mut self) -> Result<(), Error> {
        self.phase = RolloutPhase::RollingOut;
        let backend = self.collaborators.backend.clone();
        let namespace = self.namespace.clone();
        let selector = self.selector.clone();
        let desired_template = self.desired.template().cloned();
        let replicas = self.replicas;
        let what = format!("rollout of node group {}", self.name());
        poll_until(&self.collaborators.shutdown_tx, what, POLL_INTERVAL, ROLLOUT_DEADLINE, move || {
            let (backend, namespace, selector, desired_template) = (backend.clone(), namespace.clone(), selector.clone(), desired_template.clone());
            async move {
                let pods = backend.list_pods(&namespace, &selector).await?;
                let desired_spec = desired_template.as_ref().and_then(|template| template.spec.as_ref());
                let all_match = pods.iter().all(|pod| !pod_specs_differ(pod.spec.as_ref(), desired_spec, false));
                Ok(all_match && (replicas == 0 || !pods.is_empty()))
            }
        })
        .await
    }

    /// Block until the cluster reports this group's nodes as members.
    pub async fn wait_for_node_rejoin_cluster(&mut self) -> Result<(), Error> {
        self.phase = RolloutPhase::RejoinPending;
        let membership = self.collaborators.membership.clone();
        let name = self.name().to_string();
        let what = format!("node group {} to rejoin the cluster", self.name());
        poll_until(&self.collaborators.shutdown_tx, what, POLL_INTERVAL, MEMBERSHIP_DEADLINE, move || {
            let (membership, name) = (membership.clone(), name.clone());
            async move { membership.is_node_in_cluster(&name).await }
        })
        .await?;
        self.phase = RolloutPhase::Paused;
        Ok(())
    }

    /// Block until the cluster no longer reports this group's nodes as members.
    pub async fn wait_for_node_leave_cluster(&self) -> Result<(), Error> {
        let membership = self.collaborators.membership.clone();
        let name = self.name().to_string();
        let what = format!("node group {} to leave the cluster", self.name());
        poll_until(&self.collaborators.shutdown_tx, what, POLL_INTERVAL, MEMBERSHIP_DEADLINE, move || {
            let (membership, name) = (membership.clone(), name.clone());
            async move { membership.is_node_in_cluster(&name).await.map(|in_cluster| !in_cluster) }
        })
        .await
    }

    /// The composite drift-resolution operation.
    ///
    /// No-op when neither the template nor the live pod specs have drifted;
    /// otherwise update, release the pause gate, wait for convergence, re-arm
    /// the gate, and refresh the fingerprint baselines. The group never stays
    /// unpaused longer than the rollout needs and never reports itself
    /// settled with a stale fingerprint.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.cluster, group = %self.name()))]
    pub async fn progress_node_changes(&mut self) -> Result<(), Error> {
        if !self.is_changed().await? && self.pod_specs_match().await? {
            self.phase = RolloutPhase::Paused;
            return Ok(());
        }

        self.phase = RolloutPhase::UpdatePending;
        self.execute_update().await?;
        self.unpause().await?;
        self.wait_for_node_rollout().await?;
        self.pause().await?;
        self.refresh_fingerprints().await?;
        self.phase = RolloutPhase::Paused;
        Ok(())
    }

    /// Recompute both bundle fingerprints and persist them on the workload.
    ///
    /// A bundle which disappears after a non-empty fingerprint was recorded
    /// keeps its recorded baseline; the anomaly is logged rather than
    /// silently adopted.
    pub async fn refresh_fingerprints(&self) -> Result<(), Error> {
        let config = fetch_fingerprint(
            self.collaborators.config_bundles.as_ref(),
            &self.cluster,
            &self.namespace,
            VOLATILE_CONFIG_KEYS,
        )
        .await?;
        let credentials = fetch_fingerprint(self.collaborators.credential_bundles.as_ref(), &self.cluster, &self.namespace, &[]).await?;

        let live = self.collaborators.backend.get(&self.key()).await?;
        let next_config = self.next_fingerprint(live.annotation(CONFIG_FINGERPRINT_ANNOTATION), config, "configuration");
        let next_credentials = self.next_fingerprint(live.annotation(CREDENTIAL_FINGERPRINT_ANNOTATION), credentials, "credential");

        let next_config_probe = next_config.clone();
        let next_credentials_probe = next_credentials.clone();
        self.collaborators
            .backend
            .update(
                &self.desired,
                &move |current, _| {
                    current.annotation(CONFIG_FINGERPRINT_ANNOTATION) != Some(next_config_probe.as_str())
                        || current.annotation(CREDENTIAL_FINGERPRINT_ANNOTATION) != Some(next_credentials_probe.as_str())
                },
                &move |current, _| {
                    current.set_annotation(CONFIG_FINGERPRINT_ANNOTATION, &next_config);
                    current.set_annotation(CREDENTIAL_FINGERPRINT_ANNOTATION, &next_credentials);
                },
            )
            .await?;
        Ok(())
    }

    fn next_fingerprint(&self, recorded: Option<&str>, current: String, bundle: &str) -> String {
        match recorded {
            Some(prior) if !prior.is_empty() && current.is_empty() => {
                tracing::warn!(
                    group = self.name(),
                    cluster = %self.cluster,
                    namespace = %self.namespace,
                    bundle,
                    "bundle disappeared after a fingerprint was recorded, keeping the recorded baseline",
                );
                prior.to_string()
            }
            _ => current,
        }
    }

    /// Derive the externally-visible status flags of the group.
    ///
    /// The upgrade flag reflects template drift. The credential-redeploy flag
    /// compares the live credential fingerprint against the recorded one; a
    /// group with no recorded fingerprint adopts the current one without
    /// flagging, so an operator restart never triggers spurious rollouts.
    pub async fn state(&self) -> Result<NodeGroupStatus, Error> {
        let scheduled_for_upgrade = self.is_changed().await?;

        let mut scheduled_for_cert_redeploy = false;
        let live = match self.collaborators.backend.get(&self.key()).await {
            Ok(live) => Some(live),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        if let Some(live) = live {
            let current = fetch_fingerprint(self.collaborators.credential_bundles.as_ref(), &self.cluster, &self.namespace, &[]).await?;
            match live.annotation(CREDENTIAL_FINGERPRINT_ANNOTATION) {
                None | Some("") => {
                    if !current.is_empty() {
                        let current_probe = current.clone();
                        self.collaborators
                            .backend
                            .update(
                                &self.desired,
                                &move |workload, _| workload.annotation(CREDENTIAL_FINGERPRINT_ANNOTATION) != Some(current_probe.as_str()),
                                &move |workload, _| workload.set_annotation(CREDENTIAL_FINGERPRINT_ANNOTATION, &current),
                            )
                            .await?;
                    }
                }
                Some(recorded) if recorded != current => {
                    if current.is_empty() {
                        tracing::warn!(
                            group = self.name(),
                            cluster = %self.cluster,
                            namespace = %self.namespace,
                            "credential bundle disappeared after a fingerprint was recorded",
                        );
                    } else {
                        scheduled_for_cert_redeploy = true;
                    }
                }
                _ => {}
            }
        }

        Ok(NodeGroupStatus {
            workload_name: self.name().to_string(),
            upgrade_status: NodeUpgradeStatus {
                scheduled_for_upgrade,
                scheduled_for_cert_redeploy,
            },
        })
    }

    /// Delete the backing workload.
    pub async fn delete(&self) -> Result<(), Error> {
        tracing::info!(group = self.name(), cluster = %self.cluster, namespace = %self.namespace, "deleting node group workload");
        self.collaborators.backend.delete(&self.key()).await
    }
}

/// Poll the given condition at a fixed interval until it reports true, the
/// deadline expires, or the process begins shutting down.
async fn poll_until<F, Fut>(
    shutdown_tx: &broadcast::Sender<()>, what: String, interval: Duration, deadline: Duration, mut condition: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool, Error>>,
{
    let mut shutdown = BroadcastStream::new(shutdown_tx.subscribe());
    let wait = async {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if condition().await? {
                return Ok(());
            }
        }
    };
    tokio::select! {
        _ = shutdown.next() => Err(Error::Cancelled { what: what.clone() }),
        res = timeout(deadline, wait) => match res {
            Ok(res) => res,
            Err(_elapsed) => Err(Error::Timeout { what, deadline }),
        },
    }
}
