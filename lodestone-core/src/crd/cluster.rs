//! SearchCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type SearchCluster = SearchClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the SearchCluster resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "SearchClusterCRD",
    status = "SearchClusterStatus",
    group = "lodestone.rs",
    version = "v1beta1",
    kind = "SearchCluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "sc",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Redundancy Policy","type":"string","jsonPath":".spec.redundancyPolicy"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterSpec {
    /// The container image used for every node of the cluster.
    pub image: String,

    /// The declared node topology of the cluster.
    ///
    /// Each entry describes one homogeneously-configured node group. The
    /// operator derives the rollout order from the role assignments, not from
    /// the declaration order, so entries may be listed in any order.
    pub nodes: Vec<NodeSet>,

    /// The index redundancy policy of the cluster.
    #[serde(default)]
    pub redundancy_policy: RedundancyPolicy,
}

/// One homogeneously-configured set of search nodes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    /// The roles assigned to every node of this set.
    pub roles: Vec<NodeRole>,
    /// The target replica count of this set.
    pub replicas: i32,
    /// Node selector constraining where this set's pods may be scheduled.
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Tolerations applied to this set's pods.
    #[serde(default)]
    pub tolerations: Option<Vec<NodeToleration>>,
    /// Compute resources applied to this set's node containers.
    #[serde(default)]
    pub resources: Option<NodeResources>,
    /// Persistent storage for this set's nodes.
    #[serde(default)]
    pub storage: Option<NodeStorage>,
}

impl NodeSet {
    /// True if nodes of this set may participate in master election.
    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }

    /// True if nodes of this set hold index data.
    pub fn has_data_role(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }
}

/// A role which a search node may carry.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Master-eligible node, participates in cluster coordination.
    Master,
    /// Data node, holds index shards.
    Data,
    /// Client node, routes search and ingest traffic.
    Client,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Master => "master",
                Self::Data => "data",
                Self::Client => "client",
            }
        )
    }
}

/// The index redundancy policy of the cluster.
///
/// Controls how many replica shards are kept for each primary shard.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum RedundancyPolicy {
    /// No replica shards.
    ZeroRedundancy,
    /// One replica shard per primary shard.
    SingleRedundancy,
    /// Replicas on half of the data nodes.
    MultipleRedundancy,
    /// A replica on every data node.
    FullRedundancy,
}

impl Default for RedundancyPolicy {
    fn default() -> Self {
        Self::ZeroRedundancy
    }
}

impl std::fmt::Display for RedundancyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::ZeroRedundancy => "ZeroRedundancy",
                Self::SingleRedundancy => "SingleRedundancy",
                Self::MultipleRedundancy => "MultipleRedundancy",
                Self::FullRedundancy => "FullRedundancy",
            }
        )
    }
}

/// One pod toleration of a node set.
///
/// Mirrors the core toleration fields without depending on the k8s-openapi
/// type, which does not implement JsonSchema.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeToleration {
    /// The taint key the toleration applies to.
    #[serde(default)]
    pub key: Option<String>,
    /// The operator relating the key to the value, `Exists` or `Equal`.
    #[serde(default)]
    pub operator: Option<String>,
    /// The taint value the toleration matches.
    #[serde(default)]
    pub value: Option<String>,
    /// The taint effect to match, empty matches all effects.
    #[serde(default)]
    pub effect: Option<String>,
    /// How long the pod stays bound to a node with a matching `NoExecute` taint.
    #[serde(default)]
    pub toleration_seconds: Option<i64>,
}

/// Compute resources applied to a node set's containers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    /// CPU request, e.g. `100m`.
    #[serde(default)]
    pub cpu_request: Option<String>,
    /// CPU limit.
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Memory request, e.g. `2Gi`.
    #[serde(default)]
    pub memory_request: Option<String>,
    /// Memory limit.
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Persistent storage declaration for a node set.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStorage {
    /// The volume size to request, e.g. `10Gi`.
    pub size: String,
    /// The storage class to use for the volume claims.
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterStatus {
    /// Rollout conditions of each reconciled node group.
    #[serde(default)]
    pub nodes: Vec<NodeGroupStatus>,
}

/// Externally-visible rollout conditions of one node group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    /// The name of the workload backing this group.
    pub workload_name: String,
    /// Pending-change condition flags of this group.
    #[serde(default)]
    pub upgrade_status: NodeUpgradeStatus,
}

/// Pending-change condition flags of one node group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpgradeStatus {
    /// True when the group's live template has diverged from the declared topology.
    #[serde(default)]
    pub scheduled_for_upgrade: bool,
    /// True when the group's credential bundle has changed since its last rollout.
    #[serde(default)]
    pub scheduled_for_cert_redeploy: bool,
}
