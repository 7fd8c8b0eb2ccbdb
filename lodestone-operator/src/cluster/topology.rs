//! Topology math for a declared search cluster.
//!
//! Pure functions only, no I/O. The outputs feed configuration-bundle
//! rendering and the orchestrator's sizing and ordering decisions.

use std::collections::BTreeMap;

use lodestone_core::crd::{NodeResources, NodeRole, NodeSet, NodeStorage, NodeToleration, RedundancyPolicy, RequiredMetadata, SearchCluster};

use crate::cluster::backend::WorkloadKind;

/// The derived rollout plan for one declared cluster.
///
/// Recomputed from the custom-resource spec on every reconcile pass, owned by
/// the orchestrator for the duration of that pass.
#[derive(Clone, Debug)]
pub struct ClusterTopology {
    /// The name of the cluster.
    pub cluster: String,
    /// The namespace of the cluster.
    pub namespace: String,
    /// The node groups of the cluster, in rollout order.
    pub groups: Vec<NodeGroupSpec>,
    /// The number of master-eligible nodes.
    pub master_count: i32,
    /// The number of data nodes.
    pub data_count: i32,
    /// The minimum count of master-eligible nodes required for elections.
    pub quorum: i32,
    /// The number of primary shards for new indices.
    pub primary_shards: i32,
    /// The number of replica shards per primary.
    pub replica_shards: i32,
}

/// The desired shape of one node group.
#[derive(Clone, Debug)]
pub struct NodeGroupSpec {
    /// The name of the group's backing workload.
    pub name: String,
    /// The 1-based position of the group in the declared topology.
    pub ordinal: usize,
    /// The roles assigned to every node of the group.
    pub roles: Vec<NodeRole>,
    /// The target replica count of the group.
    pub replicas: i32,
    /// The workload kind backing the group.
    pub kind: WorkloadKind,
    /// Node selector constraining where the group's pods may be scheduled.
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Tolerations applied to the group's pods.
    pub tolerations: Option<Vec<NodeToleration>>,
    /// Compute resources applied to the group's node containers.
    pub resources: Option<NodeResources>,
    /// Persistent storage of the group's nodes.
    pub storage: Option<NodeStorage>,
}

impl NodeGroupSpec {
    /// True if nodes of this group may participate in master election.
    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }

    /// True if nodes of this group hold index data.
    pub fn has_data_role(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }
}

/// The minimum count of master-eligible nodes required for the cluster to
/// accept writes and elect a leader.
pub fn quorum(master_count: i32) -> i32 {
    master_count / 2 + 1
}

/// The number of master-eligible nodes in the declared topology.
pub fn master_node_count(nodes: &[NodeSet]) -> i32 {
    nodes.iter().filter(|set| set.is_master_eligible()).map(|set| set.replicas.max(0)).sum()
}

/// The number of data nodes in the declared topology.
pub fn data_node_count(nodes: &[NodeSet]) -> i32 {
    nodes.iter().filter(|set| set.has_data_role()).map(|set| set.replicas.max(0)).sum()
}

/// The number of primary shards for new indices, one per data node.
pub fn primary_shard_count(data_count: i32) -> i32 {
    data_count.max(1)
}

/// The number of replica shards per primary under the given policy.
pub fn replica_shard_count(policy: RedundancyPolicy, data_count: i32) -> i32 {
    match policy {
        RedundancyPolicy::ZeroRedundancy => 0,
        RedundancyPolicy::SingleRedundancy => {
            if data_count > 1 {
                1
            } else {
                0
            }
        }
        RedundancyPolicy::MultipleRedundancy => {
            if data_count > 1 {
                ((data_count - 1) / 2).max(1)
            } else {
                0
            }
        }
        RedundancyPolicy::FullRedundancy => (data_count - 1).max(0),
    }
}

/// The canonical short suffix of a role combination, `m`/`d`/`c` in fixed order.
///
/// A set declaring no roles acts as a coordinating-only node and is treated
/// as client-only.
pub fn role_suffix(roles: &[NodeRole]) -> String {
    let mut suffix = String::new();
    if roles.contains(&NodeRole::Master) {
        suffix.push('m');
    }
    if roles.contains(&NodeRole::Data) {
        suffix.push('d');
    }
    if roles.contains(&NodeRole::Client) {
        suffix.push('c');
    }
    if suffix.is_empty() {
        suffix.push('c');
    }
    suffix
}

/// The rollout priority of a role combination.
///
/// Dedicated master groups roll first, then master-eligible mixed groups,
/// then data groups, then client-only groups.
pub fn role_priority(roles: &[NodeRole]) -> u8 {
    let master = roles.contains(&NodeRole::Master);
    let data = roles.contains(&NodeRole::Data);
    match (master, data) {
        (true, false) if roles.len() == 1 => 0,
        (true, _) => 1,
        (false, true) => 2,
        (false, false) => 3,
    }
}

/// The name of the workload backing the given role combination and ordinal.
pub fn group_name(cluster: &str, roles: &[NodeRole], ordinal: usize) -> String {
    format!("{}-{}-{}", cluster, role_suffix(roles), ordinal)
}

/// Derive the full rollout plan from the declared cluster spec.
pub fn build(cluster: &SearchCluster) -> ClusterTopology {
    let name = cluster.name().to_string();
    let namespace = cluster.namespace().to_string();

    let mut groups: Vec<NodeGroupSpec> = cluster
        .spec
        .nodes
        .iter()
        .enumerate()
        .map(|(idx, set)| NodeGroupSpec {
            name: group_name(&name, &set.roles, idx + 1),
            ordinal: idx + 1,
            roles: set.roles.clone(),
            replicas: set.replicas.max(0),
            kind: if set.has_data_role() {
                WorkloadKind::Deployment
            } else {
                WorkloadKind::StatefulSet
            },
            node_selector: set.node_selector.clone(),
            tolerations: set.tolerations.clone(),
            resources: set.resources.clone(),
            storage: set.storage.clone(),
        })
        .collect();
    groups.sort_by_key(|group| (role_priority(&group.roles), group.ordinal));

    let master_count = master_node_count(&cluster.spec.nodes);
    let data_count = data_node_count(&cluster.spec.nodes);
    ClusterTopology {
        cluster: name,
        namespace,
        groups,
        master_count,
        data_count,
        quorum: quorum(master_count),
        primary_shards: primary_shard_count(data_count),
        replica_shards: replica_shard_count(cluster.spec.redundancy_policy, data_count),
    }
}
