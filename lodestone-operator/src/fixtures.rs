//! Test fixtures & utilities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::Resource;
use tokio::sync::broadcast;

use lodestone_core::crd::{NodeRole, NodeSet, RedundancyPolicy, SearchCluster, SearchClusterSpec};
use lodestone_core::Error;

use crate::cluster::backend::{
    CreateOutcome, MutateFn, NeedsUpdateFn, NodeWorkload, UpdateOutcome, WorkloadBackend, WorkloadKey, DEPLOYMENT_REVISION_ANNOTATION,
};
use crate::cluster::fingerprint::{BundleData, BundleSource};
use crate::cluster::membership::MembershipClient;
use crate::cluster::Collaborators;

/// The number of attempts the in-memory backend makes before surfacing a conflict.
pub const MEM_BACKEND_ATTEMPTS: u32 = 5;

/// An in-memory workload backend.
///
/// Pods are synthesized from each stored workload's template by default, so
/// rollout waits converge immediately; tests exercising timeouts switch the
/// convergence off or pin explicit pods.
pub struct MemBackend {
    state: Mutex<MemState>,
}

struct MemState {
    workloads: HashMap<WorkloadKey, NodeWorkload>,
    pods: Option<Vec<Pod>>,
    converge_pods: bool,
    stamp_revision_on_create: bool,
    conflicts_to_inject: u32,
    writes: u32,
    creates: u32,
    deletes: u32,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemState {
                workloads: Default::default(),
                pods: None,
                converge_pods: true,
                stamp_revision_on_create: true,
                conflicts_to_inject: 0,
                writes: 0,
                creates: 0,
                deletes: 0,
            }),
        }
    }
}

impl MemBackend {
    /// Seed the backend with an existing workload.
    pub fn insert(&self, workload: NodeWorkload) {
        let mut state = self.state.lock().unwrap();
        state.workloads.insert(workload.key(), workload);
    }

    /// Fetch a stored workload without going through the trait.
    pub fn stored(&self, key: &WorkloadKey) -> Option<NodeWorkload> {
        self.state.lock().unwrap().workloads.get(key).cloned()
    }

    /// The number of updates which actually wrote.
    pub fn writes(&self) -> u32 {
        self.state.lock().unwrap().writes
    }

    /// The number of create calls which actually created.
    pub fn creates(&self) -> u32 {
        self.state.lock().unwrap().creates
    }

    /// The number of delete calls which actually deleted.
    pub fn deletes(&self) -> u32 {
        self.state.lock().unwrap().deletes
    }

    /// Make the next `count` update attempts fail with a write conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().unwrap().conflicts_to_inject = count;
    }

    /// Control whether pods are synthesized from stored workload templates.
    pub fn set_converge_pods(&self, converge: bool) {
        self.state.lock().unwrap().converge_pods = converge;
    }

    /// Control whether created workloads receive a revision token.
    pub fn set_stamp_revision_on_create(&self, stamp: bool) {
        self.state.lock().unwrap().stamp_revision_on_create = stamp;
    }

    /// Pin an explicit pod list, bypassing template synthesis.
    pub fn set_pods(&self, pods: Vec<Pod>) {
        let mut state = self.state.lock().unwrap();
        state.converge_pods = false;
        state.pods = Some(pods);
    }

    fn stamp_revision(workload: &mut NodeWorkload) {
        match workload {
            NodeWorkload::Deployment(dpl) => {
                let annotations = dpl.metadata.annotations.get_or_insert_with(Default::default);
                annotations.insert(DEPLOYMENT_REVISION_ANNOTATION.to_string(), "1".to_string());
            }
            NodeWorkload::StatefulSet(sts) => {
                sts.status.get_or_insert_with(Default::default).update_revision = Some("1".into());
            }
        }
    }

    fn synthesize_pods(state: &MemState, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<Pod> {
        let mut pods = vec![];
        for workload in state.workloads.values() {
            if workload.namespace() != namespace {
                continue;
            }
            let template = match workload.template() {
                Some(template) => template,
                None => continue,
            };
            let labels = template
                .metadata
                .as_ref()
                .and_then(|meta| meta.labels.clone())
                .unwrap_or_default();
            if !selector.iter().all(|(key, value)| labels.get(key) == Some(value)) {
                continue;
            }
            for idx in 0..workload.replicas().max(0) {
                pods.push(Pod {
                    metadata: ObjectMeta {
                        name: Some(format!("{}-{}", workload.name(), idx)),
                        namespace: Some(namespace.to_string()),
                        labels: Some(labels.clone()),
                        ..Default::default()
                    },
                    spec: template.spec.clone(),
                    ..Default::default()
                });
            }
        }
        pods
    }
}

#[async_trait]
impl WorkloadBackend for MemBackend {
    async fn get(&self, key: &WorkloadKey) -> Result<NodeWorkload, Error> {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    async fn create(&self, workload: &NodeWorkload) -> Result<CreateOutcome, Error> {
        let mut state = self.state.lock().unwrap();
        let key = workload.key();
        if state.workloads.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut stored = workload.clone();
        if state.stamp_revision_on_create {
            Self::stamp_revision(&mut stored);
        }
        state.workloads.insert(key, stored);
        state.creates += 1;
        Ok(CreateOutcome::Created)
    }

    async fn update(&self, desired: &NodeWorkload, needs_update: &NeedsUpdateFn, mutate: &MutateFn) -> Result<UpdateOutcome, Error> {
        let key = desired.key();
        for _attempt in 0..MEM_BACKEND_ATTEMPTS {
            let mut state = self.state.lock().unwrap();
            let current = state.workloads.get(&key).cloned().ok_or_else(|| not_found(&key))?;
            if !needs_update(&current, desired) {
                return Ok(UpdateOutcome::Unchanged);
            }
            let mut next = current;
            mutate(&mut next, desired);
            if state.conflicts_to_inject > 0 {
                state.conflicts_to_inject -= 1;
                continue;
            }
            state.workloads.insert(key.clone(), next);
            state.writes += 1;
            return Ok(UpdateOutcome::Updated);
        }
        Err(Error::Conflict {
            name: key.name,
            namespace: key.namespace,
            attempts: MEM_BACKEND_ATTEMPTS,
        })
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.workloads.remove(key).is_some() {
            state.deletes += 1;
        }
        Ok(())
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<NodeWorkload>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workloads
            .values()
            .filter(|workload| workload.namespace() == namespace)
            .filter(|workload| {
                let labels = workload.labels();
                selector.iter().all(|(key, value)| labels.get(key) == Some(value))
            })
            .cloned()
            .collect())
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>, Error> {
        let state = self.state.lock().unwrap();
        if let Some(pods) = state.pods.as_ref() {
            return Ok(pods
                .iter()
                .filter(|pod| {
                    let labels = pod.metadata.labels.clone().unwrap_or_default();
                    selector.iter().all(|(key, value)| labels.get(key) == Some(value))
                })
                .cloned()
                .collect());
        }
        if state.converge_pods {
            return Ok(Self::synthesize_pods(&state, namespace, selector));
        }
        Ok(vec![])
    }
}

fn not_found(key: &WorkloadKey) -> Error {
    Error::NotFound {
        kind: key.kind.as_str(),
        name: key.name.clone(),
        namespace: key.namespace.clone(),
    }
}

/// An in-memory cluster-membership client.
#[derive(Default)]
pub struct MemMembership {
    nodes: Mutex<HashSet<String>>,
}

impl MemMembership {
    /// Mark the named node as present in or absent from the cluster.
    pub fn set_in_cluster(&self, node: &str, in_cluster: bool) {
        let mut nodes = self.nodes.lock().unwrap();
        if in_cluster {
            nodes.insert(node.to_string());
        } else {
            nodes.remove(node);
        }
    }
}

#[async_trait]
impl MembershipClient for MemMembership {
    async fn is_node_in_cluster(&self, node_name: &str) -> Result<bool, Error> {
        Ok(self.nodes.lock().unwrap().contains(node_name))
    }
}

/// An in-memory bundle store.
#[derive(Default)]
pub struct MemBundles {
    bundles: Mutex<HashMap<String, BundleData>>,
}

impl MemBundles {
    /// Set the contents of the named bundle.
    pub fn set(&self, name: &str, data: BundleData) {
        self.bundles.lock().unwrap().insert(name.to_string(), data);
    }

    /// Remove the named bundle entirely.
    pub fn remove(&self, name: &str) {
        self.bundles.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl BundleSource for MemBundles {
    async fn fetch(&self, name: &str, _namespace: &str) -> Result<Option<BundleData>, Error> {
        Ok(self.bundles.lock().unwrap().get(name).cloned())
    }
}

/// Build bundle data from the given entries.
pub fn bundle(entries: &[(&str, &str)]) -> BundleData {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.as_bytes().to_vec()))
        .collect()
}

/// The full set of in-memory collaborators for one test.
pub struct TestHarness {
    pub backend: Arc<MemBackend>,
    pub membership: Arc<MemMembership>,
    pub config_bundles: Arc<MemBundles>,
    pub credential_bundles: Arc<MemBundles>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl TestHarness {
    /// Create a new harness with bundles seeded for the given cluster.
    pub fn new(cluster: &str) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(10);
        let harness = Self {
            backend: Arc::new(MemBackend::default()),
            membership: Arc::new(MemMembership::default()),
            config_bundles: Arc::new(MemBundles::default()),
            credential_bundles: Arc::new(MemBundles::default()),
            shutdown_tx,
        };
        harness
            .config_bundles
            .set(cluster, bundle(&[("search.yml", "cluster.name: test"), ("log4j2.properties", "rootLogger.level = info")]));
        harness.credential_bundles.set(cluster, bundle(&[("tls.crt", "cert-v1"), ("tls.key", "key-v1")]));
        harness
    }

    /// The collaborator handles of this harness.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            backend: self.backend.clone(),
            membership: self.membership.clone(),
            config_bundles: self.config_bundles.clone(),
            credential_bundles: self.credential_bundles.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}

/// Build a SearchCluster CR for tests.
pub fn test_cluster(name: &str, namespace: &str, nodes: Vec<NodeSet>) -> SearchCluster {
    let mut cluster = SearchCluster::new(
        name,
        SearchClusterSpec {
            image: "lodestone/search:1.0.0".into(),
            nodes,
            redundancy_policy: RedundancyPolicy::SingleRedundancy,
        },
    );
    cluster.meta_mut().namespace = Some(namespace.to_string());
    cluster
}

/// Build a node set with the given roles and replica count.
pub fn node_set(roles: Vec<NodeRole>, replicas: i32) -> NodeSet {
    NodeSet {
        roles,
        replicas,
        node_selector: None,
        tolerations: None,
        resources: None,
        storage: None,
    }
}
