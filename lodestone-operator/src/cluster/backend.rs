//! Workload backend.
//!
//! Node groups are backed by one of two workload kinds: a Deployment for
//! data-bearing groups, a StatefulSet for the rest. `NodeWorkload` folds both
//! into one capability surface so the rollout state machine never needs to
//! know which variant it is driving, and `WorkloadBackend` is the seam
//! through which every read and conditional write goes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use kube::api::{Api, ListParams, PostParams};
use kube::client::Client;
use tokio::time::timeout;

use lodestone_core::Error;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The number of attempts a conditional update makes before surfacing a conflict.
const CONFLICT_RETRIES: u32 = 5;
/// The delay between conflicting update attempts.
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// The annotation under which the Deployment controller records its rollout revision.
pub const DEPLOYMENT_REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// The kind of workload backing a node group.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WorkloadKind {
    /// A Deployment-backed group.
    Deployment,
    /// A StatefulSet-backed group.
    StatefulSet,
}

impl WorkloadKind {
    /// The K8s kind string of this workload kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
        }
    }
}

/// The key identifying one workload object in the backend.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WorkloadKey {
    /// The kind of the workload.
    pub kind: WorkloadKind,
    /// The name of the workload.
    pub name: String,
    /// The namespace of the workload.
    pub namespace: String,
}

/// The workload object backing one node group.
#[derive(Clone, Debug)]
pub enum NodeWorkload {
    /// A Deployment-backed group, paused via `spec.paused`.
    Deployment(Deployment),
    /// A StatefulSet-backed group, paused by pinning the rolling-update partition.
    StatefulSet(StatefulSet),
}

impl NodeWorkload {
    /// The kind of this workload.
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::Deployment(_) => WorkloadKind::Deployment,
            Self::StatefulSet(_) => WorkloadKind::StatefulSet,
        }
    }

    /// The backend key of this workload.
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey {
            kind: self.kind(),
            name: self.name().to_string(),
            namespace: self.namespace().to_string(),
        }
    }

    /// The name of this workload.
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// The namespace of this workload.
    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    fn metadata(&self) -> &kube::api::ObjectMeta {
        match self {
            Self::Deployment(dpl) => &dpl.metadata,
            Self::StatefulSet(sts) => &sts.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut kube::api::ObjectMeta {
        match self {
            Self::Deployment(dpl) => &mut dpl.metadata,
            Self::StatefulSet(sts) => &mut sts.metadata,
        }
    }

    /// The labels of this workload.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    /// Read the given annotation, if present.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Set the given annotation.
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let annotations = self.metadata_mut().annotations.get_or_insert_with(Default::default);
        annotations.insert(key.to_string(), value.to_string());
    }

    /// The desired replica count recorded on this workload.
    pub fn replicas(&self) -> i32 {
        match self {
            Self::Deployment(dpl) => dpl.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1),
            Self::StatefulSet(sts) => sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1),
        }
    }

    /// Set the desired replica count on this workload.
    pub fn set_replicas(&mut self, replicas: i32) {
        match self {
            Self::Deployment(dpl) => dpl.spec.get_or_insert_with(Default::default).replicas = Some(replicas),
            Self::StatefulSet(sts) => sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas),
        }
    }

    /// True if template changes are currently gated from propagating to pods.
    pub fn paused(&self) -> bool {
        match self {
            Self::Deployment(dpl) => dpl.spec.as_ref().and_then(|spec| spec.paused).unwrap_or(false),
            Self::StatefulSet(sts) => sts
                .spec
                .as_ref()
                .and_then(|spec| spec.update_strategy.as_ref())
                .and_then(|strategy| strategy.rolling_update.as_ref())
                .and_then(|rolling| rolling.partition)
                .map(|partition| partition > 0)
                .unwrap_or(false),
        }
    }

    /// Gate or release template propagation for this workload.
    ///
    /// StatefulSets have no paused field; pinning the rolling-update partition
    /// at the replica count keeps every ordinal from being updated, and
    /// releasing it to zero rolls the full set.
    pub fn set_paused(&mut self, paused: bool) {
        match self {
            Self::Deployment(dpl) => dpl.spec.get_or_insert_with(Default::default).paused = Some(paused),
            Self::StatefulSet(sts) => {
                let spec = sts.spec.get_or_insert_with(Default::default);
                let replicas = spec.replicas.unwrap_or(1);
                let strategy = spec.update_strategy.get_or_insert_with(Default::default);
                strategy.type_ = Some("RollingUpdate".into());
                let rolling = strategy.rolling_update.get_or_insert_with(Default::default);
                rolling.partition = Some(if paused { replicas.max(1) } else { 0 });
            }
        }
    }

    /// The pod template of this workload.
    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::Deployment(dpl) => dpl.spec.as_ref().map(|spec| &spec.template),
            Self::StatefulSet(sts) => sts.spec.as_ref().map(|spec| &spec.template),
        }
    }

    /// Replace the pod template of this workload, leaving all other fields untouched.
    pub fn set_template(&mut self, template: PodTemplateSpec) {
        match self {
            Self::Deployment(dpl) => dpl.spec.get_or_insert_with(Default::default).template = template,
            Self::StatefulSet(sts) => sts.spec.get_or_insert_with(Default::default).template = template,
        }
    }

    /// The opaque revision token the backend assigns on each template change.
    pub fn revision_token(&self) -> Option<String> {
        match self {
            Self::Deployment(_) => self.annotation(DEPLOYMENT_REVISION_ANNOTATION).map(str::to_string),
            Self::StatefulSet(sts) => sts.status.as_ref().and_then(|status| status.update_revision.clone()),
        }
    }

    /// The live replica count reported by the backend.
    pub fn status_replicas(&self) -> i32 {
        match self {
            Self::Deployment(dpl) => dpl.status.as_ref().and_then(|status| status.replicas).unwrap_or(0),
            Self::StatefulSet(sts) => sts.status.as_ref().map(|status| status.replicas).unwrap_or(0),
        }
    }
}

/// Returns true when an update must be issued for the current live object.
pub type NeedsUpdateFn = dyn Fn(&NodeWorkload, &NodeWorkload) -> bool + Send + Sync;
/// Applies the desired values onto the current live object.
pub type MutateFn = dyn Fn(&mut NodeWorkload, &NodeWorkload) + Send + Sync;

/// The outcome of a create call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateOutcome {
    /// The workload was created.
    Created,
    /// The workload already existed.
    AlreadyExists,
}

/// The outcome of a conditional update call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The workload was written.
    Updated,
    /// The gate declined the update, nothing was written.
    Unchanged,
}

/// Create/get/update/delete/list primitives for node group workloads.
#[async_trait]
pub trait WorkloadBackend: Send + Sync {
    /// Fetch the workload identified by the given key.
    async fn get(&self, key: &WorkloadKey) -> Result<NodeWorkload, Error>;

    /// Create the given workload.
    async fn create(&self, workload: &NodeWorkload) -> Result<CreateOutcome, Error>;

    /// Conditionally update the workload identified by `desired`'s key.
    ///
    /// The current object is re-read immediately before every attempt, the
    /// gate is consulted, the mutation is applied on top of the fresh copy,
    /// and the write is retried a bounded number of times on conflicting
    /// concurrent writers before the conflict is surfaced.
    async fn update(&self, desired: &NodeWorkload, needs_update: &NeedsUpdateFn, mutate: &MutateFn) -> Result<UpdateOutcome, Error>;

    /// Delete the workload identified by the given key. Absence is not an error.
    async fn delete(&self, key: &WorkloadKey) -> Result<(), Error>;

    /// List workloads in the namespace matching the given labels.
    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<NodeWorkload>, Error>;

    /// List pods in the namespace matching the given labels.
    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>, Error>;
}

/// The workload backend speaking to the Kubernetes API.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn statefulsets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn replace(&self, workload: &NodeWorkload) -> Result<(), kube::Error> {
        let params = PostParams::default();
        match workload {
            NodeWorkload::Deployment(dpl) => {
                let api = self.deployments(workload.namespace());
                api.replace(workload.name(), &params, dpl).await.map(|_| ())
            }
            NodeWorkload::StatefulSet(sts) => {
                let api = self.statefulsets(workload.namespace());
                api.replace(workload.name(), &params, sts).await.map(|_| ())
            }
        }
    }
}

#[async_trait]
impl WorkloadBackend for KubeBackend {
    async fn get(&self, key: &WorkloadKey) -> Result<NodeWorkload, Error> {
        let res = match key.kind {
            WorkloadKind::Deployment => timeout(API_TIMEOUT, self.deployments(&key.namespace).get(&key.name))
                .await
                .map(|res| res.map(NodeWorkload::Deployment)),
            WorkloadKind::StatefulSet => timeout(API_TIMEOUT, self.statefulsets(&key.namespace).get(&key.name))
                .await
                .map(|res| res.map(NodeWorkload::StatefulSet)),
        };
        match res {
            Ok(Ok(workload)) => Ok(workload),
            Ok(Err(err)) => Err(map_kube_err(err, key, "error fetching workload")),
            Err(_elapsed) => Err(backend_err(&key.name, &key.namespace, anyhow!("timeout while fetching workload"))),
        }
    }

    async fn create(&self, workload: &NodeWorkload) -> Result<CreateOutcome, Error> {
        let params = PostParams::default();
        let res = match workload {
            NodeWorkload::Deployment(dpl) => timeout(API_TIMEOUT, self.deployments(workload.namespace()).create(&params, dpl))
                .await
                .map(|res| res.map(|_| ())),
            NodeWorkload::StatefulSet(sts) => timeout(API_TIMEOUT, self.statefulsets(workload.namespace()).create(&params, sts))
                .await
                .map(|res| res.map(|_| ())),
        };
        match res {
            Ok(Ok(())) => Ok(CreateOutcome::Created),
            Ok(Err(kube::Error::Api(api_err))) if api_err.code == http::StatusCode::CONFLICT => Ok(CreateOutcome::AlreadyExists),
            Ok(Err(err)) => Err(backend_err(workload.name(), workload.namespace(), anyhow!(err).context("error creating workload"))),
            Err(_elapsed) => Err(backend_err(workload.name(), workload.namespace(), anyhow!("timeout while creating workload"))),
        }
    }

    async fn update(&self, desired: &NodeWorkload, needs_update: &NeedsUpdateFn, mutate: &MutateFn) -> Result<UpdateOutcome, Error> {
        let key = desired.key();
        for _attempt in 0..CONFLICT_RETRIES {
            let mut current = self.get(&key).await?;
            if !needs_update(&current, desired) {
                return Ok(UpdateOutcome::Unchanged);
            }
            mutate(&mut current, desired);
            let res = timeout(API_TIMEOUT, self.replace(&current)).await;
            match res {
                Ok(Ok(())) => return Ok(UpdateOutcome::Updated),
                Ok(Err(kube::Error::Api(api_err))) if api_err.code == http::StatusCode::CONFLICT => {
                    tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                    continue;
                }
                Ok(Err(err)) => return Err(backend_err(&key.name, &key.namespace, anyhow!(err).context("error updating workload"))),
                Err(_elapsed) => return Err(backend_err(&key.name, &key.namespace, anyhow!("timeout while updating workload"))),
            }
        }
        Err(Error::Conflict {
            name: key.name,
            namespace: key.namespace,
            attempts: CONFLICT_RETRIES,
        })
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<(), Error> {
        let res = match key.kind {
            WorkloadKind::Deployment => timeout(API_TIMEOUT, self.deployments(&key.namespace).delete(&key.name, &Default::default()))
                .await
                .map(|res| res.map(|_| ())),
            WorkloadKind::StatefulSet => timeout(API_TIMEOUT, self.statefulsets(&key.namespace).delete(&key.name, &Default::default()))
                .await
                .map(|res| res.map(|_| ())),
        };
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(kube::Error::Api(api_err))) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
            Ok(Err(err)) => Err(backend_err(&key.name, &key.namespace, anyhow!(err).context("error deleting workload"))),
            Err(_elapsed) => Err(backend_err(&key.name, &key.namespace, anyhow!("timeout while deleting workload"))),
        }
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<NodeWorkload>, Error> {
        let params = ListParams {
            label_selector: Some(selector_string(selector)),
            ..Default::default()
        };
        let deployments = timeout(API_TIMEOUT, self.deployments(namespace).list(&params)).await;
        let statefulsets = timeout(API_TIMEOUT, self.statefulsets(namespace).list(&params)).await;
        let mut workloads = vec![];
        match deployments {
            Ok(Ok(list)) => workloads.extend(list.items.into_iter().map(NodeWorkload::Deployment)),
            Ok(Err(err)) => return Err(backend_err(namespace, namespace, anyhow!(err).context("error listing deployments"))),
            Err(_elapsed) => return Err(backend_err(namespace, namespace, anyhow!("timeout while listing deployments"))),
        }
        match statefulsets {
            Ok(Ok(list)) => workloads.extend(list.items.into_iter().map(NodeWorkload::StatefulSet)),
            Ok(Err(err)) => return Err(backend_err(namespace, namespace, anyhow!(err).context("error listing statefulsets"))),
            Err(_elapsed) => return Err(backend_err(namespace, namespace, anyhow!("timeout while listing statefulsets"))),
        }
        Ok(workloads)
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>, Error> {
        let params = ListParams {
            label_selector: Some(selector_string(selector)),
            ..Default::default()
        };
        match timeout(API_TIMEOUT, self.pods(namespace).list(&params)).await {
            Ok(Ok(list)) => Ok(list.items),
            Ok(Err(err)) => Err(backend_err(namespace, namespace, anyhow!(err).context("error listing pods"))),
            Err(_elapsed) => Err(backend_err(namespace, namespace, anyhow!("timeout while listing pods"))),
        }
    }
}

/// Render a label map as a K8s label selector string.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

fn map_kube_err(err: kube::Error, key: &WorkloadKey, context: &'static str) -> Error {
    match err {
        kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Error::NotFound {
            kind: key.kind.as_str(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
        },
        err => backend_err(&key.name, &key.namespace, anyhow!(err).context(context)),
    }
}

fn backend_err(name: &str, namespace: &str, source: anyhow::Error) -> Error {
    Error::Backend {
        name: name.to_string(),
        namespace: namespace.to_string(),
        source,
    }
}
