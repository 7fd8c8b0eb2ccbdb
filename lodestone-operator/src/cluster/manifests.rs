//! Construction of the desired workload object for a node group.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentStrategy, StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, TCPSocketAction,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;

use lodestone_core::crd::{NodeResources, NodeToleration, RequiredMetadata, SearchCluster};

use crate::cluster::backend::{NodeWorkload, WorkloadKind};
use crate::cluster::topology::NodeGroupSpec;

/// The pod container name of the search node.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
pub const CONTAINER_NAME: &str = "lodestone";

/// The canonical Lodestone label identifying a cluster.
pub const LABEL_CLUSTER: &str = "lodestone.rs/cluster";
/// The canonical Lodestone label identifying a node group.
pub const LABEL_NODE_GROUP: &str = "lodestone.rs/node-group";

/// The port used for search and ingest traffic.
const PORT_HTTP: i32 = 9200;
/// The port used for node-to-node transport.
const PORT_TRANSPORT: i32 = 9300;
/// The location where the rendered configuration bundle is mounted.
const CONFIG_PATH: &str = "/usr/share/lodestone/config";
/// The location where nodes place their index data.
const DATA_PATH: &str = "/usr/share/lodestone/data";

/// Set the canonical labels on an object controlled by Lodestone.
pub fn set_canonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "lodestone".into());
    labels.insert("lodestone.rs/controlled-by".into(), "lodestone-operator".into());
}

/// The labels selecting the pods of one node group.
pub fn group_selector(cluster: &str, group: &str) -> BTreeMap<String, String> {
    maplit::btreemap! {
        LABEL_CLUSTER.to_string() => cluster.to_string(),
        LABEL_NODE_GROUP.to_string() => group.to_string(),
    }
}

/// The labels selecting every workload of one cluster.
pub fn cluster_selector(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    set_canonical_labels(&mut labels);
    labels.insert(LABEL_CLUSTER.into(), cluster.into());
    labels
}

/// Build the desired workload object for the given node group.
pub fn desired_workload(cluster: &SearchCluster, group: &NodeGroupSpec) -> NodeWorkload {
    match group.kind {
        WorkloadKind::Deployment => NodeWorkload::Deployment(build_deployment(cluster, group)),
        WorkloadKind::StatefulSet => NodeWorkload::StatefulSet(build_statefulset(cluster, group)),
    }
}

fn build_deployment(cluster: &SearchCluster, group: &NodeGroupSpec) -> Deployment {
    tracing::debug!(group = %group.name, "building a new deployment for node group");

    let mut dpl = Deployment::default();
    let labels = workload_labels(cluster, group);
    dpl.meta_mut().labels = Some(labels.clone());
    dpl.meta_mut().namespace = cluster.namespace().to_string().into();
    dpl.meta_mut().name = Some(group.name.clone());
    dpl.meta_mut().owner_references = owner_reference(cluster).map(|owner| vec![owner]);

    let spec = dpl.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(group.replicas);
    // Recreate keeps a node fully down before its replacement starts, so a
    // group never runs two generations of the same node concurrently.
    spec.strategy = Some(DeploymentStrategy {
        type_: Some("Recreate".into()),
        rolling_update: None,
    });
    spec.progress_deadline_seconds = Some(1800);
    spec.paused = Some(true);
    spec.selector = LabelSelector {
        match_labels: Some(group_selector(cluster.name(), &group.name)),
        ..Default::default()
    };
    spec.template = build_pod_template(cluster, group, labels);

    dpl
}

fn build_statefulset(cluster: &SearchCluster, group: &NodeGroupSpec) -> StatefulSet {
    tracing::debug!(group = %group.name, "building a new statefulset for node group");

    let mut sts = StatefulSet::default();
    let labels = workload_labels(cluster, group);
    sts.meta_mut().labels = Some(labels.clone());
    sts.meta_mut().namespace = cluster.namespace().to_string().into();
    sts.meta_mut().name = Some(group.name.clone());
    sts.meta_mut().owner_references = owner_reference(cluster).map(|owner| vec![owner]);

    let spec = sts.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(group.replicas);
    spec.service_name = cluster.name().into();
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: None,
    });
    spec.selector = LabelSelector {
        match_labels: Some(group_selector(cluster.name(), &group.name)),
        ..Default::default()
    };
    spec.template = build_pod_template(cluster, group, labels);

    if let Some(storage) = group.storage.as_ref() {
        spec.volume_claim_templates = Some(vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                storage_class_name: storage.storage_class.clone(),
                resources: Some(ResourceRequirements {
                    requests: Some(maplit::btreemap! {
                        "storage".into() => Quantity(storage.size.clone()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    sts
}

fn workload_labels(cluster: &SearchCluster, group: &NodeGroupSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    set_canonical_labels(&mut labels);
    labels.insert(LABEL_CLUSTER.into(), cluster.name().into());
    labels.insert(LABEL_NODE_GROUP.into(), group.name.clone());
    labels
}

fn build_pod_template(cluster: &SearchCluster, group: &NodeGroupSpec, labels: BTreeMap<String, String>) -> PodTemplateSpec {
    let roles = group
        .roles
        .iter()
        .map(|role| role.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let mut volumes = vec![Volume {
        name: "config".into(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(cluster.name().into()),
            ..Default::default()
        }),
        ..Default::default()
    }];
    // Stateful groups with declared storage get their data volume from the
    // claim template; deployment-backed groups reference the group's claim by
    // convention. Everything else falls back to a scratch volume.
    match (group.kind, group.storage.as_ref()) {
        (WorkloadKind::Deployment, Some(_storage)) => volumes.push(Volume {
            name: "data".into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!("{}-data", group.name),
                ..Default::default()
            }),
            ..Default::default()
        }),
        (WorkloadKind::StatefulSet, Some(_storage)) => (),
        (_, None) => volumes.push(Volume {
            name: "data".into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }),
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(120),
            service_account_name: Some("lodestone".into()),
            node_selector: group.node_selector.clone(),
            tolerations: group
                .tolerations
                .as_ref()
                .map(|tolerations| tolerations.iter().map(toleration).collect()),
            containers: vec![Container {
                // NOTE WELL: do not change the name of this container. It will cause breaking changes.
                name: CONTAINER_NAME.into(),
                image: Some(cluster.spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".into()),
                ports: Some(vec![
                    ContainerPort {
                        name: Some("http".into()),
                        container_port: PORT_HTTP,
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    },
                    ContainerPort {
                        name: Some("transport".into()),
                        container_port: PORT_TRANSPORT,
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    },
                ]),
                env: Some(vec![
                    EnvVar {
                        name: "CLUSTER_NAME".into(),
                        value: Some(cluster.name().into()),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "NODE_ROLES".into(),
                        value: Some(roles),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "NAMESPACE".into(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: "metadata.namespace".into(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "NODE_NAME".into(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: "metadata.name".into(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                volume_mounts: Some(
                    std::iter::once(VolumeMount {
                        name: "config".into(),
                        mount_path: CONFIG_PATH.into(),
                        ..Default::default()
                    })
                    .chain(std::iter::once(VolumeMount {
                        name: "data".into(),
                        mount_path: DATA_PATH.into(),
                        ..Default::default()
                    }))
                    .collect(),
                ),
                resources: resource_requirements(group.resources.as_ref()),
                readiness_probe: Some(Probe {
                    initial_delay_seconds: Some(10),
                    period_seconds: Some(5),
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(PORT_HTTP),
                        host: None,
                    }),
                    ..Default::default()
                }),
                liveness_probe: Some(Probe {
                    initial_delay_seconds: Some(30),
                    period_seconds: Some(20),
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(PORT_TRANSPORT),
                        host: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
    }
}

/// Convert a declared toleration into the core type.
fn toleration(spec: &NodeToleration) -> Toleration {
    Toleration {
        key: spec.key.clone(),
        operator: spec.operator.clone(),
        value: spec.value.clone(),
        effect: spec.effect.clone(),
        toleration_seconds: spec.toleration_seconds,
    }
}

/// Convert declared resources into the core requirements type.
fn resource_requirements(resources: Option<&NodeResources>) -> Option<ResourceRequirements> {
    let resources = resources?;
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    if let Some(cpu) = resources.cpu_request.as_ref() {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = resources.memory_request.as_ref() {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = resources.cpu_limit.as_ref() {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = resources.memory_limit.as_ref() {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    Some(ResourceRequirements {
        requests: if requests.is_empty() { None } else { Some(requests) },
        limits: if limits.is_empty() { None } else { Some(limits) },
    })
}

/// Build an owner reference to the given cluster, when its UID is known.
fn owner_reference(cluster: &SearchCluster) -> Option<OwnerReference> {
    let uid = cluster.meta().uid.clone()?;
    Some(OwnerReference {
        api_version: "lodestone.rs/v1beta1".into(),
        kind: "SearchCluster".into(),
        name: cluster.name().into(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}
