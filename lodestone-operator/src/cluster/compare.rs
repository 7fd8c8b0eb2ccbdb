//! Pod spec difference rules used for drift detection.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, Toleration, VolumeMount};

/// Compare two pod template specs, returning true if they differ.
///
/// Template comparisons use strict toleration matching, since both sides come
/// from workload objects which the control plane does not mutate.
pub fn pod_templates_differ(current: &PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    pod_specs_differ(current.spec.as_ref(), desired.spec.as_ref(), true)
}

/// Compare two pod specs, returning true only if they differ in any of:
/// - container count,
/// - node selectors,
/// - tolerations (strict equality, or a superset check for live pods since
///   the control plane injects additional tolerations),
/// - per-container name, image, volume mounts, env, args, ports or resources.
///
/// A container present on the live side but absent from desired also counts
/// as changed.
pub fn pod_specs_differ(live: Option<&PodSpec>, desired: Option<&PodSpec>, strict_tolerations: bool) -> bool {
    let (live, desired) = match (live, desired) {
        (Some(live), Some(desired)) => (live, desired),
        (None, None) => return false,
        _ => return true,
    };

    let mut changed = false;
    if live.containers.len() != desired.containers.len() {
        changed = true;
    }

    if !selectors_same(live.node_selector.as_ref(), desired.node_selector.as_ref()) {
        changed = true;
    }

    let live_tolerations = live.tolerations.as_deref().unwrap_or_default();
    let desired_tolerations = desired.tolerations.as_deref().unwrap_or_default();
    if strict_tolerations {
        if !tolerations_same(live_tolerations, desired_tolerations) {
            changed = true;
        }
    } else if !contains_same_tolerations(live_tolerations, desired_tolerations) {
        changed = true;
    }

    for live_container in &live.containers {
        let mut found = false;
        for desired_container in &desired.containers {
            // Only compare containers with the same name.
            if live_container.name != desired_container.name {
                continue;
            }
            found = true;

            // Live pods carry injected service-account mounts, so check that
            // the desired mounts are all present rather than deep-equality.
            if !contains_same_volume_mounts(
                live_container.volume_mounts.as_deref().unwrap_or_default(),
                desired_container.volume_mounts.as_deref().unwrap_or_default(),
            ) {
                changed = true;
            }
            if live_container.image != desired_container.image {
                changed = true;
            }
            if !env_values_equal(
                live_container.env.as_deref().unwrap_or_default(),
                desired_container.env.as_deref().unwrap_or_default(),
            ) {
                changed = true;
            }
            if live_container.args != desired_container.args {
                changed = true;
            }
            if live_container.ports != desired_container.ports {
                changed = true;
            }
            if !resources_same(live_container.resources.as_ref(), desired_container.resources.as_ref()) {
                changed = true;
            }
        }
        if !found {
            changed = true;
        }
    }

    changed
}

/// Compare two node selectors, treating an absent selector as empty.
fn selectors_same(lhs: Option<&BTreeMap<String, String>>, rhs: Option<&BTreeMap<String, String>>) -> bool {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs == rhs,
        (Some(only), None) | (None, Some(only)) => only.is_empty(),
        (None, None) => true,
    }
}

/// Strict toleration equality, ignoring ordering.
fn tolerations_same(lhs: &[Toleration], rhs: &[Toleration]) -> bool {
    lhs.len() == rhs.len() && contains_same_tolerations(lhs, rhs)
}

/// True if every desired toleration is present on the live side.
fn contains_same_tolerations(live: &[Toleration], desired: &[Toleration]) -> bool {
    desired.iter().all(|toleration| live.contains(toleration))
}

/// True if every desired volume mount is present on the live side.
fn contains_same_volume_mounts(live: &[VolumeMount], desired: &[VolumeMount]) -> bool {
    desired.iter().all(|mount| live.contains(mount))
}

/// Compare env vars by name, value and value source.
fn env_values_equal(live: &[EnvVar], desired: &[EnvVar]) -> bool {
    if live.len() != desired.len() {
        return false;
    }
    desired.iter().all(|rhs| {
        live.iter()
            .any(|lhs| lhs.name == rhs.name && lhs.value == rhs.value && lhs.value_from == rhs.value_from)
    })
}

/// Compare resource requirements, treating an absent block as empty.
fn resources_same(lhs: Option<&ResourceRequirements>, rhs: Option<&ResourceRequirements>) -> bool {
    let empty = ResourceRequirements::default();
    let lhs = lhs.unwrap_or(&empty);
    let rhs = rhs.unwrap_or(&empty);
    let maps_same = |lhs: Option<&BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>,
                     rhs: Option<&BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>| match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs == rhs,
        (Some(only), None) | (None, Some(only)) => only.is_empty(),
        (None, None) => true,
    };
    maps_same(lhs.requests.as_ref(), rhs.requests.as_ref()) && maps_same(lhs.limits.as_ref(), rhs.limits.as_ref())
}
