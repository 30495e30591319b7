//! Helpers that read CPU placement intent out of a pod.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

use super::nrt::Zone;
use super::nrt::ZONE_TYPE_NODE;
use super::KubernetesError;
use crate::policy::PolicyMode;

pub const ANNOTATION_CPU_POLICY: &str = "topology.crane.io/cpu-policy";
pub const ANNOTATION_TOPOLOGY_RESULT: &str = "topology.crane.io/topology-result";
pub const ANNOTATION_EXCLUDE_RESERVED_CPUS: &str = "topology.crane.io/exclude-reserved-cpus";

const RESOURCE_CPU: &str = "cpu";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerLookupError {
    #[error("no status with a container id for `{0}`, it may not be running")]
    NotFound(String),

    #[error("container `{0}` is still waiting")]
    Waiting(String),

    #[error("container `{0}` is terminated but the pod is still running")]
    Terminated(String),

    #[error("malformed container id `{0}`")]
    InvalidId(String),
}

/// `namespace/name`, the work queue key of a pod.
pub fn pod_key(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    Some(format!("{namespace}/{name}"))
}

pub fn split_pod_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

pub fn pod_uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or_default()
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// The policy requested by the pod's annotation. Unknown values count as
/// unset.
pub fn cpu_policy(pod: &Pod) -> Option<PolicyMode> {
    annotation(pod, ANNOTATION_CPU_POLICY).and_then(|value| value.parse().ok())
}

pub fn cpu_policy_or(pod: &Pod, default: PolicyMode) -> PolicyMode {
    cpu_policy(pod).unwrap_or(default)
}

pub fn excludes_reserved_cpus(pod: &Pod) -> bool {
    annotation(pod, ANNOTATION_EXCLUDE_RESERVED_CPUS) == Some("true")
}

/// The zones the topology scheduler placed the pod on.
///
/// `Ok(None)` means the scheduler has not annotated the pod yet.
pub fn topology_result(pod: &Pod) -> Result<Option<Vec<Zone>>, KubernetesError> {
    let Some(raw) = annotation(pod, ANNOTATION_TOPOLOGY_RESULT) else {
        return Ok(None);
    };
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| KubernetesError::AnnotationParseError {
            message: format!("{ANNOTATION_TOPOLOGY_RESULT}: {e}"),
        })
}

/// Only the NUMA node zones of a topology result.
pub fn numa_zones(zones: Vec<Zone>) -> Vec<Zone> {
    zones
        .into_iter()
        .filter(|zone| zone.zone_type == ZONE_TYPE_NODE)
        .collect()
}

/// Whole CPUs guaranteed to `container`: requests equal limits and are an
/// integer number of CPUs. Zero otherwise.
pub fn guaranteed_cpus(container: &Container) -> usize {
    let Some(resources) = container.resources.as_ref() else {
        return 0;
    };
    let request = resources
        .requests
        .as_ref()
        .and_then(|r| r.get(RESOURCE_CPU))
        .and_then(cpu_millis);
    let limit = resources
        .limits
        .as_ref()
        .and_then(|l| l.get(RESOURCE_CPU))
        .and_then(cpu_millis);

    match (request, limit) {
        (Some(request), Some(limit)) if request == limit && request % 1000 == 0 => {
            usize::try_from(request / 1000).unwrap_or(0)
        }
        _ => 0,
    }
}

/// App containers that get dedicated CPUs, with their CPU count.
pub fn target_containers(pod: &Pod) -> Vec<(&Container, usize)> {
    if cpu_policy(pod) == Some(PolicyMode::None) {
        return Vec::new();
    }
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .map(|container| (container, guaranteed_cpus(container)))
        .filter(|(_, cpus)| *cpus > 0)
        .collect()
}

/// Init and app container names.
pub fn container_names(pod: &Pod) -> Vec<&str> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .map(|container| container.name.as_str())
        .collect()
}

/// Succeeded or failed, or being deleted with no container left running.
pub fn is_terminated(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
        return true;
    }
    if pod.metadata.deletion_timestamp.is_none() {
        return false;
    }
    status
        .container_statuses
        .iter()
        .flatten()
        .all(|cs| cs.state.as_ref().map_or(true, |s| s.running.is_none()))
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> + '_ {
    pod.status.iter().flat_map(|status| {
        status
            .init_container_statuses
            .iter()
            .flatten()
            .chain(status.container_statuses.iter().flatten())
    })
}

/// Runtime ID of `container_name` if it is running.
pub fn running_container_id(
    pod: &Pod,
    container_name: &str,
) -> Result<String, ContainerLookupError> {
    let status = container_statuses(pod)
        .find(|cs| {
            cs.name == container_name && cs.container_id.as_deref().is_some_and(|id| !id.is_empty())
        })
        .ok_or_else(|| ContainerLookupError::NotFound(container_name.to_string()))?;

    let state = status.state.as_ref();
    let running = state.is_some_and(|s| s.running.is_some());
    let terminated = state.is_some_and(|s| s.terminated.is_some());
    let waiting = state.map_or(true, |s| s.waiting.is_some());
    if waiting || !(running || terminated) {
        return Err(ContainerLookupError::Waiting(container_name.to_string()));
    }
    if terminated {
        return Err(ContainerLookupError::Terminated(container_name.to_string()));
    }

    parse_container_id(status.container_id.as_deref().unwrap_or_default())
}

/// `<runtime>://<id>` -> `<id>`.
pub fn parse_container_id(raw: &str) -> Result<String, ContainerLookupError> {
    match raw.split_once("://") {
        Some((runtime, id)) if !runtime.is_empty() && !id.is_empty() => Ok(id.to_string()),
        _ => Err(ContainerLookupError::InvalidId(raw.to_string())),
    }
}

/// CPU quantity in millicores, rounded up like the API server does.
///
/// Supports plain decimals (`2`, `0.5`), millicores (`1500m`) and the `k`
/// suffix.
pub fn cpu_millis(quantity: &Quantity) -> Option<u64> {
    let raw = quantity.0.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse().ok();
    }
    if let Some(kilo) = raw.strip_suffix('k') {
        return decimal_millis(kilo)?.checked_mul(1000);
    }
    decimal_millis(raw)
}

fn decimal_millis(raw: &str) -> Option<u64> {
    let (int_part, frac_part) = raw.split_once('.').unwrap_or((raw, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let whole: u64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };
    let mut frac = 0u64;
    for (i, digit) in frac_part.bytes().enumerate() {
        let digit = u64::from(digit - b'0');
        if i < 3 {
            frac += digit * 10u64.pow(2 - i as u32);
        } else if digit > 0 {
            // Sub-millicore precision rounds up.
            frac += 1;
            break;
        }
    }
    whole.checked_mul(1000)?.checked_add(frac)
}

/// Whole CPUs of a quantity, rounded up.
pub fn cpu_value(quantity: &Quantity) -> Option<u64> {
    cpu_millis(quantity).map(|millis| millis.div_ceil(1000))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ContainerState;
    use k8s_openapi::api::core::v1::ContainerStateRunning;
    use k8s_openapi::api::core::v1::ContainerStateWaiting;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use kube::api::ObjectMeta;

    use super::*;

    pub fn container(name: &str, cpu: &str) -> Container {
        let resources: BTreeMap<String, Quantity> =
            [(RESOURCE_CPU.to_string(), Quantity(cpu.to_string()))].into();
        Container {
            name: name.to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(resources.clone()),
                limits: Some(resources),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn running_status(name: &str, id: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            container_id: Some(format!("containerd://{id}")),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn waiting_status(name: &str, id: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            container_id: Some(format!("containerd://{id}")),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn pod(
        name: &str,
        uid: &str,
        annotations: &[(&str, &str)],
        containers: Vec<Container>,
        statuses: Vec<ContainerStatus>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(statuses),
                ..Default::default()
            }),
        }
    }
}
