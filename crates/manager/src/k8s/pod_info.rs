//! GPU resource predicates and annotation helpers over pod specs.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::topology::HUNDRED_CORE;
use crate::types::GPU_ASSIGNED_ANNOTATION;
use crate::types::PREDICATE_TIME_ANNOTATION;
use crate::types::PRE_START_CHECK_ERR_MSG;
use crate::types::UNEXPECTED_ADMISSION_ERR_TYPE;
use crate::types::VCORE_RESOURCE;
use crate::types::VMEMORY_RESOURCE;

fn quantity_value(quantity: &Quantity) -> u64 {
    quantity.0.trim().parse().unwrap_or(0)
}

/// Pod uid, or empty when the API object carries none.
pub fn pod_uid(pod: &Pod) -> String {
    pod.metadata.uid.clone().unwrap_or_default()
}

pub fn pod_name(pod: &Pod) -> String {
    pod.metadata.name.clone().unwrap_or_default()
}

pub fn pod_namespace(pod: &Pod) -> String {
    pod.metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a String> {
    pod.metadata.annotations.as_ref().and_then(|a| a.get(key))
}

/// Resource limit of one container for the given extended resource name.
pub fn container_resource(container: &Container, resource: &str) -> u64 {
    container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|limits| limits.get(resource))
        .map(quantity_value)
        .unwrap_or(0)
}

/// Sum of a resource limit over all containers of a pod.
pub fn pod_resource(pod: &Pod, resource: &str) -> u64 {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| container_resource(c, resource))
                .sum()
        })
        .unwrap_or(0)
}

/// A container needs GPU devices when it asks for vcores, and sub-card
/// requests must also name their memory share.
pub fn is_gpu_required_container(container: &Container) -> bool {
    let vcore = container_resource(container, VCORE_RESOURCE);
    let vmemory = container_resource(container, VMEMORY_RESOURCE);
    vcore > 0 && (vcore >= HUNDRED_CORE as u64 || vmemory > 0)
}

pub fn is_gpu_required_pod(pod: &Pod) -> bool {
    let vcore = pod_resource(pod, VCORE_RESOURCE);
    let vmemory = pod_resource(pod, VMEMORY_RESOURCE);
    vcore > 0 && (vcore >= HUNDRED_CORE as u64 || vmemory > 0)
}

/// Whether the agent already bound devices for this pod. A missing flag
/// or an explicit "false" both count as unassigned.
pub fn is_gpu_assigned_pod(pod: &Pod) -> bool {
    match annotation(pod, GPU_ASSIGNED_ANNOTATION) {
        Some(v) => v != "false",
        None => false,
    }
}

/// Whether the external scheduler already ran its predicate over this pod
/// and is waiting for the agent to confirm the binding.
pub fn is_gpu_predicated_pod(pod: &Pod) -> bool {
    if pod_resource(pod, VCORE_RESOURCE) == 0 || pod_resource(pod, VMEMORY_RESOURCE) == 0 {
        return false;
    }
    if annotation(pod, PREDICATE_TIME_ANNOTATION).is_none() {
        return false;
    }
    match annotation(pod, GPU_ASSIGNED_ANNOTATION) {
        Some(v) => v == "false",
        None => false,
    }
}

/// Ordering key assigned by the scheduler; pods without it fall back to
/// their creation time.
pub fn predicate_time(pod: &Pod) -> u64 {
    if let Some(value) = annotation(pod, PREDICATE_TIME_ANNOTATION) {
        if let Ok(t) = value.parse() {
            return t;
        }
    }
    pod.metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| t.0.timestamp_nanos_opt())
        .map(|n| n as u64)
        .unwrap_or(0)
}

pub fn order_by_predicate_time(pods: &mut [Pod]) {
    pods.sort_by_key(predicate_time);
}

/// A pod should be evicted when its pre-start check already failed or the
/// kubelet rejected its admission.
pub fn should_delete(pod: &Pod) -> bool {
    if let Some(status) = pod.status.as_ref() {
        if let Some(statuses) = status.container_statuses.as_ref() {
            for cs in statuses {
                let waiting_message = cs
                    .state
                    .as_ref()
                    .and_then(|s| s.waiting.as_ref())
                    .and_then(|w| w.message.as_ref());
                if let Some(message) = waiting_message {
                    if message.contains(PRE_START_CHECK_ERR_MSG) {
                        return true;
                    }
                }
            }
        }
        if status.reason.as_deref() == Some(UNEXPECTED_ADMISSION_ERR_TYPE) {
            return true;
        }
    }
    false
}

/// Succeeded and Failed pods are gone; deleting pods count as terminated
/// once no container is running anymore.
pub fn pod_is_terminated(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Failed") | Some("Succeeded")) {
        return true;
    }
    if pod.metadata.deletion_timestamp.is_some() {
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());
        return not_running(statuses.map(Vec::as_slice).unwrap_or(&[]));
    }
    false
}

fn not_running(statuses: &[ContainerStatus]) -> bool {
    statuses.iter().all(|cs| {
        cs.state
            .as_ref()
            .map(|s| s.terminated.is_some() || s.waiting.is_some())
            .unwrap_or(true)
    })
}

pub fn container_index(pod: &Pod, container_name: &str) -> Option<usize> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .position(|c| c.name == container_name)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ContainerState;
    use k8s_openapi::api::core::v1::ContainerStateWaiting;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    pub(crate) fn gpu_container(name: &str, vcore: u64, vmemory: u64) -> Container {
        let mut limits = BTreeMap::new();
        if vcore > 0 {
            limits.insert(VCORE_RESOURCE.to_string(), Quantity(vcore.to_string()));
        }
        if vmemory > 0 {
            limits.insert(VMEMORY_RESOURCE.to_string(), Quantity(vmemory.to_string()));
        }
        Container {
            name: name.to_string(),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn gpu_pod(uid: &str, containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                name: Some(format!("pod-{uid}")),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn resource_parsing() {
        let c = gpu_container("main", 150, 4);
        assert_eq!(container_resource(&c, VCORE_RESOURCE), 150);
        assert_eq!(container_resource(&c, VMEMORY_RESOURCE), 4);
        assert_eq!(container_resource(&c, "vgpu.io/other"), 0);
    }

    #[test]
    fn gpu_requirement_rules() {
        // whole cards need no explicit memory
        assert!(is_gpu_required_container(&gpu_container("a", 100, 0)));
        assert!(is_gpu_required_container(&gpu_container("b", 200, 0)));
        // shared slices must carry both dimensions
        assert!(is_gpu_required_container(&gpu_container("c", 50, 1)));
        assert!(!is_gpu_required_container(&gpu_container("d", 50, 0)));
        assert!(!is_gpu_required_container(&gpu_container("e", 0, 4)));
    }

    #[test]
    fn assignment_flag() {
        let mut pod = gpu_pod("u1", vec![gpu_container("main", 100, 0)]);
        assert!(!is_gpu_assigned_pod(&pod));

        pod.metadata.annotations = Some(BTreeMap::from([(
            GPU_ASSIGNED_ANNOTATION.to_string(),
            "false".to_string(),
        )]));
        assert!(!is_gpu_assigned_pod(&pod));

        pod.metadata.annotations = Some(BTreeMap::from([(
            GPU_ASSIGNED_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        assert!(is_gpu_assigned_pod(&pod));
    }

    #[test]
    fn predicate_time_prefers_annotation() {
        let mut pod = gpu_pod("u1", vec![gpu_container("main", 100, 0)]);
        pod.metadata.annotations = Some(BTreeMap::from([(
            PREDICATE_TIME_ANNOTATION.to_string(),
            "12345".to_string(),
        )]));
        assert_eq!(predicate_time(&pod), 12345);
    }

    #[test]
    fn ordering_by_predicate_time() {
        let mut first = gpu_pod("u1", vec![gpu_container("main", 100, 0)]);
        first.metadata.annotations = Some(BTreeMap::from([(
            PREDICATE_TIME_ANNOTATION.to_string(),
            "200".to_string(),
        )]));
        let mut second = gpu_pod("u2", vec![gpu_container("main", 100, 0)]);
        second.metadata.annotations = Some(BTreeMap::from([(
            PREDICATE_TIME_ANNOTATION.to_string(),
            "100".to_string(),
        )]));

        let mut pods = vec![first, second];
        order_by_predicate_time(&mut pods);
        assert_eq!(pod_uid(&pods[0]), "u2");
        assert_eq!(pod_uid(&pods[1]), "u1");
    }

    #[test]
    fn delete_markers() {
        let mut pod = gpu_pod("u1", vec![gpu_container("main", 100, 0)]);
        assert!(!should_delete(&pod));

        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        message: Some(format!("{PRE_START_CHECK_ERR_MSG}: cache mismatch")),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(should_delete(&pod));

        pod.status = Some(PodStatus {
            reason: Some(UNEXPECTED_ADMISSION_ERR_TYPE.to_string()),
            ..Default::default()
        });
        assert!(should_delete(&pod));
    }

    #[test]
    fn termination_rules() {
        let mut pod = gpu_pod("u1", vec![gpu_container("main", 100, 0)]);
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(pod_is_terminated(&pod));

        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(!pod_is_terminated(&pod));

        // deleting pod with no running containers counts as gone
        pod.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ));
        assert!(pod_is_terminated(&pod));
    }
}
