//! Durable record of which devices each pod's containers hold. This map
//! is exactly what the checkpoint file serializes.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// Devices and quantities bound to one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAllocation {
    /// `/dev/nvidiaN` names, ascending
    pub devices: Vec<String>,
    /// hundredths of a core
    pub cores: u32,
    /// bytes
    pub memory: u64,
}

/// pod uid -> container name -> allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCache {
    pub pod_gpu_mapping: HashMap<String, HashMap<String, ContainerAllocation>>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pods(&self) -> Vec<String> {
        self.pod_gpu_mapping.keys().cloned().collect()
    }

    pub fn insert(&mut self, pod_uid: &str, container_name: &str, info: ContainerAllocation) {
        self.pod_gpu_mapping
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), info);
    }

    pub fn get(&self, pod_uid: &str) -> Option<&HashMap<String, ContainerAllocation>> {
        self.pod_gpu_mapping.get(pod_uid)
    }

    pub fn get_container(
        &self,
        pod_uid: &str,
        container_name: &str,
    ) -> Option<&ContainerAllocation> {
        self.pod_gpu_mapping
            .get(pod_uid)?
            .get(container_name)
    }

    pub fn delete(&mut self, pod_uid: &str) {
        self.pod_gpu_mapping.remove(pod_uid);
    }
}
