//! Side table of full device-plugin responses, recoverable from the
//! kubelet's own checkpoint after a restart.

pub mod kubelet_checkpoint;

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;
use prost::Message;
use tracing::debug;
use tracing::warn;

use crate::device_plugin::api::ContainerAllocateResponse;
use crate::types::VCORE_RESOURCE;
use crate::types::VCUDA_MOUNTPOINT;

/// pod uid -> container name -> full allocate response, including the
/// mounts the virtual-device writer later needs to find its directory.
#[derive(Debug, Default)]
pub struct ResponseCache {
    data: DashMap<String, HashMap<String, ContainerAllocateResponse>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table from the kubelet checkpoint. Only vcore entries
    /// carry a response payload.
    pub fn load_from_kubelet_checkpoint(&self, device_plugin_path: &Path) -> anyhow::Result<()> {
        let entries = kubelet_checkpoint::read(device_plugin_path)?;
        for entry in entries {
            if entry.resource_name != VCORE_RESOURCE {
                continue;
            }
            if entry.alloc_resp.is_empty() {
                debug!(pod = %entry.pod_uid, container = %entry.container_name, "checkpoint entry has no response payload");
                continue;
            }
            match ContainerAllocateResponse::decode(entry.alloc_resp.as_slice()) {
                Ok(resp) => self.insert(&entry.pod_uid, &entry.container_name, resp),
                Err(e) => warn!(
                    pod = %entry.pod_uid,
                    container = %entry.container_name,
                    "undecodable allocate response in kubelet checkpoint: {e}"
                ),
            }
        }
        Ok(())
    }

    pub fn insert(&self, pod_uid: &str, container_name: &str, resp: ContainerAllocateResponse) {
        debug!(pod = pod_uid, container = container_name, "insert allocate response");
        self.data
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), resp);
    }

    pub fn get(&self, pod_uid: &str, container_name: &str) -> Option<ContainerAllocateResponse> {
        self.data
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name).cloned())
    }

    pub fn delete_pod(&self, pod_uid: &str) {
        self.data.remove(pod_uid);
    }

    pub fn delete(&self, pod_uid: &str, container_name: &str) {
        let mut drop_pod = false;
        if let Some(mut containers) = self.data.get_mut(pod_uid) {
            containers.remove(container_name);
            drop_pod = containers.is_empty();
        }
        if drop_pod {
            self.data.remove(pod_uid);
        }
    }

    /// Independent snapshot of the whole table.
    pub fn list_all(&self) -> HashMap<String, HashMap<String, ContainerAllocateResponse>> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Host directory that was mounted at the in-container controller path,
/// i.e. the per-pod directory under the virtual-manager path.
pub fn controller_mount_path(resp: &ContainerAllocateResponse) -> Option<String> {
    resp.mounts
        .iter()
        .find(|m| m.container_path == VCUDA_MOUNTPOINT)
        .map(|m| m.host_path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_plugin::api::Mount;

    fn resp_with_mount(host_path: &str) -> ContainerAllocateResponse {
        ContainerAllocateResponse {
            mounts: vec![Mount {
                container_path: VCUDA_MOUNTPOINT.to_string(),
                host_path: host_path.to_string(),
                read_only: true,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn insert_get_delete() {
        let cache = ResponseCache::new();
        cache.insert("u1", "main", resp_with_mount("/x/u1"));
        cache.insert("u1", "side", resp_with_mount("/x/u1"));

        assert!(cache.get("u1", "main").is_some());
        cache.delete("u1", "main");
        assert!(cache.get("u1", "main").is_none());
        assert!(cache.get("u1", "side").is_some());

        // removing the last container drops the pod entry
        cache.delete("u1", "side");
        assert!(cache.list_all().is_empty());
    }

    #[test]
    fn list_all_is_a_snapshot() {
        let cache = ResponseCache::new();
        cache.insert("u1", "main", resp_with_mount("/x/u1"));

        let snapshot = cache.list_all();
        cache.delete_pod("u1");
        assert_eq!(snapshot.len(), 1);
        assert!(cache.list_all().is_empty());
    }

    #[test]
    fn controller_mount_lookup() {
        let resp = resp_with_mount("/var/lib/vm/u1");
        assert_eq!(controller_mount_path(&resp).as_deref(), Some("/var/lib/vm/u1"));
        assert_eq!(controller_mount_path(&ContainerAllocateResponse::default()), None);
    }

    #[test]
    fn rebuilds_from_the_kubelet_checkpoint() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        let dir = tempfile::tempdir().unwrap();

        let mut payload = Vec::new();
        resp_with_mount("/var/lib/vm/u1")
            .encode(&mut payload)
            .unwrap();

        let checkpoint = serde_json::json!({
            "Data": {
                "PodDeviceEntries": [
                    {
                        "PodUID": "u1",
                        "ContainerName": "main",
                        "ResourceName": VCORE_RESOURCE,
                        "DeviceIDs": [format!("{VCORE_RESOURCE}-0")],
                        "AllocResp": BASE64.encode(&payload)
                    },
                    {
                        "PodUID": "u1",
                        "ContainerName": "main",
                        "ResourceName": "vgpu.io/vmemory",
                        "DeviceIDs": ["vgpu.io/vmemory-268435456-0"],
                        "AllocResp": ""
                    }
                ],
                "RegisteredDevices": {}
            }
        });
        std::fs::write(
            dir.path().join(crate::types::KUBELET_CHECKPOINT),
            serde_json::to_vec(&checkpoint).unwrap(),
        )
        .unwrap();

        let cache = ResponseCache::new();
        cache.load_from_kubelet_checkpoint(dir.path()).unwrap();

        // only the vcore entry carries a payload
        let restored = cache.get("u1", "main").unwrap();
        assert_eq!(controller_mount_path(&restored).as_deref(), Some("/var/lib/vm/u1"));
        assert_eq!(cache.list_all().len(), 1);
    }
}
