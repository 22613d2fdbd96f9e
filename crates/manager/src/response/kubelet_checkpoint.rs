//! Reader for the checkpoint the kubelet device-plugin manager writes.
//!
//! Three on-disk shapes exist in the wild: a NUMA-qualified one where
//! device ids are nested per NUMA node, a v2 format with a `Data`
//! envelope, and the old flat v1 layout. They are probed in that order
//! and normalized into flat entries.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

use crate::types::KUBELET_CHECKPOINT;

/// One container's worth of device assignments, flattened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDeviceEntry {
    pub pod_uid: String,
    pub container_name: String,
    pub resource_name: String,
    pub device_ids: Vec<String>,
    pub alloc_resp: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    #[serde(rename = "ContainerName")]
    container_name: String,
    #[serde(rename = "ResourceName")]
    resource_name: String,
    #[serde(rename = "DeviceIDs", default)]
    device_ids: Vec<String>,
    #[serde(rename = "AllocResp", default)]
    alloc_resp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntryNuma {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    #[serde(rename = "ContainerName")]
    container_name: String,
    #[serde(rename = "ResourceName")]
    resource_name: String,
    /// NUMA node id (as a JSON object key) -> device ids
    #[serde(rename = "DeviceIDs", default)]
    device_ids: HashMap<String, Vec<String>>,
    #[serde(rename = "AllocResp", default)]
    alloc_resp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCheckpoint<E> {
    #[serde(rename = "PodDeviceEntries", default = "Vec::new")]
    pod_device_entries: Vec<E>,
}

#[derive(Debug, Deserialize)]
struct Envelope<E> {
    #[serde(rename = "Data")]
    data: Option<RawCheckpoint<E>>,
}

fn decode_resp(alloc_resp: Option<String>) -> anyhow::Result<Vec<u8>> {
    match alloc_resp {
        Some(encoded) if !encoded.is_empty() => {
            BASE64.decode(encoded).context("alloc response is not base64")
        }
        _ => Ok(Vec::new()),
    }
}

fn normalize_flat(entries: Vec<RawEntry>) -> anyhow::Result<Vec<PodDeviceEntry>> {
    entries
        .into_iter()
        .map(|e| {
            Ok(PodDeviceEntry {
                pod_uid: e.pod_uid,
                container_name: e.container_name,
                resource_name: e.resource_name,
                device_ids: e.device_ids,
                alloc_resp: decode_resp(e.alloc_resp)?,
            })
        })
        .collect()
}

fn normalize_numa(entries: Vec<RawEntryNuma>) -> anyhow::Result<Vec<PodDeviceEntry>> {
    entries
        .into_iter()
        .map(|e| {
            // flatten the per-NUMA lists; NUMA keys sorted so the result
            // is stable across reads
            let mut keys: Vec<&String> = e.device_ids.keys().collect();
            keys.sort();
            let device_ids = keys
                .into_iter()
                .flat_map(|k| e.device_ids[k].iter().cloned())
                .collect();
            Ok(PodDeviceEntry {
                pod_uid: e.pod_uid,
                container_name: e.container_name,
                resource_name: e.resource_name,
                device_ids,
                alloc_resp: decode_resp(e.alloc_resp)?,
            })
        })
        .collect()
}

/// Parse checkpoint bytes, probing the known shapes in order.
pub fn parse(data: &[u8]) -> anyhow::Result<Vec<PodDeviceEntry>> {
    if let Ok(Envelope { data: Some(cp) }) = serde_json::from_slice::<Envelope<RawEntryNuma>>(data)
    {
        debug!("kubelet checkpoint parsed as numa-qualified format");
        return normalize_numa(cp.pod_device_entries);
    }

    if let Ok(Envelope { data: Some(cp) }) = serde_json::from_slice::<Envelope<RawEntry>>(data) {
        debug!("kubelet checkpoint parsed as v2 format");
        return normalize_flat(cp.pod_device_entries);
    }

    let cp: RawCheckpoint<RawEntry> =
        serde_json::from_slice(data).context("kubelet checkpoint matches no known format")?;
    debug!("kubelet checkpoint parsed as v1 format");
    normalize_flat(cp.pod_device_entries)
}

/// Read and parse `kubelet_internal_checkpoint` under the device-plugin
/// directory.
pub fn read(device_plugin_path: &Path) -> anyhow::Result<Vec<PodDeviceEntry>> {
    let path = device_plugin_path.join(KUBELET_CHECKPOINT);
    let data = std::fs::read(&path)
        .with_context(|| format!("reading kubelet checkpoint at {}", path.display()))?;
    parse(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_flat() {
        let data = br#"{
            "PodDeviceEntries": [
                {
                    "PodUID": "u1",
                    "ContainerName": "main",
                    "ResourceName": "vgpu.io/vcore",
                    "DeviceIDs": ["vgpu.io/vcore-0", "vgpu.io/vcore-1"],
                    "AllocResp": ""
                }
            ],
            "RegisteredDevices": {}
        }"#;
        let entries = parse(data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pod_uid, "u1");
        assert_eq!(entries[0].device_ids.len(), 2);
        assert!(entries[0].alloc_resp.is_empty());
    }

    #[test]
    fn parses_v2_envelope() {
        let data = br#"{
            "Data": {
                "PodDeviceEntries": [
                    {
                        "PodUID": "u2",
                        "ContainerName": "main",
                        "ResourceName": "vgpu.io/vcore",
                        "DeviceIDs": ["vgpu.io/vcore-5"],
                        "AllocResp": "AQID"
                    }
                ],
                "RegisteredDevices": {}
            },
            "Checksum": 12345
        }"#;
        let entries = parse(data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pod_uid, "u2");
        assert_eq!(entries[0].alloc_resp, vec![1, 2, 3]);
    }

    #[test]
    fn parses_numa_nested_and_flattens() {
        let data = br#"{
            "Data": {
                "PodDeviceEntries": [
                    {
                        "PodUID": "u3",
                        "ContainerName": "main",
                        "ResourceName": "vgpu.io/vcore",
                        "DeviceIDs": {
                            "0": ["vgpu.io/vcore-0"],
                            "1": ["vgpu.io/vcore-100", "vgpu.io/vcore-101"]
                        },
                        "AllocResp": ""
                    }
                ],
                "RegisteredDevices": {}
            }
        }"#;
        let entries = parse(data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].device_ids,
            vec![
                "vgpu.io/vcore-0".to_string(),
                "vgpu.io/vcore-100".to_string(),
                "vgpu.io/vcore-101".to_string()
            ]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse(b"not json").is_err());
        assert!(parse(br#"{"PodDeviceEntries": "wat"}"#).is_err());
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(dir.path()).is_err());
    }
}
