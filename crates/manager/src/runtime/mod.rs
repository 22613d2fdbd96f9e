//! Container runtime collaborator: resolving a container id to its name
//! through the pod status, and listing the pids in a container's cgroup.

use std::path::Path;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    ContainerNotFound(String),
    #[error("cgroup read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How the kubelet lays out pod cgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriver {
    Cgroupfs,
    Systemd,
}

impl std::str::FromStr for CgroupDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cgroupfs" => Ok(CgroupDriver::Cgroupfs),
            "systemd" => Ok(CgroupDriver::Systemd),
            other => Err(format!("unknown cgroup driver {other:?}")),
        }
    }
}

/// Container runtime id prefixes as they appear in pod statuses, e.g.
/// `containerd://<id>` or `docker://<id>`.
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    container_id
        .split_once("://")
        .map(|(_, id)| id)
        .unwrap_or(container_id)
}

/// Resolve a container id to the container name recorded in the pod
/// status.
pub fn container_name_by_id(pod: &Pod, container_id: &str) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses
        .iter()
        .find(|cs| {
            cs.container_id
                .as_deref()
                .map(strip_runtime_prefix)
                .map(|id| id == container_id)
                .unwrap_or(false)
        })
        .map(|cs| cs.name.clone())
}

/// Resolve a container name to the runtime id recorded in the pod
/// status. Names may be matched by prefix, mirroring how runtimes mangle
/// them.
pub fn container_id_by_name(pod: &Pod, container_name: &str) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses
        .iter()
        .find(|cs| cs.name.starts_with(container_name))
        .and_then(|cs| cs.container_id.as_deref())
        .map(strip_runtime_prefix)
        .map(str::to_string)
}

/// Cgroup parent of a pod, derived from its QoS class.
pub fn pod_cgroup_parent(pod: &Pod, driver: CgroupDriver) -> String {
    let uid = pod.metadata.uid.as_deref().unwrap_or_default();
    let qos = pod
        .status
        .as_ref()
        .and_then(|s| s.qos_class.as_deref())
        .unwrap_or("Guaranteed");

    match driver {
        CgroupDriver::Cgroupfs => match qos {
            "Burstable" => format!("kubepods/burstable/pod{uid}"),
            "BestEffort" => format!("kubepods/besteffort/pod{uid}"),
            _ => format!("kubepods/pod{uid}"),
        },
        CgroupDriver::Systemd => {
            let uid = uid.replace('-', "_");
            match qos {
                "Burstable" => format!("kubepods-burstable-pod{uid}.slice"),
                "BestEffort" => format!("kubepods-besteffort-pod{uid}.slice"),
                _ => format!("kubepods-pod{uid}.slice"),
            }
        }
    }
}

/// Reads `cgroup.procs` files under the node's cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupReader {
    base: PathBuf,
    driver: CgroupDriver,
}

impl CgroupReader {
    pub fn new(base: impl Into<PathBuf>, driver: CgroupDriver) -> Self {
        Self {
            base: base.into(),
            driver,
        }
    }

    fn procs_file(&self, cgroup_parent: &str, container_id: &str) -> PathBuf {
        match self.driver {
            CgroupDriver::Cgroupfs => self
                .base
                .join(cgroup_parent)
                .join(container_id)
                .join("cgroup.procs"),
            CgroupDriver::Systemd => {
                // kubepods-burstable-pod<uid>.slice sits below
                // kubepods.slice/kubepods-burstable.slice
                let mut parts = cgroup_parent.splitn(3, '-');
                let base = parts.next().unwrap_or_default();
                let qos = parts.next().unwrap_or_default();
                let mut path = self.base.join(format!("{base}.slice"));
                if !qos.is_empty() && !qos.starts_with("pod") {
                    path = path.join(format!("{base}-{qos}.slice"));
                }
                path.join(cgroup_parent)
                    .join(format!("cri-containerd-{container_id}.scope"))
                    .join("cgroup.procs")
            }
        }
    }

    /// Pids currently in the container's cgroup. Unparsable lines are
    /// skipped, the kernel occasionally races the reader.
    pub fn pids(&self, cgroup_parent: &str, container_id: &str) -> Result<Vec<i32>, RuntimeError> {
        let path = self.procs_file(cgroup_parent, container_id);
        let content = read_procs(&path)?;
        let pids: Vec<i32> = content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        debug!(file = %path.display(), count = pids.len(), "read cgroup pids");
        Ok(pids)
    }
}

fn read_procs(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}
