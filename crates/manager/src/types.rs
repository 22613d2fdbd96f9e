//! Resource names, annotation keys and on-disk contract constants shared
//! across the manager.

use tokio::sync::oneshot;

/// Device-plugin resource name for compute slices, in hundredths of a card.
pub const VCORE_RESOURCE: &str = "vgpu.io/vcore";
/// Device-plugin resource name for memory slices, in 256 MiB blocks.
pub const VMEMORY_RESOURCE: &str = "vgpu.io/vmemory";
/// Optional soft-limit override for the in-container controller.
pub const VCORE_LIMIT_ANNOTATION: &str = "vgpu.io/vcore-limit";
/// Comma-joined `/dev/nvidiaN` list written back to the pod.
pub const VDEVICE_ANNOTATION: &str = "vgpu.io/vdevice";
/// Nanosecond timestamp the scheduler stamps on predicated pods.
pub const PREDICATE_TIME_ANNOTATION: &str = "vgpu.io/predicate-time";
/// Per-container GPU index chosen by the scheduler, suffixed with the
/// container index.
pub const PREDICATE_GPU_INDEX_PREFIX: &str = "vgpu.io/predicate-gpu-idx-";
/// Whether the node agent has bound devices for this pod.
pub const GPU_ASSIGNED_ANNOTATION: &str = "vgpu.io/gpu-assigned";

/// 256 MiB, the granularity of the vmemory resource.
pub const MEMORY_BLOCK_SIZE: u64 = 268_435_456;

/// Mount point inside the container where the per-pod controller
/// directory appears.
pub const VCUDA_MOUNTPOINT: &str = "/etc/vcuda";
/// Per-pod registration socket name under the controller directory.
pub const VDEVICE_SOCKET: &str = "vcuda.sock";
/// Kubelet registration socket name under the device-plugin path.
pub const KUBELET_SOCKET: &str = "kubelet.sock";
/// Checkpoint the kubelet itself maintains under the device-plugin path.
pub const KUBELET_CHECKPOINT: &str = "kubelet_internal_checkpoint";
/// Our own checkpoint file name.
pub const MANAGER_CHECKPOINT: &str = "vgpumanager_internal_checkpoint";
/// Local inspection endpoint.
pub const MANAGER_SOCKET: &str = "/var/run/vgpu-manager.sock";

pub const NVIDIA_CTL_DEVICE: &str = "/dev/nvidiactl";
pub const NVIDIA_UVM_DEVICE: &str = "/dev/nvidia-uvm";
pub const NVIDIA_DEVICE_PREFIX: &str = "/dev/nvidia";

/// Marker the pre-start check writes into rejection messages; the
/// reconciliation loop keys off it when deciding to delete a pod.
pub const PRE_START_CHECK_ERR_MSG: &str = "PreStartContainer check failed";
pub const PRE_START_CHECK_ERR_TYPE: &str = "PreStartContainerCheckErr";
pub const UNEXPECTED_ADMISSION_ERR_TYPE: &str = "UnexpectedAdmissionError";

/// Unix socket paths are copied into `sockaddr_un.sun_path`.
pub const MAX_SOCKET_PATH_LEN: usize = 108;

/// Request from the allocator to the virtual-device writer asking for the
/// per-pod controller directory and registration server.
#[derive(Debug)]
pub struct VcudaRequest {
    pub pod_uid: String,
    pub done: oneshot::Sender<anyhow::Result<()>>,
}
