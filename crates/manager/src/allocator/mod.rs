//! The allocation state machine.
//!
//! One exclusive lock guards the tree, the durable pod cache and the
//! unfinished-pod pointer. Every externally visible operation (allocate,
//! pre-start, recycle, recovery) mutates that state atomically and
//! persists the cache through the checkpoint store before returning.

pub mod cache;
pub mod checkpoint;
pub mod errors;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::api::DeleteParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::allocator::cache::ContainerAllocation;
use crate::allocator::cache::PodCache;
use crate::allocator::checkpoint::CheckpointError;
use crate::allocator::checkpoint::CheckpointStore;
use crate::allocator::errors::AllocatorError;
use crate::config::Config;
use crate::device_plugin::api;
use crate::device_plugin::device_spec;
use crate::device_plugin::HEALTHY;
use crate::driver::Driver;
use crate::k8s::pod_info;
use crate::k8s::PodWatcher;
use crate::placement::FragmentMode;
use crate::placement::LinkMode;
use crate::placement::Placement;
use crate::placement::ShareMode;
use crate::response::kubelet_checkpoint;
use crate::response::ResponseCache;
use crate::topology::GpuTree;
use crate::topology::NodeId;
use crate::topology::HUNDRED_CORE;
use crate::types::GPU_ASSIGNED_ANNOTATION;
use crate::types::MANAGER_CHECKPOINT;
use crate::types::MEMORY_BLOCK_SIZE;
use crate::types::NVIDIA_CTL_DEVICE;
use crate::types::NVIDIA_DEVICE_PREFIX;
use crate::types::NVIDIA_UVM_DEVICE;
use crate::types::PREDICATE_GPU_INDEX_PREFIX;
use crate::types::PRE_START_CHECK_ERR_MSG;
use crate::types::PRE_START_CHECK_ERR_TYPE;
use crate::types::VCORE_RESOURCE;
use crate::types::VCUDA_MOUNTPOINT;
use crate::types::VDEVICE_ANNOTATION;
use crate::types::VMEMORY_RESOURCE;
use crate::types::VcudaRequest;
use crate::util;

const ACTION_RETRY_LIMIT: u32 = 12;

/// State guarded by the allocator lock.
pub struct AllocatorState {
    pub tree: GpuTree,
    pub allocated: PodCache,
    pub unfinished_pod: Option<Pod>,
}

/// Deferred cluster-side effect of an allocation decision.
#[derive(Debug)]
enum ActionKind {
    /// patch the ready annotations with gpu-assigned = true
    Success,
    /// patch the ready annotations with gpu-assigned = false; the
    /// scheduler will pick indices later
    PredicateMissing,
    /// roll the binding back and fail the pod
    Fail { message: String, reason: String },
}

#[derive(Debug)]
struct AllocationAction {
    pod: Pod,
    kind: ActionKind,
}

/// Errors inside the action worker, split by whether the action should be
/// retried.
enum ActionError {
    Retryable(String),
    Fatal(String),
}

pub struct Allocator {
    cfg: Arc<Config>,
    client: Client,
    watcher: Arc<PodWatcher>,
    responses: Arc<ResponseCache>,
    checkpoint: CheckpointStore,
    driver: Arc<Driver>,
    state: Mutex<AllocatorState>,
    actions_tx: mpsc::UnboundedSender<AllocationAction>,
    actions_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<AllocationAction>>>,
    vcuda_tx: mpsc::Sender<VcudaRequest>,
}

impl Allocator {
    pub fn new(
        cfg: Arc<Config>,
        client: Client,
        watcher: Arc<PodWatcher>,
        responses: Arc<ResponseCache>,
        driver: Arc<Driver>,
        tree: GpuTree,
        vcuda_tx: mpsc::Sender<VcudaRequest>,
    ) -> Result<Arc<Self>, AllocatorError> {
        let checkpoint = CheckpointStore::new(&cfg.checkpoint_path, MANAGER_CHECKPOINT)?;
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            cfg,
            client,
            watcher,
            responses,
            checkpoint,
            driver,
            state: Mutex::new(AllocatorState {
                tree,
                allocated: PodCache::new(),
                unfinished_pod: None,
            }),
            actions_tx,
            actions_rx: std::sync::Mutex::new(Some(actions_rx)),
            vcuda_tx,
        }))
    }

    /// Synthetic device list advertised to the kubelet: one id per vcore
    /// and one per memory block, always healthy.
    pub async fn capacity(&self) -> Vec<api::Device> {
        let state = self.state.lock().await;

        let total_memory: u64 = state
            .tree
            .leaves()
            .iter()
            .map(|&id| state.tree.node(id).meta.total_memory)
            .sum();
        let total_cores = state.tree.total() * HUNDRED_CORE as usize;

        let mut devices = Vec::with_capacity(total_cores);
        for i in 0..total_cores {
            devices.push(api::Device {
                id: format!("{VCORE_RESOURCE}-{i}"),
                health: HEALTHY.to_string(),
                topology: None,
            });
        }
        for i in 0..total_memory / MEMORY_BLOCK_SIZE {
            devices.push(api::Device {
                id: format!("{VMEMORY_RESOURCE}-{MEMORY_BLOCK_SIZE}-{i}"),
                health: HEALTHY.to_string(),
                topology: None,
            });
        }
        devices
    }

    /// Handle one container allocate call from the kubelet.
    pub async fn allocate(
        &self,
        device_ids: Vec<String>,
    ) -> Result<api::ContainerAllocateResponse, AllocatorError> {
        if device_ids.is_empty() {
            return Err(AllocatorError::InvalidRequest(
                "empty container request".to_string(),
            ));
        }
        let req_count = device_ids.len() as u64;
        debug!(devices = ?device_ids, "allocate request");

        let mut state = self.state.lock().await;
        self.recycle(&mut state);

        let (pod, container) = self.pick_candidate(&state, req_count)?;

        let need_cores = device_ids
            .iter()
            .filter(|id| id.starts_with(VCORE_RESOURCE))
            .count() as u32;
        // the memory dimension is not device-id-bearing on this call;
        // take it from the pod spec so totals match what was declared
        let need_blocks = pod_info::container_resource(&container, VMEMORY_RESOURCE);

        if need_cores == 0 && need_blocks == 0 {
            return Err(AllocatorError::InvalidRequest("zero request".to_string()));
        }

        self.allocate_one(&mut state, &pod, &container, need_cores, need_blocks)
    }

    /// Pick the pod and container this request belongs to: either the
    /// next container of the pod we are mid-way through, or the oldest
    /// pending pod whose next GPU container matches the request size.
    fn pick_candidate(
        &self,
        state: &AllocatorState,
        req_count: u64,
    ) -> Result<(Pod, Container), AllocatorError> {
        if let Some(pod) = &state.unfinished_pod {
            let uid = pod_info::pod_uid(pod);
            let allocated = state.allocated.get(&uid).ok_or_else(|| {
                AllocatorError::AllocationMismatch(format!("failed to find pod {uid} in cache"))
            })?;

            let containers = pod
                .spec
                .as_ref()
                .map(|s| s.containers.as_slice())
                .unwrap_or(&[]);
            for container in containers {
                if allocated.contains_key(&container.name) {
                    continue;
                }
                if !pod_info::is_gpu_required_container(container) {
                    continue;
                }
                if pod_info::container_resource(container, VCORE_RESOURCE) != req_count {
                    return Err(AllocatorError::AllocationMismatch(format!(
                        "request for {req_count} vcores does not match container {} of pod {uid}",
                        container.name
                    )));
                }
                return Ok((pod.clone(), container.clone()));
            }
            return Err(AllocatorError::AllocationMismatch(format!(
                "unfinished pod {uid} has no container left to allocate"
            )));
        }

        let mut pods: Vec<Pod> = candidate_pods(self.watcher.pods_on_node());
        pod_info::order_by_predicate_time(&mut pods);

        for pod in pods {
            let uid = pod_info::pod_uid(&pod);
            let containers = pod
                .spec
                .as_ref()
                .map(|s| s.containers.as_slice())
                .unwrap_or(&[]);
            for container in containers {
                if !pod_info::is_gpu_required_container(container) {
                    continue;
                }
                if state.allocated.get_container(&uid, &container.name).is_some() {
                    debug!(pod = %uid, container = %container.name, "already allocated, skipping");
                    continue;
                }
                if pod_info::container_resource(container, VCORE_RESOURCE) == req_count {
                    info!(pod = %uid, container = %container.name, vcores = req_count, "found candidate");
                    return Ok((pod.clone(), container.clone()));
                }
                break;
            }
        }

        Err(AllocatorError::PodLookupFailed(format!(
            "no candidate pod found for a {req_count}-device request"
        )))
    }

    fn allocate_one(
        &self,
        state: &mut AllocatorState,
        pod: &Pod,
        container: &Container,
        need_cores: u32,
        need_blocks: u64,
    ) -> Result<api::ContainerAllocateResponse, AllocatorError> {
        let uid = pod_info::pod_uid(pod);
        let need_memory = need_blocks * MEMORY_BLOCK_SIZE;
        let predicate_missed = !pod_info::is_gpu_predicated_pod(pod);
        let single_node_memory = state
            .tree
            .leaves()
            .first()
            .map(|&id| state.tree.node(id).meta.total_memory)
            .unwrap_or(0);

        state.tree.update(&self.driver);

        // kubelet may replay an allocate after a restart; answer from the
        // cache without touching the tree again
        let cached = state
            .allocated
            .get_container(&uid, &container.name)
            .cloned();

        let mut share_mode = false;
        let leaves: Vec<NodeId> = match &cached {
            Some(allocation) => {
                info!(pod = %uid, container = %container.name, "container already allocated, answering from cache");
                share_mode = allocation.cores < HUNDRED_CORE;
                allocation
                    .devices
                    .iter()
                    .filter_map(|dev| state.tree.query(dev))
                    .collect()
            }
            None => {
                info!(
                    pod = %uid,
                    container = %container.name,
                    vcore = need_cores,
                    vmemory = need_memory,
                    "placing request"
                );
                debug!("tree graph:\n{}", state.tree.print_graph());

                let picked = if need_cores > HUNDRED_CORE {
                    if need_cores % HUNDRED_CORE != 0 {
                        return Err(AllocatorError::InvalidRequest(format!(
                            "requests above {HUNDRED_CORE} vcores must be whole cards"
                        )));
                    }
                    LinkMode.evaluate(&state.tree, need_cores, 0)
                } else if need_cores == HUNDRED_CORE {
                    FragmentMode.evaluate(&state.tree, need_cores, 0)
                } else {
                    if !self.cfg.enable_share {
                        return Err(AllocatorError::ShareDisabled);
                    }
                    if need_cores == 0 || need_memory == 0 {
                        return Err(AllocatorError::InvalidShareRequest);
                    }
                    share_mode = true;
                    ShareMode.evaluate(&state.tree, need_cores, need_memory)
                };

                if picked.is_empty() {
                    if share_mode && need_memory > single_node_memory {
                        return Err(AllocatorError::OversizedMemory {
                            requested: need_memory,
                            limit: single_node_memory,
                        });
                    }
                    return Err(AllocatorError::NoFreeNode);
                }

                if !predicate_missed {
                    self.check_predicate(state, pod, container, picked[0])?;
                }
                picked
            }
        };

        if leaves.is_empty() {
            return Err(AllocatorError::NoFreeNode);
        }

        let mut resp = api::ContainerAllocateResponse::default();
        let mut device_names = Vec::with_capacity(leaves.len());
        let mut uuids = Vec::with_capacity(leaves.len());
        for &leaf in &leaves {
            let node = state.tree.node(leaf);
            device_names.push(node.minor_name());
            uuids.push(node.meta.uuid.clone());
        }

        resp.annotations
            .insert(VCORE_RESOURCE.to_string(), need_cores.to_string());
        resp.annotations
            .insert(VMEMORY_RESOURCE.to_string(), need_memory.to_string());
        resp.annotations
            .insert(VDEVICE_ANNOTATION.to_string(), device_names.join(","));

        for name in &device_names {
            resp.devices.push(device_spec(name));
        }

        if cached.is_none() {
            for &leaf in &leaves {
                state.tree.mark_occupied(leaf, need_cores, need_memory);
            }
            state.allocated.insert(
                &uid,
                &container.name,
                ContainerAllocation {
                    devices: device_names.clone(),
                    cores: need_cores,
                    memory: need_memory,
                },
            );
        }

        self.refresh_unfinished(state, pod);
        self.write_checkpoint(state);

        resp.devices.push(device_spec(NVIDIA_CTL_DEVICE));
        resp.devices.push(device_spec(NVIDIA_UVM_DEVICE));
        for extra in self.cfg.default_extra_devices() {
            resp.devices.push(device_spec(extra));
        }

        let mut library_path = "/usr/local/nvidia/lib64";
        if let Some(env) = &container.env {
            // 32-bit userlands opt in via the compat32 env
            if env
                .iter()
                .any(|e| e.name == "compat32" && e.value.as_deref().unwrap_or("").eq_ignore_ascii_case("true"))
            {
                library_path = "/usr/local/nvidia/lib";
            }
        }
        resp.envs
            .insert("LD_LIBRARY_PATH".to_string(), library_path.to_string());
        resp.envs
            .insert("NVIDIA_VISIBLE_DEVICES".to_string(), uuids.join(","));

        let library_host_path = if share_mode {
            &self.cfg.driver_library_path
        } else {
            &self.cfg.driver_origin_library_path
        };
        resp.mounts.push(api::Mount {
            container_path: "/usr/local/nvidia".to_string(),
            host_path: library_host_path.display().to_string(),
            read_only: true,
        });
        resp.mounts.push(api::Mount {
            container_path: VCUDA_MOUNTPOINT.to_string(),
            host_path: self
                .cfg
                .virtual_manager_path
                .join(&uid)
                .display()
                .to_string(),
            read_only: true,
        });

        if predicate_missed {
            self.enqueue(pod.clone(), ActionKind::PredicateMissing);
        }

        self.responses.insert(&uid, &container.name, resp.clone());
        Ok(resp)
    }

    /// Compare our pick against the index the scheduler stamped on the
    /// pod.
    fn check_predicate(
        &self,
        state: &AllocatorState,
        pod: &Pod,
        container: &Container,
        first_leaf: NodeId,
    ) -> Result<(), AllocatorError> {
        let uid = pod_info::pod_uid(pod);
        let index = pod_info::container_index(pod, &container.name).ok_or_else(|| {
            AllocatorError::ContainerLookupFailed(format!(
                "container {} not in pod {uid} spec",
                container.name
            ))
        })?;

        let key = format!("{PREDICATE_GPU_INDEX_PREFIX}{index}");
        let picked = state.tree.node(first_leaf).minor_name();
        let Some(raw) = pod_info::annotation(pod, &key) else {
            return Err(AllocatorError::PredicateMismatch {
                picked,
                predicate: format!("missing annotation {key}"),
            });
        };

        // multi-card predicates are comma-joined; the first index names
        // the leading device
        let first = raw.split(',').next().unwrap_or_default().trim();
        let predicate = match first.parse::<u32>() {
            Ok(minor) => format!("{NVIDIA_DEVICE_PREFIX}{minor}"),
            Err(_) => {
                return Err(AllocatorError::PredicateMismatch {
                    picked,
                    predicate: format!("unparsable index {raw:?}"),
                })
            }
        };

        if state.tree.query(&predicate).is_none() {
            return Err(AllocatorError::PredicateMismatch {
                picked,
                predicate: format!("unknown device {predicate}"),
            });
        }
        if predicate != picked {
            return Err(AllocatorError::PredicateMismatch { picked, predicate });
        }
        Ok(())
    }

    /// Track whether this pod still has GPU containers waiting for their
    /// allocate call.
    fn refresh_unfinished(&self, state: &mut AllocatorState, pod: &Pod) {
        let uid = pod_info::pod_uid(pod);
        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or(&[]);

        let unfinished = containers.iter().any(|c| {
            pod_info::is_gpu_required_container(c)
                && state.allocated.get_container(&uid, &c.name).is_none()
        });

        state.unfinished_pod = if unfinished { Some(pod.clone()) } else { None };
    }

    /// Validate a pre-start call against the host checkpoint and our own
    /// cache, stage the controller directory, and queue the annotation
    /// patch.
    pub async fn pre_start_container(&self, device_ids: Vec<String>) -> Result<(), AllocatorError> {
        debug!(devices = ?device_ids, "pre-start container");

        let entries = kubelet_checkpoint::read(&self.cfg.device_plugin_path).map_err(|e| {
            AllocatorError::PreStartCheckFailed(format!(
                "{PRE_START_CHECK_ERR_MSG}, failed to read kubelet checkpoint: {e}"
            ))
        })?;

        // the host checkpoint is the source of truth mapping device-id
        // lists to pods; ordering is not guaranteed, match as multisets
        let vcore_entry = entries
            .iter()
            .find(|e| e.resource_name == VCORE_RESOURCE && util::same_id_set(&e.device_ids, &device_ids))
            .ok_or_else(|| {
                AllocatorError::PreStartCheckFailed(format!(
                    "{PRE_START_CHECK_ERR_MSG}, no kubelet checkpoint entry matches the request"
                ))
            })?;

        let pod_uid = vcore_entry.pod_uid.clone();
        let container_name = vcore_entry.container_name.clone();
        let vcore = vcore_entry.device_ids.len() as u32;
        let vmemory_blocks = entries
            .iter()
            .find(|e| {
                e.pod_uid == pod_uid
                    && e.container_name == container_name
                    && e.resource_name == VMEMORY_RESOURCE
            })
            .map(|e| e.device_ids.len() as u64)
            .unwrap_or(0);

        let pod = self
            .watcher
            .active_pods()
            .remove(&pod_uid)
            .ok_or_else(|| {
                AllocatorError::PodLookupFailed(format!("pod {pod_uid} is not active on this node"))
            })?;

        let state = self.state.lock().await;
        if let Err(e) = pre_start_check(
            &state,
            &pod_uid,
            &container_name,
            vcore,
            vmemory_blocks * MEMORY_BLOCK_SIZE,
        ) {
            self.enqueue(
                pod,
                ActionKind::Fail {
                    message: e.to_string(),
                    reason: PRE_START_CHECK_ERR_TYPE.to_string(),
                },
            );
            return Err(e);
        }

        // the only await permitted under the lock: ask the virtual-device
        // writer for the controller directory and wait for its reply
        let (done_tx, done_rx) = oneshot::channel();
        self.vcuda_tx
            .send(VcudaRequest {
                pod_uid: pod_uid.clone(),
                done: done_tx,
            })
            .await
            .map_err(|_| {
                AllocatorError::VcudaSetupFailed("virtual manager is not running".to_string())
            })?;

        match tokio::time::timeout(self.cfg.request_timeout, done_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                return Err(AllocatorError::VcudaSetupFailed(format!(
                    "pod {pod_uid}: {e:#}"
                )))
            }
            Ok(Err(_)) => {
                return Err(AllocatorError::VcudaSetupFailed(format!(
                    "pod {pod_uid}: reply channel closed"
                )))
            }
            Err(_) => {
                return Err(AllocatorError::VcudaSetupFailed(format!(
                    "pod {pod_uid}: controller setup timed out"
                )))
            }
        }
        drop(state);

        self.enqueue(pod, ActionKind::Success);
        Ok(())
    }

    /// Release bindings for pods that are no longer active and persist
    /// the shrunken cache.
    pub(crate) fn recycle(&self, state: &mut AllocatorState) {
        let active = self.watcher.active_pods();
        let doomed: Vec<String> = state
            .allocated
            .pods()
            .into_iter()
            .filter(|uid| !active.contains_key(uid))
            .collect();

        if doomed.is_empty() {
            return;
        }
        debug!(pods = ?doomed, "recycling bindings of vanished pods");
        self.free_gpu(state, &doomed);
        self.write_checkpoint(state);
    }

    /// Give every leaf of every container of these pods back to the tree
    /// and drop their cache entries.
    fn free_gpu(&self, state: &mut AllocatorState, pod_uids: &[String]) {
        for uid in pod_uids {
            if let Some(containers) = state.allocated.get(uid).cloned() {
                for (container_name, info) in containers {
                    info!(pod = %uid, container = %container_name, "freeing devices");
                    for device in &info.devices {
                        if let Some(leaf) = state.tree.query(device) {
                            state
                                .tree
                                .mark_free(&self.driver, leaf, info.cores, info.memory);
                        }
                    }
                    self.responses.delete(uid, &container_name);
                }
            }
            state.allocated.delete(uid);

            let unfinished_uid = state
                .unfinished_pod
                .as_ref()
                .map(pod_info::pod_uid)
                .unwrap_or_default();
            if unfinished_uid == *uid {
                debug!(pod = %uid, "unfinished pod vanished, clearing pointer");
                state.unfinished_pod = None;
            }
        }
    }

    /// Rebuild in-memory state after a restart: load the checkpoint,
    /// re-apply the bindings to the tree, drop what no longer exists and
    /// reconcile.
    pub async fn recover_in_used(&self) {
        {
            let mut state = self.state.lock().await;

            match self.checkpoint.read() {
                Ok(data) => match serde_json::from_slice::<PodCache>(&data) {
                    Ok(restored) => state.allocated = restored,
                    Err(e) => warn!("undecodable checkpoint, starting empty: {e}"),
                },
                Err(CheckpointError::NotFound) => {
                    debug!("no checkpoint found, starting empty");
                }
                Err(e) => warn!("failed to read checkpoint: {e}"),
            }

            let bindings: Vec<(String, u32, u64)> = state
                .allocated
                .pod_gpu_mapping
                .values()
                .flat_map(|containers| containers.values())
                .flat_map(|info| {
                    info.devices
                        .iter()
                        .map(|d| (d.clone(), info.cores, info.memory))
                })
                .collect();
            for (device, cores, memory) in bindings {
                if !util::is_valid_gpu_path(&device) {
                    continue;
                }
                if let Some(leaf) = state.tree.query(&device) {
                    info!(device = %device, cores, memory, "restoring binding");
                    state.tree.mark_occupied(leaf, cores, memory);
                }
            }

            self.recycle(&mut state);
            self.write_checkpoint(&mut state);
        }

        self.check_allocation().await;
    }

    /// Reconciliation pass: evict pods whose pre-start failed, re-patch
    /// running pods whose annotations drifted.
    pub async fn check_allocation(&self) {
        debug!("checking allocations of pods on this node");

        for pod in self.watcher.pods_on_node() {
            if !pod_info::is_gpu_required_pod(&pod) {
                continue;
            }
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();

            match phase.as_str() {
                "Failed" | "Pending" => {
                    if pod_info::should_delete(&pod) {
                        if let Err(e) = self.delete_pod_with_owner_ref(&pod).await {
                            warn!(pod = %pod_info::pod_uid(&pod), "eviction failed: {e}");
                        }
                    }
                }
                "Running" => {
                    let expected = {
                        let state = self.state.lock().await;
                        ready_annotations(&state, &pod, true)
                    };
                    match expected {
                        Ok(map) => {
                            if !annotations_match(&pod, &map) {
                                self.enqueue(pod, ActionKind::Success);
                            }
                        }
                        Err(e) => debug!(
                            pod = %pod_info::pod_uid(&pod),
                            "cannot compute ready annotations: {e}"
                        ),
                    }
                }
                _ => {}
            }
        }
    }

    /// Free the pod's devices, then delete it, but only when a controller
    /// owns it; naked pods are left for the operator.
    async fn delete_pod_with_owner_ref(&self, pod: &Pod) -> Result<(), AllocatorError> {
        let uid = pod_info::pod_uid(pod);
        {
            let mut state = self.state.lock().await;
            self.free_gpu(&mut state, &[uid.clone()]);
            self.write_checkpoint(&mut state);
        }

        let owners = pod.metadata.owner_references.as_deref().unwrap_or(&[]);
        if owners.is_empty() || owners.iter().any(|o| o.kind == "Pod") {
            return Ok(());
        }

        let namespace = pod_info::pod_namespace(pod);
        let name = pod_info::pod_name(pod);
        info!(pod = %uid, "deleting pod after failed pre-start check");

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let deadline = tokio::time::Instant::now() + self.cfg.request_timeout;
        loop {
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => return Ok(()),
                Err(e) if should_retry(&e) && tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(()),
                Err(e) => return Err(AllocatorError::Kubernetes(e.to_string())),
            }
        }
    }

    fn enqueue(&self, pod: Pod, kind: ActionKind) {
        if self.actions_tx.send(AllocationAction { pod, kind }).is_err() {
            error!("action worker is gone, dropping allocation action");
        }
    }

    /// Drain the post-allocation action queue until cancelled. Retryable
    /// API failures back off exponentially; everything else drops the
    /// action after logging.
    pub async fn run_action_worker(self: Arc<Self>, cancellation_token: CancellationToken) {
        let mut rx = self
            .actions_rx
            .lock()
            .expect("actions receiver lock")
            .take()
            .expect("action worker started twice");

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                action = rx.recv() => {
                    let Some(action) = action else { return };
                    self.process_with_retry(action, &cancellation_token).await;
                }
            }
        }
    }

    async fn process_with_retry(&self, action: AllocationAction, token: &CancellationToken) {
        let uid = pod_info::pod_uid(&action.pod);
        let mut backoff = Duration::from_millis(500);

        for attempt in 0..ACTION_RETRY_LIMIT {
            match self.process_action(&action).await {
                Ok(()) => return,
                Err(ActionError::Retryable(msg)) => {
                    debug!(pod = %uid, attempt, "action retrying: {msg}");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(ActionError::Fatal(msg)) => {
                    warn!(pod = %uid, "dropping allocation action: {msg}");
                    return;
                }
            }
        }
        warn!(pod = %uid, "allocation action exhausted its retries");
    }

    async fn process_action(&self, action: &AllocationAction) -> Result<(), ActionError> {
        match &action.kind {
            ActionKind::Success => self.patch_ready_annotations(&action.pod, true).await,
            ActionKind::PredicateMissing => self.patch_ready_annotations(&action.pod, false).await,
            ActionKind::Fail { message, reason } => {
                let uid = pod_info::pod_uid(&action.pod);
                {
                    let mut state = self.state.lock().await;
                    self.free_gpu(&mut state, &[uid]);
                    self.write_checkpoint(&mut state);
                }
                self.fail_pod(&action.pod, message, reason).await
            }
        }
    }

    async fn patch_ready_annotations(&self, pod: &Pod, assigned: bool) -> Result<(), ActionError> {
        let annotations = {
            let state = self.state.lock().await;
            ready_annotations(&state, pod, assigned)
                .map_err(|e| ActionError::Fatal(e.to_string()))?
        };

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod_info::pod_namespace(pod));
        let patch = json!({ "metadata": { "annotations": annotations } });
        api.patch(
            &pod_info::pod_name(pod),
            &PatchParams::default(),
            &Patch::Strategic(patch),
        )
        .await
        .map(|_| ())
        .map_err(classify_kube_error)
    }

    /// Mark the pod failed and strip our annotations so the scheduler
    /// does not treat it as assigned.
    async fn fail_pod(&self, pod: &Pod, message: &str, reason: &str) -> Result<(), ActionError> {
        let namespace = pod_info::pod_namespace(pod);
        let name = pod_info::pod_name(pod);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let mut cleared: HashMap<String, Option<String>> = HashMap::new();
        cleared.insert(GPU_ASSIGNED_ANNOTATION.to_string(), None);
        if let Some(spec) = pod.spec.as_ref() {
            for i in 0..spec.containers.len() {
                cleared.insert(format!("{PREDICATE_GPU_INDEX_PREFIX}{i}"), None);
            }
        }
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "annotations": cleared } })),
        )
        .await
        .map_err(classify_kube_error)?;

        let status = json!({
            "status": {
                "phase": "Failed",
                "reason": reason,
                "message": message,
            }
        });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(status))
            .await
            .map(|_| ())
            .map_err(classify_kube_error)
    }

    /// Persist the cache. Failures are logged, never surfaced: in-memory
    /// state stays authoritative until the next successful write.
    fn write_checkpoint(&self, state: &mut AllocatorState) {
        let data = match serde_json::to_vec(&state.allocated) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to serialize checkpoint: {e}");
                return;
            }
        };
        if let Err(e) = self.checkpoint.write(&data) {
            warn!("failed to write checkpoint: {e}");
        }
    }

    /// Rendered tree for the inspection endpoint.
    pub async fn graph(&self) -> String {
        let state = self.state.lock().await;
        state.tree.print_graph()
    }

    /// Snapshot of the durable bindings for the inspection endpoint.
    pub async fn usage(&self) -> PodCache {
        let state = self.state.lock().await;
        state.allocated.clone()
    }

    /// Bus ids per minor id, handed to the virtual-device writer.
    pub async fn bus_ids(&self) -> HashMap<u32, String> {
        let state = self.state.lock().await;
        state
            .tree
            .leaves()
            .iter()
            .map(|&id| {
                let node = state.tree.node(id);
                (node.meta.minor_id, node.meta.bus_id.clone())
            })
            .collect()
    }

    /// Refresh observed usage on the tree; runs on the sampling period.
    pub async fn update_tree(&self) {
        let mut state = self.state.lock().await;
        state.tree.update(&self.driver);
    }
}

/// Pods worth considering for a fresh allocation: pending, GPU-requiring,
/// not yet assigned, not already condemned.
pub(crate) fn candidate_pods(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            phase == "Pending"
                && pod.metadata.deletion_timestamp.is_none()
                && pod_info::is_gpu_required_pod(pod)
                && !pod_info::is_gpu_assigned_pod(pod)
                && !pod_info::should_delete(pod)
        })
        .collect()
}

/// The cache/request consistency check run before a container starts.
fn pre_start_check(
    state: &AllocatorState,
    pod_uid: &str,
    container_name: &str,
    vcore: u32,
    vmemory_bytes: u64,
) -> Result<(), AllocatorError> {
    let Some(allocation) = state.allocated.get_container(pod_uid, container_name) else {
        return Err(AllocatorError::PreStartCheckFailed(format!(
            "{PRE_START_CHECK_ERR_MSG}, pod {pod_uid} container {container_name} is not in the allocation cache"
        )));
    };

    if allocation.cores != vcore || allocation.memory != vmemory_bytes {
        return Err(AllocatorError::PreStartCheckFailed(format!(
            "{PRE_START_CHECK_ERR_MSG}, pod {pod_uid} container {container_name} mismatch: \
             request vcore {vcore} vmemory {vmemory_bytes}, cache vcore {} vmemory {}",
            allocation.cores, allocation.memory
        )));
    }

    let expected_devices = if vcore < HUNDRED_CORE {
        1
    } else {
        (vcore / HUNDRED_CORE) as usize
    };
    if allocation.devices.len() != expected_devices {
        return Err(AllocatorError::PreStartCheckFailed(format!(
            "{PRE_START_CHECK_ERR_MSG}, pod {pod_uid} container {container_name} holds {} devices, want {expected_devices}",
            allocation.devices.len()
        )));
    }
    Ok(())
}

/// Annotations a correctly bound pod must carry.
fn ready_annotations(
    state: &AllocatorState,
    pod: &Pod,
    assigned: bool,
) -> Result<HashMap<String, String>, AllocatorError> {
    let uid = pod_info::pod_uid(pod);
    let Some(allocated) = state.allocated.get(&uid) else {
        return Err(AllocatorError::PodLookupFailed(format!(
            "pod {uid} is not in the allocation cache"
        )));
    };

    let mut annotations = HashMap::new();
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[]);
    for (i, container) in containers.iter().enumerate() {
        if !pod_info::is_gpu_required_container(container) {
            continue;
        }
        let Some(allocation) = allocated.get(&container.name) else {
            return Err(AllocatorError::ContainerLookupFailed(format!(
                "container {} of pod {uid} is not in the allocation cache",
                container.name
            )));
        };
        let indices: Vec<String> = allocation
            .devices
            .iter()
            .map(|d| d.trim_start_matches(NVIDIA_DEVICE_PREFIX).to_string())
            .collect();
        annotations.insert(format!("{PREDICATE_GPU_INDEX_PREFIX}{i}"), indices.join(","));
    }
    annotations.insert(GPU_ASSIGNED_ANNOTATION.to_string(), assigned.to_string());
    Ok(annotations)
}

fn annotations_match(pod: &Pod, expected: &HashMap<String, String>) -> bool {
    expected.iter().all(|(key, value)| {
        pod_info::annotation(pod, key)
            .map(|v| v == value)
            .unwrap_or(false)
    })
}

/// Conflicts and server timeouts are worth retrying; everything else is
/// final.
fn should_retry(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 || resp.code == 504)
}

fn classify_kube_error(err: kube::Error) -> ActionError {
    if should_retry(&err) {
        ActionError::Retryable(err.to_string())
    } else {
        ActionError::Fatal(err.to_string())
    }
}

#[cfg(test)]
impl Allocator {
    pub(crate) async fn with_state<R>(&self, f: impl FnOnce(&AllocatorState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }
}
