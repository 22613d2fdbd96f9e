//! Virtual-device controller writer.
//!
//! Each allocated pod gets a directory under the virtual-manager path,
//! mounted into its containers at `/etc/vcuda`. A registration server
//! listens on `vcuda.sock` inside that directory; when the in-container
//! client registers, the per-container `pids.config` and `vcuda.config`
//! files are written next to it.

pub mod api {
    tonic::include_proto!("vcuda");
}

pub mod config_file;

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::k8s::pod_info;
use crate::k8s::PodWatcher;
use crate::response;
use crate::response::ResponseCache;
use crate::runtime;
use crate::runtime::CgroupReader;
use crate::topology::HUNDRED_CORE;
use crate::types::MAX_SOCKET_PATH_LEN;
use crate::types::MEMORY_BLOCK_SIZE;
use crate::types::VCORE_LIMIT_ANNOTATION;
use crate::types::VCORE_RESOURCE;
use crate::types::VCUDA_MOUNTPOINT;
use crate::types::VDEVICE_SOCKET;
use crate::types::VMEMORY_RESOURCE;
use crate::types::VcudaRequest;
use crate::util;

use self::api::vcuda_service_server::VcudaService;
use self::api::vcuda_service_server::VcudaServiceServer;
use self::api::VDeviceRequest;
use self::api::VDeviceResponse;
use self::config_file::VcudaConfig;
use self::config_file::CONTROLLER_CONFIG_NAME;
use self::config_file::PIDS_CONFIG_NAME;

/// Manages the per-pod registration servers and writes the controller
/// files.
pub struct VirtualManager {
    cfg: Arc<Config>,
    watcher: Arc<PodWatcher>,
    responses: Arc<ResponseCache>,
    cgroup: CgroupReader,
    driver_version: (i32, i32),
    /// minor id -> pci bus id, snapshotted from the tree at startup
    bus_ids: HashMap<u32, String>,
    servers: Mutex<HashMap<PathBuf, CancellationToken>>,
}

impl VirtualManager {
    pub fn new(
        cfg: Arc<Config>,
        watcher: Arc<PodWatcher>,
        responses: Arc<ResponseCache>,
        driver_version: (i32, i32),
        bus_ids: HashMap<u32, String>,
    ) -> Arc<Self> {
        let cgroup = CgroupReader::new(cfg.cgroup_base.clone(), cfg.cgroup_driver);
        Arc::new(Self {
            cfg,
            watcher,
            responses,
            cgroup,
            driver_version,
            bus_ids,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Recover servers for already-allocated pods, then serve allocation
    /// events and run the two garbage collectors until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<VcudaRequest>,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<()> {
        create_dir_world_writable(&self.cfg.virtual_manager_path)?;

        self.recover_servers();

        let gc = self.clone();
        let gc_token = cancellation_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = gc_token.cancelled() => return,
                    _ = interval.tick() => {
                        gc.close_orphaned_servers();
                        gc.collect_orphaned_directories();
                    }
                }
            }
        });

        info!("virtual manager is running");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    self.stop_all_servers();
                    return Ok(());
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        self.stop_all_servers();
                        return Ok(());
                    };
                    debug!(pod = %request.pod_uid, "controller directory requested");
                    let result = self.setup_pod_dir(&request.pod_uid);
                    let _ = request.done.send(result);
                }
            }
        }
    }

    /// Create the pod directory (if needed) and start its registration
    /// server.
    fn setup_pod_dir(self: &Arc<Self>, pod_uid: &str) -> anyhow::Result<()> {
        let dir = self.cfg.virtual_manager_path.join(pod_uid);
        create_dir_world_writable(&dir)?;
        self.start_server(&dir)
    }

    /// On startup, bring back a server for every cached response whose
    /// controller directory still exists.
    fn recover_servers(self: &Arc<Self>) {
        let active = self.watcher.active_pods();
        for (uid, containers) in self.responses.list_all() {
            if !active.contains_key(&uid) {
                continue;
            }
            for (name, resp) in containers {
                let Some(dir) = response::controller_mount_path(&resp) else {
                    error!(pod = %uid, container = %name, "cached response has no controller mount");
                    continue;
                };
                let dir = PathBuf::from(dir);
                if !dir.exists() {
                    debug!(dir = %dir.display(), "skipping vanished controller directory");
                    continue;
                }
                match self.start_server(&dir) {
                    Ok(()) => info!(dir = %dir.display(), "recovered registration server"),
                    Err(e) => error!(dir = %dir.display(), "failed to recover registration server: {e}"),
                }
            }
        }
    }

    /// Spawn the per-pod registration server on `<dir>/vcuda.sock`.
    fn start_server(self: &Arc<Self>, dir: &Path) -> anyhow::Result<()> {
        let socket_path = dir.join(VDEVICE_SOCKET);
        if socket_path.as_os_str().len() >= MAX_SOCKET_PATH_LEN {
            bail!(
                "socket path too long for sun_path: {}",
                socket_path.display()
            );
        }

        let mut servers = self.servers.lock().expect("servers lock");
        if servers.contains_key(dir) {
            return Ok(());
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o777))?;

        let token = CancellationToken::new();
        servers.insert(dir.to_path_buf(), token.clone());
        drop(servers);

        let service = RegistrationService {
            manager: self.clone(),
        };
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(VcudaServiceServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    token.cancelled_owned(),
                )
                .await;
            if let Err(e) = result {
                warn!("registration server exited: {e}");
            }
        });

        Ok(())
    }

    /// Close servers whose directory disappeared (the pod is gone and the
    /// directory collector or an operator removed it).
    fn close_orphaned_servers(&self) {
        let mut servers = self.servers.lock().expect("servers lock");
        servers.retain(|dir, token| {
            if dir.exists() {
                return true;
            }
            info!(dir = %dir.display(), "closing orphaned registration server");
            token.cancel();
            false
        });
    }

    /// Remove controller directories of pods no longer active.
    fn collect_orphaned_directories(&self) {
        let active = self.watcher.active_pods();
        let mut doomed = Vec::new();

        for (uid, containers) in self.responses.list_all() {
            if active.contains_key(&uid) {
                continue;
            }
            for (name, resp) in containers {
                if let Some(dir) = response::controller_mount_path(&resp) {
                    warn!(pod = %uid, container = %name, "found orphaned controller directory");
                    doomed.push(PathBuf::from(dir));
                }
            }
        }

        for dir in doomed {
            info!(dir = %dir.display(), "removing controller directory");
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), "failed to remove controller directory: {e}");
                }
            }
        }
    }

    fn stop_all_servers(&self) {
        let mut servers = self.servers.lock().expect("servers lock");
        for (_, token) in servers.drain() {
            token.cancel();
        }
    }

    /// Registration with an explicit container id: resolve the name from
    /// the pod status, then write the files under a directory named by
    /// the id.
    async fn register_by_id(&self, pod_uid: &str, container_id: &str) -> anyhow::Result<()> {
        info!(pod = pod_uid, container_id, "registration by container id");

        let pod = self.active_pod(pod_uid)?;
        let Some(container_name) = runtime::container_name_by_id(&pod, container_id) else {
            bail!("container {container_id} not found in pod {pod_uid} status");
        };

        let base_dir = self.controller_dir(pod_uid, &container_name)?;
        let target = base_dir.join(container_id);
        create_dir_world_writable(&target)?;

        self.write_pids_file(&pod, container_id, &target.join(PIDS_CONFIG_NAME))?;
        self.write_config_file(&pod, &container_name, &target.join(CONTROLLER_CONFIG_NAME))?;
        Ok(())
    }

    /// Registration with only the container name: wait for the runtime id
    /// to appear in the pod status, then write under a directory named by
    /// the container name.
    async fn register_by_name(&self, pod_uid: &str, container_name: &str) -> anyhow::Result<()> {
        info!(pod = pod_uid, container = container_name, "registration by container name");

        let base_dir = self.controller_dir(pod_uid, container_name)?;
        let target = base_dir.join(container_name);
        create_dir_world_writable(&target)?;

        // the kubelet may not have published the container id yet
        let mut container_id = None;
        for _ in 0..60 {
            let pod = self.active_pod(pod_uid)?;
            if let Some(id) = runtime::container_id_by_name(&pod, container_name) {
                if !id.is_empty() {
                    container_id = Some(id);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let Some(container_id) = container_id else {
            bail!("container {container_name} of pod {pod_uid} never reported a runtime id");
        };

        let pod = self.active_pod(pod_uid)?;
        self.write_pids_file(&pod, &container_id, &target.join(PIDS_CONFIG_NAME))?;
        self.write_config_file(&pod, container_name, &target.join(CONTROLLER_CONFIG_NAME))?;
        Ok(())
    }

    fn active_pod(&self, pod_uid: &str) -> anyhow::Result<Pod> {
        self.watcher
            .active_pods()
            .remove(pod_uid)
            .with_context(|| format!("can't locate active pod {pod_uid}"))
    }

    /// The pod's controller directory, taken from the cached response so
    /// restarts agree with what was actually mounted.
    fn controller_dir(&self, pod_uid: &str, container_name: &str) -> anyhow::Result<PathBuf> {
        let Some(resp) = self.responses.get(pod_uid, container_name) else {
            bail!("no cached allocate response for {pod_uid}/{container_name}");
        };
        let Some(dir) = response::controller_mount_path(&resp) else {
            bail!("allocate response for {pod_uid}/{container_name} has no {VCUDA_MOUNTPOINT} mount");
        };
        Ok(PathBuf::from(dir))
    }

    fn write_pids_file(
        &self,
        pod: &Pod,
        container_id: &str,
        path: &Path,
    ) -> anyhow::Result<()> {
        let parent = runtime::pod_cgroup_parent(pod, self.cfg.cgroup_driver);
        let pids = self.cgroup.pids(&parent, container_id)?;
        if pids.is_empty() {
            bail!("no pids in cgroup of container {container_id}");
        }
        debug!(file = %path.display(), count = pids.len(), "writing pid file");
        config_file::write_pids(path, &pids)?;
        Ok(())
    }

    fn write_config_file(
        &self,
        pod: &Pod,
        container_name: &str,
        path: &Path,
    ) -> anyhow::Result<()> {
        if path.exists() {
            return Ok(());
        }

        let pod_uid = pod_info::pod_uid(pod);

        // the optional soft limit turns enforcement from a hard cap into
        // an upper bound the shim applies
        let mut hard_limit = true;
        let mut limit = 0i32;
        if let Some(value) = pod_info::annotation(pod, VCORE_LIMIT_ANNOTATION) {
            let parsed: i32 = value
                .parse()
                .with_context(|| format!("bad {VCORE_LIMIT_ANNOTATION} annotation {value:?}"))?;
            hard_limit = false;
            limit = parsed.min(HUNDRED_CORE as i32);
        }

        let spec = pod.spec.as_ref().context("pod has no spec")?;
        let container = spec
            .containers
            .iter()
            .find(|c| c.name == container_name || container_name.starts_with(&c.name))
            .with_context(|| format!("can't locate container {container_name} in pod {pod_uid}"))?;

        let cores = pod_info::container_resource(container, VCORE_RESOURCE) as i32;
        let memory = pod_info::container_resource(container, VMEMORY_RESOURCE) * MEMORY_BLOCK_SIZE;

        let config = VcudaConfig {
            pod_uid: pod_uid.clone(),
            container_name: container_name.to_string(),
            bus_id: self.bus_id_for(&pod_uid, &container.name),
            gpu_memory: memory,
            utilization: cores,
            limit,
            hard_limit,
            driver_version: self.driver_version,
            enable: cores < HUNDRED_CORE as i32,
        };

        debug!(file = %path.display(), "writing controller config");
        config.write_to(path)?;
        Ok(())
    }

    /// Bus id of the first device bound to the container, for the shim's
    /// bookkeeping.
    fn bus_id_for(&self, pod_uid: &str, container_name: &str) -> String {
        let Some(resp) = self.responses.get(pod_uid, container_name) else {
            return String::new();
        };
        resp.devices
            .iter()
            .filter_map(|d| util::gpu_minor_id(&d.host_path))
            .find_map(|minor| self.bus_ids.get(&minor).cloned())
            .unwrap_or_default()
    }
}

struct RegistrationService {
    manager: Arc<VirtualManager>,
}

#[tonic::async_trait]
impl VcudaService for RegistrationService {
    async fn register_v_device(
        &self,
        request: Request<VDeviceRequest>,
    ) -> Result<Response<VDeviceResponse>, Status> {
        let req = request.into_inner();

        let result = if !req.container_name.is_empty() {
            self.manager
                .register_by_name(&req.pod_uid, &req.container_name)
                .await
        } else if !req.container_id.is_empty() {
            self.manager
                .register_by_id(&req.pod_uid, &req.container_id)
                .await
        } else {
            return Err(Status::invalid_argument(
                "one of container_name or container_id is required",
            ));
        };

        match result {
            Ok(()) => Ok(Response::new(VDeviceResponse {})),
            Err(e) => {
                error!(pod = %req.pod_uid, "registration failed: {e:#}");
                Err(Status::internal(e.to_string()))
            }
        }
    }
}

/// Create a directory (and parents) readable and writable by anyone; the
/// files below are consumed from inside unprivileged containers.
pub fn create_dir_world_writable(path: &Path) -> std::io::Result<()> {
    let old_umask = unsafe { libc::umask(0) };
    let result = std::fs::create_dir_all(path)
        .and_then(|()| std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)));
    unsafe { libc::umask(old_umask) };
    result
}
