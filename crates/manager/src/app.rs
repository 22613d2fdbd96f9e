//! Daemon wiring: build every component, recover state, start the
//! long-running tasks and wait for shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::allocator::Allocator;
use crate::config::Config;
use crate::device_plugin::kubelet;
use crate::device_plugin::ResourceRole;
use crate::device_plugin::ResourceServer;
use crate::display::DisplayService;
use crate::driver::Driver;
use crate::driver::DummyDriver;
use crate::driver::NvidiaDriver;
use crate::k8s::init_kube_client;
use crate::k8s::PodWatcher;
use crate::response::ResponseCache;
use crate::topology::GpuTree;
use crate::vdevice::VirtualManager;

pub struct App {
    cfg: Arc<Config>,
    allocator: Arc<Allocator>,
    watcher: Arc<PodWatcher>,
    virtual_manager: Arc<VirtualManager>,
    vcuda_rx: Option<mpsc::Receiver<crate::types::VcudaRequest>>,
    cancellation_token: CancellationToken,
}

/// Pick the device backend: the NVIDIA library when present, otherwise
/// the configured topology file.
pub fn init_driver(cfg: &Config) -> anyhow::Result<Driver> {
    match NvidiaDriver::init() {
        Ok(driver) => return Ok(Driver::Nvidia(driver)),
        Err(e) => warn!("nvidia library unavailable: {e}"),
    }

    let Some(path) = &cfg.device_topology_file else {
        anyhow::bail!("nvidia library unavailable and no --device-topology-file configured");
    };
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("reading topology file {}", path.display()))?;
    info!(file = %path.display(), "using text topology backend");
    // a memory figure is still needed for capacity; 1 GiB per synthetic
    // card keeps the dummy backend usable in tests and dry runs
    Ok(Driver::Dummy(DummyDriver::from_matrix(&input, 1 << 30)?))
}

impl App {
    pub async fn build(cfg: Config) -> anyhow::Result<Self> {
        let cfg = Arc::new(cfg);
        let cancellation_token = CancellationToken::new();

        let client = init_kube_client(cfg.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        let driver = Arc::new(init_driver(&cfg)?);
        let snapshot = driver.snapshot()?;
        let tree = GpuTree::from_snapshot(&snapshot)?;
        info!(devices = tree.total(), "gpu topology initialized");

        let watcher = Arc::new(PodWatcher::new(client.clone(), cfg.node_name.clone()));

        let responses = Arc::new(ResponseCache::new());
        if let Err(e) = responses.load_from_kubelet_checkpoint(&cfg.device_plugin_path) {
            // first boot on a node has no checkpoint yet
            warn!("could not load kubelet checkpoint: {e:#}");
        }

        let (vcuda_tx, vcuda_rx) = mpsc::channel(32);
        let allocator = Allocator::new(
            cfg.clone(),
            client,
            watcher.clone(),
            responses.clone(),
            driver.clone(),
            tree,
            vcuda_tx,
        )?;

        let virtual_manager = VirtualManager::new(
            cfg.clone(),
            watcher.clone(),
            responses,
            driver.version(),
            allocator.bus_ids().await,
        );

        Ok(Self {
            cfg,
            allocator,
            watcher,
            virtual_manager,
            vcuda_rx: Some(vcuda_rx),
            cancellation_token,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let token = self.cancellation_token.clone();

        // pod watcher first; recovery needs a synced view of the node
        let watcher = self.watcher.clone();
        let watcher_token = token.clone();
        tokio::spawn(async move { watcher.run(watcher_token).await });
        self.watcher.wait_until_ready().await;
        info!("pod watcher synced");

        tokio::spawn(self.allocator.clone().run_action_worker(token.clone()));

        self.allocator.recover_in_used().await;

        let vcuda_rx = self.vcuda_rx.take().expect("vcuda receiver");
        let vm = self.virtual_manager.clone();
        let vm_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = vm.run(vcuda_rx, vm_token).await {
                error!("virtual manager failed: {e:#}");
            }
        });

        // the two kubelet-facing resource servers
        let vcore = ResourceServer::new(
            ResourceRole::Vcore,
            &self.cfg.device_plugin_path,
            self.allocator.clone(),
        );
        let vmemory = ResourceServer::new(
            ResourceRole::Vmemory,
            &self.cfg.device_plugin_path,
            self.allocator.clone(),
        );
        vcore.start(token.clone())?;
        vmemory.start(token.clone())?;

        let mut registrations = Vec::new();
        for (server, pre_start) in [(&vcore, true), (&vmemory, false)] {
            kubelet::register(
                &self.cfg.device_plugin_path,
                &server.endpoint(),
                server.resource_name(),
                pre_start,
            )
            .await
            .with_context(|| format!("registering {}", server.resource_name()))?;
            registrations.push(kubelet::Registration {
                endpoint: server.endpoint(),
                resource_name: server.resource_name().to_string(),
                pre_start_required: pre_start,
            });
        }
        tokio::spawn(kubelet::watch_kubelet(
            self.cfg.device_plugin_path.clone(),
            registrations,
            token.clone(),
        ));

        DisplayService::start(self.allocator.clone(), &self.cfg.manager_socket, token.clone())?;

        // periodic reconciliation and device sampling
        let allocator = self.allocator.clone();
        let check_token = token.clone();
        let check_period = self.cfg.check_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = check_token.cancelled() => return,
                    _ = interval.tick() => allocator.check_allocation().await,
                }
            }
        });

        let allocator = self.allocator.clone();
        let sample_token = token.clone();
        let sample_period = self.cfg.sample_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sample_period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = sample_token.cancelled() => return,
                    _ = interval.tick() => allocator.update_tree().await,
                }
            }
        });

        info!("vgpu-manager is running");
        wait_for_shutdown().await;
        info!("shutting down");
        token.cancel();
        Ok(())
    }
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
