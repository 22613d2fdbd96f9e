//! Daemon configuration: CLI surface and the resolved runtime config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use serde::Deserialize;

use crate::runtime::CgroupDriver;

#[derive(Parser)]
#[command(name = "vgpu-manager", about = "GPU slicing agent for Kubernetes nodes", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node agent
    Daemon(Box<DaemonArgs>),
    /// Print the GPU topology tree and exit
    ShowTopology(ShowTopologyArgs),
}

#[derive(Args, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "VGPU_NODE_NAME",
        help = "Node name used to scope pod listing and watching"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to in-cluster config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device-plugin directory holding kubelet.sock and its checkpoint"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        default_value = "/etc/vgpu-manager/vm",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the per-pod controller directories"
    )]
    pub virtual_manager_path: PathBuf,

    #[arg(
        long,
        default_value = "/etc/vgpu-manager/checkpoint",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for the allocator's own checkpoint file"
    )]
    pub checkpoint_path: PathBuf,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Allow sub-card (shared) allocations"
    )]
    pub enable_share: bool,

    #[arg(
        long,
        default_value = "300",
        help = "Seconds between allocation reconciliation passes"
    )]
    pub check_period_secs: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds between device usage sampling passes"
    )]
    pub sample_period_secs: u64,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds to wait for collaborator replies (controller setup, status patches)"
    )]
    pub request_timeout_secs: u64,

    #[arg(
        long,
        default_value = "/sys/fs/cgroup/memory",
        value_hint = clap::ValueHint::DirPath,
        help = "Cgroup hierarchy mount point used for pid listing"
    )]
    pub cgroup_base: PathBuf,

    #[arg(long, default_value = "cgroupfs", help = "Cgroup driver: cgroupfs or systemd")]
    pub cgroup_driver: CgroupDriver,

    #[arg(
        long,
        default_value = "/etc/vgpu-manager/vdriver/nvidia",
        value_hint = clap::ValueHint::DirPath,
        help = "Host library mirror mounted into shared-mode containers"
    )]
    pub driver_library_path: PathBuf,

    #[arg(
        long,
        default_value = "/etc/vgpu-manager/vdriver/origin",
        value_hint = clap::ValueHint::DirPath,
        help = "Unmodified host library mirror mounted into exclusive containers"
    )]
    pub driver_origin_library_path: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Optional JSON file with extra device paths to pass through"
    )]
    pub extra_config: Option<PathBuf>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Topology matrix file used when the NVIDIA library is unavailable"
    )]
    pub device_topology_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = crate::types::MANAGER_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Unix socket for the local inspection endpoint"
    )]
    pub manager_socket: PathBuf,
}

#[derive(Args, Clone)]
pub struct ShowTopologyArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Topology matrix file; uses the NVIDIA library when absent"
    )]
    pub device_topology_file: Option<PathBuf>,
}

/// Extra devices passed to every allocated container, keyed by profile
/// name ("default" is the only one consulted today).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtraConfig {
    #[serde(default)]
    pub devices: Vec<String>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub kubeconfig: Option<PathBuf>,
    pub device_plugin_path: PathBuf,
    pub virtual_manager_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub enable_share: bool,
    pub check_period: Duration,
    pub sample_period: Duration,
    pub request_timeout: Duration,
    pub cgroup_base: PathBuf,
    pub cgroup_driver: CgroupDriver,
    pub driver_library_path: PathBuf,
    pub driver_origin_library_path: PathBuf,
    pub extra_config: HashMap<String, ExtraConfig>,
    pub device_topology_file: Option<PathBuf>,
    pub manager_socket: PathBuf,
}

impl Config {
    pub fn from_daemon_args(args: DaemonArgs) -> anyhow::Result<Self> {
        let node_name = match args.node_name {
            Some(name) if !name.is_empty() => name,
            _ => hostname()?,
        };

        let extra_config = match &args.extra_config {
            Some(path) => {
                let data = std::fs::read(path)
                    .with_context(|| format!("reading extra config at {}", path.display()))?;
                serde_json::from_slice(&data)
                    .with_context(|| format!("parsing extra config at {}", path.display()))?
            }
            None => HashMap::new(),
        };

        Ok(Self {
            node_name,
            kubeconfig: args.kubeconfig,
            device_plugin_path: args.device_plugin_path,
            virtual_manager_path: args.virtual_manager_path,
            checkpoint_path: args.checkpoint_path,
            enable_share: args.enable_share,
            check_period: Duration::from_secs(args.check_period_secs),
            sample_period: Duration::from_secs(args.sample_period_secs),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            cgroup_base: args.cgroup_base,
            cgroup_driver: args.cgroup_driver,
            driver_library_path: args.driver_library_path,
            driver_origin_library_path: args.driver_origin_library_path,
            extra_config,
            device_topology_file: args.device_topology_file,
            manager_socket: args.manager_socket,
        })
    }

    /// Extra device paths for the "default" profile.
    pub fn default_extra_devices(&self) -> &[String] {
        self.extra_config
            .get("default")
            .map(|c| c.devices.as_slice())
            .unwrap_or(&[])
    }

    #[cfg(test)]
    pub(crate) fn for_test(base: &std::path::Path) -> Self {
        Self {
            node_name: "test-node".to_string(),
            kubeconfig: None,
            device_plugin_path: base.join("device-plugins"),
            virtual_manager_path: base.join("vm"),
            checkpoint_path: base.join("checkpoint"),
            enable_share: true,
            check_period: Duration::from_secs(300),
            sample_period: Duration::from_secs(30),
            request_timeout: Duration::from_secs(1),
            cgroup_base: base.join("cgroup"),
            cgroup_driver: CgroupDriver::Cgroupfs,
            driver_library_path: base.join("vdriver/nvidia"),
            driver_origin_library_path: base.join("vdriver/origin"),
            extra_config: HashMap::new(),
            device_topology_file: None,
            manager_socket: base.join("manager.sock"),
        }
    }
}

fn hostname() -> anyhow::Result<String> {
    let name = hostname_os()?;
    Ok(name)
}

fn hostname_os() -> anyhow::Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        anyhow::bail!("gethostname failed: {}", std::io::Error::last_os_error());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
