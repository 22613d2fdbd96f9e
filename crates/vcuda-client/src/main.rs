//! Registers the calling container with the node's vgpu-manager so it
//! writes the controller files this container's shim will read.
//!
//! Pod uid and container id are recovered from `/proc/self/cgroup`; both
//! can be overridden for runtimes with exotic cgroup layouts.

pub mod api {
    tonic::include_proto!("vcuda");
}

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::info;

use api::vcuda_service_client::VcudaServiceClient;
use api::VDeviceRequest;

#[derive(Parser)]
#[command(name = "vcuda-client", about = "Register this container with vgpu-manager", version)]
struct Cli {
    /// Directory holding the registration socket mounted into the pod
    #[arg(long, default_value = "/etc/vcuda")]
    socket_dir: PathBuf,

    /// Pod uid override; parsed from /proc/self/cgroup when absent
    #[arg(long, env = "VGPU_POD_UID")]
    pod_uid: Option<String>,

    /// Container id override; parsed from /proc/self/cgroup when absent
    #[arg(long, env = "VGPU_CONTAINER_ID")]
    container_id: Option<String>,

    /// Register by container name instead of id
    #[arg(long, env = "VGPU_CONTAINER_NAME")]
    container_name: Option<String>,

    /// Attempts before giving up; the manager may still be staging the
    /// directory when the container entrypoint runs
    #[arg(long, default_value = "30")]
    retries: u32,
}

/// cgroupfs: .../kubepods/burstable/pod<uid>/<container-id>
static CGROUPFS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"kubepods[^:]*/pod([0-9a-f-]{36})/([0-9a-f]{64})").expect("cgroupfs pattern")
});

/// systemd: .../kubepods-burstable-pod<uid_with_underscores>.slice/cri-containerd-<id>.scope
static SYSTEMD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"kubepods[^:]*-pod([0-9a-f_]{36})\.slice/[a-z-]+-([0-9a-f]{64})\.scope")
        .expect("systemd pattern")
});

/// Extract `(pod_uid, container_id)` from the content of
/// `/proc/self/cgroup`.
fn parse_cgroup(content: &str) -> Option<(String, String)> {
    for line in content.lines() {
        if let Some(caps) = CGROUPFS_RE.captures(line) {
            return Some((caps[1].to_string(), caps[2].to_string()));
        }
        if let Some(caps) = SYSTEMD_RE.captures(line) {
            return Some((caps[1].replace('_', "-"), caps[2].to_string()));
        }
    }
    None
}

async fn uds_channel(socket_path: &Path) -> Result<Channel> {
    let socket_path = socket_path.to_path_buf();
    let channel = Endpoint::from_static("http://localhost")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;
    Ok(channel)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();

    let (mut pod_uid, mut container_id) = (cli.pod_uid, cli.container_id);
    if pod_uid.is_none() || (container_id.is_none() && cli.container_name.is_none()) {
        let content = std::fs::read_to_string("/proc/self/cgroup")
            .context("reading /proc/self/cgroup")?;
        let Some((uid, id)) = parse_cgroup(&content) else {
            bail!("cannot derive pod uid and container id from /proc/self/cgroup");
        };
        pod_uid.get_or_insert(uid);
        container_id.get_or_insert(id);
    }
    let pod_uid = pod_uid.expect("pod uid resolved above");

    let has_container_name = cli.container_name.is_some();
    let request = VDeviceRequest {
        pod_uid: pod_uid.clone(),
        container_name: cli.container_name.unwrap_or_default(),
        container_id: if has_container_name {
            String::new()
        } else {
            container_id.unwrap_or_default()
        },
    };

    let socket_path = cli.socket_dir.join("vcuda.sock");
    info!(pod = %pod_uid, socket = %socket_path.display(), "registering virtual device");

    let mut last_err = None;
    for attempt in 0..cli.retries {
        match try_register(&socket_path, request.clone()).await {
            Ok(()) => {
                info!("registration complete");
                return Ok(());
            }
            Err(e) => {
                info!(attempt, "registration not ready yet: {e:#}");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("registration never attempted")))
}

async fn try_register(socket_path: &Path, request: VDeviceRequest) -> Result<()> {
    let channel = uds_channel(socket_path).await?;
    let mut client = VcudaServiceClient::new(channel);
    client.register_v_device(request).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINER: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn parses_cgroupfs_layout() {
        let content = format!(
            "11:memory:/kubepods/burstable/pod8e6b5f4a-9f2c-4e3a-a8c2-2a2f7a1b9c1d/{CONTAINER}\n"
        );
        let (uid, id) = parse_cgroup(&content).unwrap();
        assert_eq!(uid, "8e6b5f4a-9f2c-4e3a-a8c2-2a2f7a1b9c1d");
        assert_eq!(id, CONTAINER);
    }

    #[test]
    fn parses_systemd_layout() {
        let content = format!(
            "0::/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod8e6b5f4a_9f2c_4e3a_a8c2_2a2f7a1b9c1d.slice/cri-containerd-{CONTAINER}.scope\n"
        );
        let (uid, id) = parse_cgroup(&content).unwrap();
        assert_eq!(uid, "8e6b5f4a-9f2c-4e3a-a8c2-2a2f7a1b9c1d");
        assert_eq!(id, CONTAINER);
    }

    #[test]
    fn rejects_non_pod_cgroups() {
        assert!(parse_cgroup("0::/user.slice/user-1000.slice/session-3.scope\n").is_none());
    }
}
