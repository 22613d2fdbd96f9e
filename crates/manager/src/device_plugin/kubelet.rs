//! Registration with the kubelet, plus the re-registration watch that
//! kicks in when the kubelet restarts and recreates its socket.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::info;
use tracing::warn;

use crate::device_plugin::api::registration_client::RegistrationClient;
use crate::device_plugin::api::DevicePluginOptions;
use crate::device_plugin::api::RegisterRequest;
use crate::device_plugin::API_VERSION;
use crate::types::KUBELET_SOCKET;

/// Open a client channel over a Unix socket. The URL is a placeholder,
/// the connector ignores it.
pub async fn uds_channel(socket_path: &Path) -> anyhow::Result<Channel> {
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

/// Register one resource sub-server with the kubelet.
pub async fn register(
    device_plugin_path: &Path,
    endpoint: &str,
    resource_name: &str,
    pre_start_required: bool,
) -> anyhow::Result<()> {
    let kubelet_socket = device_plugin_path.join(KUBELET_SOCKET);
    let channel = uds_channel(&kubelet_socket).await?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions {
            pre_start_required,
            get_preferred_allocation_available: false,
        }),
    };

    client.register(Request::new(request)).await?;
    info!(resource = resource_name, "registered with kubelet");
    Ok(())
}

/// Entry for the re-registration watch: endpoint + resource + whether the
/// resource wants the pre-start hook.
#[derive(Debug, Clone)]
pub struct Registration {
    pub endpoint: String,
    pub resource_name: String,
    pub pre_start_required: bool,
}

fn socket_stamp(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Re-register all resources whenever the kubelet socket is recreated.
/// The kubelet drops plugin registrations on restart, so a new socket
/// inode means we are no longer known.
pub async fn watch_kubelet(
    device_plugin_path: PathBuf,
    registrations: Vec<Registration>,
    cancellation_token: CancellationToken,
) {
    let kubelet_socket = device_plugin_path.join(KUBELET_SOCKET);
    let mut last_stamp = socket_stamp(&kubelet_socket);
    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => return,
            _ = interval.tick() => {}
        }

        let stamp = socket_stamp(&kubelet_socket);
        if stamp == last_stamp || stamp.is_none() {
            last_stamp = stamp.or(last_stamp);
            continue;
        }
        last_stamp = stamp;

        info!("kubelet socket changed, re-registering device plugins");
        for reg in &registrations {
            if let Err(e) = register(
                &device_plugin_path,
                &reg.endpoint,
                &reg.resource_name,
                reg.pre_start_required,
            )
            .await
            {
                warn!(resource = %reg.resource_name, "re-registration failed: {e}");
            }
        }
    }
}
