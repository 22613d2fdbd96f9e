//! One device-plugin gRPC server per advertised resource.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::allocator::Allocator;
use crate::device_plugin::api;
use crate::device_plugin::api::device_plugin_server::DevicePlugin;
use crate::device_plugin::api::device_plugin_server::DevicePluginServer;
use crate::types::VCORE_RESOURCE;
use crate::types::VMEMORY_RESOURCE;

/// Which of the two advertised resources a server fronts. Only the vcore
/// surface drives the allocator; the memory dimension is bookkeeping the
/// vcore path folds in by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRole {
    Vcore,
    Vmemory,
}

impl ResourceRole {
    pub fn resource_name(&self) -> &'static str {
        match self {
            ResourceRole::Vcore => VCORE_RESOURCE,
            ResourceRole::Vmemory => VMEMORY_RESOURCE,
        }
    }

    pub fn socket_name(&self) -> &'static str {
        match self {
            ResourceRole::Vcore => "vcore.sock",
            ResourceRole::Vmemory => "vmemory.sock",
        }
    }
}

/// A device-plugin sub-server bound to one Unix socket under the kubelet
/// device-plugin directory.
pub struct ResourceServer {
    role: ResourceRole,
    socket_path: std::path::PathBuf,
    allocator: Arc<Allocator>,
}

impl ResourceServer {
    pub fn new(
        role: ResourceRole,
        device_plugin_path: &std::path::Path,
        allocator: Arc<Allocator>,
    ) -> Self {
        Self {
            role,
            socket_path: device_plugin_path.join(role.socket_name()),
            allocator,
        }
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    pub fn endpoint(&self) -> String {
        self.role.socket_name().to_string()
    }

    pub fn resource_name(&self) -> &'static str {
        self.role.resource_name()
    }

    /// Bind the socket and serve until the token is cancelled.
    pub fn start(&self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        let service = ResourceService {
            role: self.role,
            allocator: self.allocator.clone(),
            cancellation_token: cancellation_token.clone(),
        };

        info!(resource = self.resource_name(), socket = %self.socket_path.display(), "device plugin server ready");

        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        cancellation_token.cancelled().await;
                        info!("shutting down device plugin server");
                    },
                )
                .await;
            if let Err(e) = result {
                warn!("device plugin server exited: {e}");
            }
        });

        Ok(())
    }
}

struct ResourceService {
    role: ResourceRole,
    allocator: Arc<Allocator>,
    cancellation_token: CancellationToken,
}

#[tonic::async_trait]
impl DevicePlugin for ResourceService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<api::DevicePluginOptions>> {
        let options = match self.role {
            // pre-start gives the allocator its hook to verify the
            // binding and stage the controller directory
            ResourceRole::Vcore => api::DevicePluginOptions {
                pre_start_required: true,
                get_preferred_allocation_available: false,
            },
            ResourceRole::Vmemory => api::DevicePluginOptions::default(),
        };
        Ok(Response::new(options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<api::ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(resource = self.role.resource_name(), "list and watch started");

        let devices = self
            .allocator
            .capacity()
            .await
            .into_iter()
            .filter(|dev| dev.id.starts_with(self.role.resource_name()))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            if tx.send(Ok(api::ListAndWatchResponse { devices })).is_err() {
                return;
            }
            // health updates are never streamed; the transport closing is
            // the only way out
            cancellation_token.cancelled().await;
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<api::PreferredAllocationRequest>,
    ) -> TonicResult<Response<api::PreferredAllocationResponse>> {
        debug!("preferred allocation request: {:?}", request.into_inner());
        Ok(Response::new(api::PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<api::AllocateRequest>,
    ) -> TonicResult<Response<api::AllocateResponse>> {
        let req = request.into_inner();

        if self.role == ResourceRole::Vmemory {
            // the memory dimension carries no devices of its own
            return Ok(Response::new(api::AllocateResponse {
                container_responses: vec![api::ContainerAllocateResponse::default()],
            }));
        }

        let container_req = req
            .container_requests
            .into_iter()
            .next()
            .ok_or_else(|| Status::invalid_argument("empty container request"))?;

        let resp = self
            .allocator
            .allocate(container_req.devices_ids)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(api::AllocateResponse {
            container_responses: vec![resp],
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<api::PreStartContainerRequest>,
    ) -> TonicResult<Response<api::PreStartContainerResponse>> {
        if self.role == ResourceRole::Vmemory {
            return Ok(Response::new(api::PreStartContainerResponse {}));
        }

        let req = request.into_inner();
        debug!("pre-start container request: {:?}", req);
        self.allocator
            .pre_start_container(req.devices_ids)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(api::PreStartContainerResponse {}))
    }
}
