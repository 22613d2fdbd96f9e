//! Local inspection endpoint on the manager socket: renders the topology
//! tree and the current bindings for operators and debug tooling.

pub mod api {
    tonic::include_proto!("display");
}

use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::info;
use tracing::warn;

use crate::allocator::Allocator;

use self::api::display_server::Display;
use self::api::display_server::DisplayServer;
use self::api::TreeRequest;
use self::api::TreeResponse;
use self::api::UsageRequest;
use self::api::UsageResponse;

pub struct DisplayService {
    allocator: Arc<Allocator>,
}

impl DisplayService {
    /// Serve the inspection endpoint until cancelled.
    pub fn start(
        allocator: Arc<Allocator>,
        socket_path: &std::path::Path,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<()> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(socket = %socket_path.display(), "inspection endpoint ready");

        let service = DisplayService { allocator };
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DisplayServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    cancellation_token.cancelled_owned(),
                )
                .await;
            if let Err(e) = result {
                warn!("inspection endpoint exited: {e}");
            }
        });
        Ok(())
    }
}

#[tonic::async_trait]
impl Display for DisplayService {
    async fn print_tree(
        &self,
        _request: Request<TreeRequest>,
    ) -> Result<Response<TreeResponse>, Status> {
        Ok(Response::new(TreeResponse {
            graph: self.allocator.graph().await,
        }))
    }

    async fn print_usage(
        &self,
        _request: Request<UsageRequest>,
    ) -> Result<Response<UsageResponse>, Status> {
        let usage = self.allocator.usage().await;
        let rendered = serde_json::to_string_pretty(&usage)
            .map_err(|e| Status::internal(format!("render usage: {e}")))?;
        Ok(Response::new(UsageResponse { usage: rendered }))
    }
}
