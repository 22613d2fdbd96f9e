//! Kubelet device-plugin surface: the two resource sub-servers and the
//! registration client.

#![allow(clippy::doc_markdown)]

pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod kubelet;
pub mod server;

pub use server::ResourceRole;
pub use server::ResourceServer;

pub const API_VERSION: &str = "v1beta1";
pub const HEALTHY: &str = "Healthy";

/// Device node passed through to the container with full cgroup access.
pub fn device_spec(path: &str) -> api::DeviceSpec {
    api::DeviceSpec {
        container_path: path.to_string(),
        host_path: path.to_string(),
        permissions: "rwm".to_string(),
    }
}
