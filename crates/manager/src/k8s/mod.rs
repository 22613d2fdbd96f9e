//! Kubernetes integration: client bootstrap, the node-scoped pod watcher
//! and the GPU resource predicates over pod specs.

pub mod kube_client;
pub mod pod_info;
pub mod pod_watcher;
pub mod types;

pub use kube_client::init_kube_client;
pub use pod_watcher::PodWatcher;
pub use types::KubernetesError;
