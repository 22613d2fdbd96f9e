use thiserror::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[error("Pod not found: {name} in namespace {namespace}")]
    PodNotFound { namespace: String, name: String },
    #[error("Pod terminated: {name} in namespace {namespace}")]
    PodTerminated { namespace: String, name: String },
    #[error("Pod does not request GPU resources: {name} in namespace {namespace}")]
    NotGpuRequired { namespace: String, name: String },
}
