use thiserror::Error;

use crate::allocator::checkpoint::CheckpointError;
use crate::driver::DriverError;

/// Errors surfaced by the allocation state machine.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("share mode is not enabled")]
    ShareDisabled,
    #[error("cores and memory must both be positive in share mode")]
    InvalidShareRequest,
    #[error("request memory {requested} is larger than any single device ({limit})")]
    OversizedMemory { requested: u64, limit: u64 },
    #[error("no free node")]
    NoFreeNode,
    #[error("allocation request mismatch: {0}")]
    AllocationMismatch(String),
    #[error("device mismatch with scheduler: picked {picked}, predicate {predicate}")]
    PredicateMismatch { picked: String, predicate: String },
    #[error("{0}")]
    PreStartCheckFailed(String),
    #[error("pod lookup failed: {0}")]
    PodLookupFailed(String),
    #[error("container lookup failed: {0}")]
    ContainerLookupFailed(String),
    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("driver failure: {0}")]
    Driver(#[from] DriverError),
    #[error("kubernetes api failure: {0}")]
    Kubernetes(String),
    #[error("virtual device setup failed: {0}")]
    VcudaSetupFailed(String),
}

impl From<AllocatorError> for tonic::Status {
    fn from(err: AllocatorError) -> Self {
        match &err {
            AllocatorError::InvalidRequest(_)
            | AllocatorError::InvalidShareRequest
            | AllocatorError::OversizedMemory { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            }
            AllocatorError::NoFreeNode => tonic::Status::resource_exhausted(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}
