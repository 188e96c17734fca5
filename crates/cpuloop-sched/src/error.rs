use std::io;

use thiserror::Error;

use crate::CpuIndex;

pub type Result<T, E = SchedError> = std::result::Result<T, E>;

/// Failure reported by an execution backend while creating or tearing down a vCPU.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("failed to spawn vCPU thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("vCPU {index} initialization failed: {source}")]
    VcpuInit { index: CpuIndex, source: BackendError },

    #[error("vCPU {index} teardown failed: {source}")]
    VcpuDestroy { index: CpuIndex, source: BackendError },

    #[error("vCPU {0} thread panicked")]
    ThreadPanicked(CpuIndex),

    #[error("failed to flush I/O while stopping the VM: {0}")]
    Flush(#[source] io::Error),

    #[error("no vCPU with index {0}")]
    NoSuchVcpu(CpuIndex),
}
