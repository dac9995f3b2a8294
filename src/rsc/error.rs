use std::time::Duration;

use thiserror::Error;

use crate::rsc::types::TcsType;

/// Errors surfaced by the scheduler, the write-back cache and the PM hooks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RscError {
    /// Address conflict, no free TCS, solver mode, or the controller lock is contended.
    #[error("controller busy")]
    Busy,
    /// The sleep/wake command budget is used up until the next invalidate.
    #[error("no room for {needed} commands in the {group:?} TCS group")]
    OutOfSpace { group: TcsType, needed: usize },
    /// Hardware has not quiesced yet.
    #[error("hardware not quiesced, try again")]
    Retry,
    #[error("no completion within {0:?}")]
    Timeout(Duration),
    #[error("TCS {tcs_id} cmd {cmd_id} (addr {addr:#x}) rejected by hardware, status {status:#x}")]
    HardwareFault {
        tcs_id: usize,
        cmd_id: usize,
        addr: u32,
        status: u32,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    /// The controller has no TCS of the kind the operation needs.
    #[error("no {0:?} TCS on this controller")]
    NoDevice(TcsType),
    #[error("invalid TCS topology: {0}")]
    InvalidTopology(String),
    #[error("controller registry is full")]
    RegistryFull,
}

impl RscError {
    /// Errors a caller may resolve by trying again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RscError::Busy | RscError::Retry)
    }
}
