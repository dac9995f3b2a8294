//! TCS scheduler of one RSC: slot allocation, Active transfers, deferred sleep/wake staging,
//! and the completion interrupt.

pub mod completion;
pub mod config;
pub mod controller;
pub mod debug;
pub mod error;
pub mod group;
pub mod irq;
pub mod regs;
pub mod stats;
pub mod types;

pub use completion::{Completion, CompletionSink, RequestRef, Transfer, TransferResult};
pub use config::{RscConfig, TcsGroupConfig};
pub use controller::{Controller, ControllerGuard};
pub use error::RscError;
pub use irq::{IrqHandler, IrqLine};
pub use types::{RpmhState, TcsCmd, TcsRequest, TcsType};
