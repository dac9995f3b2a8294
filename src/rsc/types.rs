use std::fmt::{Display, Formatter};

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::rsc::error::RscError;
use crate::rsc::regs::MAX_CMDS_PER_TCS;

/// Most commands a single client request may carry.
pub const MAX_RPMH_PAYLOAD: usize = 16;

/// TCS group types. The discriminants are the numeric `type` cells accepted in `tcs_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcsType {
    Sleep = 0,
    Wake = 1,
    Active = 2,
    Control = 3,
    FastPath = 4,
}

impl TcsType {
    pub const ALL: [TcsType; 5] = [
        TcsType::Sleep,
        TcsType::Wake,
        TcsType::Active,
        TcsType::Control,
        TcsType::FastPath,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Power state a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpmhState {
    Sleep,
    WakeOnly,
    ActiveOnly,
}

impl RpmhState {
    pub fn is_active(self) -> bool {
        matches!(self, RpmhState::ActiveOnly)
    }
}

/// One (address, data) command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcsCmd {
    pub addr: u32,
    pub data: u32,
    /// Ask for a completion response for this command even if the request does not.
    #[serde(default)]
    pub wait: bool,
}

impl TcsCmd {
    pub fn new(addr: u32, data: u32) -> Self {
        Self { addr, data, wait: false }
    }

    pub fn with_wait(addr: u32, data: u32) -> Self {
        Self { addr, data, wait: true }
    }
}

/// A client request: an ordered command list for one power state. All commands land in
/// adjacent command slots of a single TCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcsRequest {
    pub state: RpmhState,
    pub wait_for_compl: bool,
    pub cmds: SmallVec<[TcsCmd; 4]>,
}

impl TcsRequest {
    pub fn new(state: RpmhState, cmds: &[TcsCmd]) -> Self {
        Self {
            state,
            wait_for_compl: false,
            cmds: SmallVec::from_slice(cmds),
        }
    }

    pub fn single(state: RpmhState, addr: u32, data: u32) -> Self {
        Self::new(state, &[TcsCmd::new(addr, data)])
    }

    pub fn wait_for_compl(mut self, wait: bool) -> Self {
        self.wait_for_compl = wait;
        self
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn touches(&self, addr: u32) -> bool {
        self.cmds.iter().any(|cmd| cmd.addr == addr)
    }

    /// Whether hardware should respond for command `i`.
    pub fn response_required(&self, i: usize) -> bool {
        self.wait_for_compl || self.cmds.get(i).map_or(false, |cmd| cmd.wait)
    }

    /// Check the request fits one TCS of `ncpt` commands.
    pub fn validate(&self, ncpt: usize) -> Result<(), RscError> {
        if self.cmds.is_empty() {
            return Err(RscError::InvalidRequest("request carries no commands"));
        }
        if self.cmds.len() > MAX_RPMH_PAYLOAD || self.cmds.len() > MAX_CMDS_PER_TCS {
            return Err(RscError::InvalidRequest("more commands than a request may carry"));
        }
        if self.cmds.len() > ncpt {
            return Err(RscError::InvalidRequest("more commands than fit in one TCS"));
        }
        Ok(())
    }
}

impl Display for TcsRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req [state: {:?}, wait: {}, cmds:", self.state, self.wait_for_compl)?;
        for cmd in self.cmds.iter() {
            write!(f, " {:#x}={:#x}", cmd.addr, cmd.data)?;
        }
        write!(f, "]")
    }
}
