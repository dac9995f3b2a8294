//! State dump for a controller that stopped retiring transfers.

use log::warn;
use phf::phf_map;
use serde::Serialize;

use crate::base::module::IsModule;
use crate::rsc::completion::Completion;
use crate::rsc::controller::Controller;
use crate::rsc::regs::*;
use crate::rsc::types::{RpmhState, TcsType};

static ACCL_NAMES: phf::Map<u32, &'static str> = phf_map! {
    3u32 => "CLK",
    4u32 => "VREG",
    5u32 => "BUS",
};

#[derive(Debug, Clone, Serialize)]
pub struct CmdSnapshot {
    pub cmd_id: usize,
    pub addr: u32,
    pub data: u32,
    pub msgid: u32,
    pub status: u32,
}

impl CmdSnapshot {
    /// Sent to the accelerator, no answer yet.
    pub fn is_stuck(&self) -> bool {
        self.status & CMD_STATUS_ISSUED != 0 && self.status & CMD_STATUS_COMPL == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TcsSnapshot {
    pub tcs_id: usize,
    pub group: Option<TcsType>,
    pub state: Option<RpmhState>,
    pub control: u32,
    pub irq_done: bool,
    pub cmds: Vec<CmdSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RscSnapshot {
    pub name: String,
    pub busy: Vec<usize>,
    pub irq_status: u32,
    pub irq_pending: bool,
    pub completion_done: Option<bool>,
    pub fast_path_busy: Option<bool>,
    pub tcses: Vec<TcsSnapshot>,
    pub stuck_accelerators: Vec<&'static str>,
    pub diagnosis: Option<String>,
}

impl Controller {
    fn snapshot_tcs(
        &self,
        tcs_id: usize,
        irq_status: u32,
        ty: Option<TcsType>,
        state: Option<RpmhState>,
    ) -> TcsSnapshot {
        let enabled = self.regs.read_tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id);
        let cmds = (0..MAX_CMDS_PER_TCS)
            .filter(|j| enabled & (1 << j) != 0)
            .map(|j| CmdSnapshot {
                cmd_id: j,
                addr: self.regs.read_tcs_cmd(RSC_DRV_CMD_ADDR, tcs_id, j),
                data: self.regs.read_tcs_cmd(RSC_DRV_CMD_DATA, tcs_id, j),
                msgid: self.regs.read_tcs_cmd(RSC_DRV_CMD_MSGID, tcs_id, j),
                status: self.regs.read_tcs_cmd(RSC_DRV_CMD_STATUS, tcs_id, j),
            })
            .collect();
        TcsSnapshot {
            tcs_id,
            group: ty,
            state,
            control: self.regs.read_tcs_reg(RSC_DRV_CONTROL, tcs_id),
            irq_done: irq_status & (1 << tcs_id) != 0,
            cmds,
        }
    }

    /// A busy TCS whose completion is raised and still pending at the interrupt line points at
    /// the host; anything else at the accelerators.
    fn diagnose(tcses: &[TcsSnapshot], irq_pending: bool, stuck: &[&str]) -> Option<String> {
        if tcses.is_empty() {
            return None;
        }
        if irq_pending && tcses.iter().any(|tcs| tcs.irq_done) {
            Some("possible lockup in host".to_string())
        } else {
            Some(format!("accelerator(s) {{ {} }} did not respond", stuck.join(" ")))
        }
    }

    /// Log and return everything known about the claimed TCSes. `completion` is the one a timed
    /// out caller was waiting on.
    pub fn debug_dump(&self, completion: Option<&Completion>) -> RscSnapshot {
        let state = self.state();
        let irq_status = self.regs.read_irq(RSC_DRV_IRQ_STATUS);

        let tcses: Vec<_> = state
            .tcs_in_use
            .iter()
            .map(|tcs_id| {
                let group = state.groups.iter().find(|group| group.contains(tcs_id));
                let req_state = group
                    .and_then(|group| group.request(tcs_id))
                    .map(|transfer| transfer.msg.state);
                self.snapshot_tcs(tcs_id, irq_status, group.map(|g| g.ty()), req_state)
            })
            .collect();
        drop(state);

        let mut stuck: Vec<&'static str> = tcses
            .iter()
            .flat_map(|tcs| tcs.cmds.iter())
            .filter(|cmd| cmd.is_stuck())
            .filter_map(|cmd| ACCL_NAMES.get(&accl_type(cmd.addr)).copied())
            .collect();
        stuck.sort_unstable();
        stuck.dedup();
        let irq_pending = self.irq_pending();

        let snapshot = RscSnapshot {
            name: self.name.clone(),
            busy: tcses.iter().map(|tcs| tcs.tcs_id).collect(),
            irq_status,
            irq_pending,
            completion_done: completion.map(Completion::is_done),
            fast_path_busy: self
                .fast_path
                .map(|tcs_id| self.regs.read_tcs_reg(RSC_DRV_STATUS, tcs_id) == 0),
            diagnosis: Self::diagnose(&tcses, irq_pending, &stuck),
            stuck_accelerators: stuck,
            tcses,
        };

        if snapshot.tcses.is_empty() {
            warn!("{}: no TCSes are engaged", self.name);
        }
        for tcs in &snapshot.tcses {
            warn!(
                "{}: TCS {} busy ({:?}, {:?}), control={:#x}, irq {}",
                self.name,
                tcs.tcs_id,
                tcs.group,
                tcs.state,
                tcs.control,
                if tcs.irq_done { "completed" } else { "not completed" }
            );
            for cmd in &tcs.cmds {
                warn!(
                    "  cmd {}: addr={:#x} data={:#x} msgid={:#x} status={:#x}",
                    cmd.cmd_id, cmd.addr, cmd.data, cmd.msgid, cmd.status
                );
            }
        }
        if let Some(done) = snapshot.completion_done {
            warn!("{}: completion is {}", self.name, if done { "done" } else { "still pending" });
        }
        if let Some(diagnosis) = &snapshot.diagnosis {
            warn!("{}: {}", self.name, diagnosis);
        }
        snapshot
    }
}
