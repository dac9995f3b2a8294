//! Register map of one RSC DRV and the accessors the scheduler programs it through.
//!
//! ```text
//!  DRV base
//!  +0x04  DRV_SOLVER_CONFIG       hw solver bit @24
//!  +0x0C  DRV_PRNT_CHLD_CONFIG    num TCS (6 bits per DRV id), cmds per TCS @27
//!  ...
//!  TCS base (tcs_offset)
//!  +0x00  IRQ enable / +0x04 IRQ status / +0x08 IRQ clear (w1c), one bit per TCS
//!  +0x10 + 672 * tcs   per-TCS registers, commands from +0x30 in strides of 20
//! ```

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};

use crate::base::regs::RegisterBus;
use crate::rsc::types::TcsRequest;

pub const RSC_DRV_TCS_OFFSET: usize = 672;
pub const RSC_DRV_CMD_OFFSET: usize = 20;

/* DRV HW Solver Configuration Information Register */
pub const DRV_SOLVER_CONFIG: usize = 0x04;
pub const DRV_HW_SOLVER_MASK: u32 = 1;
pub const DRV_HW_SOLVER_SHIFT: u32 = 24;

/* DRV TCS Configuration Information Register */
pub const DRV_PRNT_CHLD_CONFIG: usize = 0x0C;
pub const DRV_NUM_TCS_MASK: u32 = 0x3F;
pub const DRV_NUM_TCS_SHIFT: u32 = 6;
pub const DRV_NCPT_MASK: u32 = 0x1F;
pub const DRV_NCPT_SHIFT: u32 = 27;

// one bit per TCS
pub const RSC_DRV_IRQ_ENABLE: usize = 0x00;
pub const RSC_DRV_IRQ_STATUS: usize = 0x04;
pub const RSC_DRV_IRQ_CLEAR: usize = 0x08;

// per TCS
pub const RSC_DRV_CMD_WAIT_FOR_CMPL: usize = 0x10;
pub const RSC_DRV_CONTROL: usize = 0x14;
pub const RSC_DRV_STATUS: usize = 0x18; // zero if tcs is busy
pub const RSC_DRV_CMD_ENABLE: usize = 0x1C;

// per command in a TCS
pub const RSC_DRV_CMD_MSGID: usize = 0x30;
pub const RSC_DRV_CMD_ADDR: usize = 0x34;
pub const RSC_DRV_CMD_DATA: usize = 0x38;
pub const RSC_DRV_CMD_STATUS: usize = 0x3C;

pub const TCS_AMC_MODE_ENABLE: u32 = 1 << 16;
pub const TCS_AMC_MODE_TRIGGER: u32 = 1 << 24;

pub const CMD_MSGID_LEN: u32 = 8;
pub const CMD_MSGID_RESP_REQ: u32 = 1 << 8;
pub const CMD_MSGID_WRITE: u32 = 1 << 16;
pub const CMD_STATUS_ISSUED: u32 = 1 << 8;
pub const CMD_STATUS_COMPL: u32 = 1 << 16;

pub const MAX_CMDS_PER_TCS: usize = 16;
pub const MAX_TCS_PER_TYPE: usize = 3;
pub const TCS_TYPE_NR: usize = 5;
pub const MAX_TCS_NR: usize = MAX_TCS_PER_TYPE * TCS_TYPE_NR;

/// Read-back attempts of [`RscRegs::write_tcs_reg_sync`]. A counter rather than a clock, since
/// this also runs late in suspend.
const SYNC_WRITE_POLLS: usize = 1000;

/// Accelerator type encoded in a resource address.
pub fn accl_type(addr: u32) -> u32 {
    (addr >> 16) & 0xF
}

/// Base offsets of the two register windows a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegLayout {
    pub tcs_base: usize,
    pub irq_base: usize,
}

impl RegLayout {
    /// IRQ registers live at the start of the TCS window on every known DRV.
    pub fn new(tcs_base: usize) -> Self {
        Self {
            tcs_base,
            irq_base: tcs_base,
        }
    }

    pub fn tcs_reg(&self, reg: usize, tcs_id: usize) -> usize {
        self.tcs_base + RSC_DRV_TCS_OFFSET * tcs_id + reg
    }

    pub fn tcs_cmd(&self, reg: usize, tcs_id: usize, cmd_id: usize) -> usize {
        self.tcs_reg(reg, tcs_id) + RSC_DRV_CMD_OFFSET * cmd_id
    }

    pub fn irq_reg(&self, reg: usize) -> usize {
        self.irq_base + reg
    }

    /// Inverse of [`RegLayout::tcs_reg`]; `None` for offsets outside the per-TCS windows.
    pub fn decode_tcs(&self, offset: usize) -> Option<(usize, usize)> {
        let rel = offset.checked_sub(self.tcs_base)?;
        let tcs_id = rel / RSC_DRV_TCS_OFFSET;
        let reg = rel % RSC_DRV_TCS_OFFSET;
        (reg >= RSC_DRV_CMD_WAIT_FOR_CMPL).then_some((tcs_id, reg))
    }
}

/// Register accessors of one DRV.
#[derive(Clone)]
pub struct RscRegs {
    bus: Arc<dyn RegisterBus>,
    layout: RegLayout,
}

impl RscRegs {
    pub fn new(bus: Arc<dyn RegisterBus>, layout: RegLayout) -> Self {
        Self { bus, layout }
    }

    pub fn layout(&self) -> RegLayout {
        self.layout
    }

    /// Registers relative to the DRV base rather than the TCS window.
    pub fn read_drv(&self, reg: usize) -> u32 {
        self.bus.read32(reg)
    }

    pub fn read_irq(&self, reg: usize) -> u32 {
        self.bus.read32(self.layout.irq_reg(reg))
    }

    pub fn write_irq(&self, reg: usize, data: u32) {
        self.bus.write32(self.layout.irq_reg(reg), data)
    }

    pub fn read_tcs_reg(&self, reg: usize, tcs_id: usize) -> u32 {
        self.bus.read32(self.layout.tcs_reg(reg, tcs_id))
    }

    pub fn write_tcs_reg(&self, reg: usize, tcs_id: usize, data: u32) {
        self.bus.write32(self.layout.tcs_reg(reg, tcs_id), data)
    }

    pub fn read_tcs_cmd(&self, reg: usize, tcs_id: usize, cmd_id: usize) -> u32 {
        self.bus.read32(self.layout.tcs_cmd(reg, tcs_id, cmd_id))
    }

    pub fn write_tcs_cmd(&self, reg: usize, tcs_id: usize, cmd_id: usize, data: u32) {
        self.bus.write32(self.layout.tcs_cmd(reg, tcs_id, cmd_id), data)
    }

    /// Write and wait until the value reads back. Returns false if it never did.
    pub fn write_tcs_reg_sync(&self, reg: usize, tcs_id: usize, data: u32) -> bool {
        self.write_tcs_reg(reg, tcs_id, data);
        for _ in 0..SYNC_WRITE_POLLS {
            if self.read_tcs_reg(reg, tcs_id) == data {
                return true;
            }
            std::thread::sleep(Duration::from_micros(1));
        }
        error!("error writing {:#x} to {}:{:#x}", data, tcs_id, reg);
        false
    }

    /// Enable or disable the completion IRQ of one TCS.
    pub fn enable_tcs_irq(&self, tcs_id: usize, enable: bool) {
        let mut data = self.read_irq(RSC_DRV_IRQ_ENABLE);
        if enable {
            data |= 1 << tcs_id;
        } else {
            data &= !(1 << tcs_id);
        }
        self.write_irq(RSC_DRV_IRQ_ENABLE, data);
    }

    /// Start a transfer (`trigger`) or only un-trigger a borrowed TCS.
    ///
    /// Hardware only accepts a new trigger once the previous one is cleared: drop TRIGGER, then
    /// ENABLE, then set ENABLE, then TRIGGER.
    pub fn set_trigger(&self, tcs_id: usize, trigger: bool) {
        let mut enable = self.read_tcs_reg(RSC_DRV_CONTROL, tcs_id);
        enable &= !TCS_AMC_MODE_TRIGGER;
        self.write_tcs_reg_sync(RSC_DRV_CONTROL, tcs_id, enable);
        enable &= !TCS_AMC_MODE_ENABLE;
        self.write_tcs_reg_sync(RSC_DRV_CONTROL, tcs_id, enable);

        if trigger {
            enable = TCS_AMC_MODE_ENABLE;
            self.write_tcs_reg_sync(RSC_DRV_CONTROL, tcs_id, enable);
            enable |= TCS_AMC_MODE_TRIGGER;
            self.write_tcs_reg(RSC_DRV_CONTROL, tcs_id, enable);
        }
    }

    /// Program the commands of `msg` into `tcs_id` starting at `cmd_id`, without triggering.
    pub fn buffer_write(&self, tcs_id: usize, cmd_id: usize, msg: &TcsRequest) {
        let mut cmd_msgid = CMD_MSGID_LEN | CMD_MSGID_WRITE;
        if msg.wait_for_compl {
            cmd_msgid |= CMD_MSGID_RESP_REQ;
        }

        let mut cmd_enable = 0u32;
        for (i, cmd) in msg.cmds.iter().enumerate() {
            let j = cmd_id + i;
            cmd_enable |= 1 << j;
            let msgid = if cmd.wait { cmd_msgid | CMD_MSGID_RESP_REQ } else { cmd_msgid };

            self.write_tcs_cmd(RSC_DRV_CMD_MSGID, tcs_id, j, msgid);
            self.write_tcs_cmd(RSC_DRV_CMD_ADDR, tcs_id, j, cmd.addr);
            self.write_tcs_cmd(RSC_DRV_CMD_DATA, tcs_id, j, cmd.data);
            debug!(
                "TCS write: m={} n={} msgid={:#x} addr={:#x} data={:#x} wait={}",
                tcs_id, j, msgid, cmd.addr, cmd.data, cmd.wait
            );
        }

        cmd_enable |= self.read_tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id);
        self.write_tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id, cmd_enable);
    }

    /// Addresses of all commands currently enabled in `tcs_id`.
    pub fn enabled_addrs(&self, tcs_id: usize) -> impl Iterator<Item = u32> + '_ {
        let enabled = self.read_tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id);
        (0..MAX_CMDS_PER_TCS)
            .filter(move |j| enabled & (1 << j) != 0)
            .map(move |j| self.read_tcs_cmd(RSC_DRV_CMD_ADDR, tcs_id, j))
    }
}
