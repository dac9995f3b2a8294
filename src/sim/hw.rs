//! Simulated RSC register block with a firmware thread that retires triggered TCSes.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use serde::Deserialize;

use crate::base::config::Config;
use crate::base::regs::RegisterBus;
use crate::rsc::irq::{IrqHandler, IrqLine};
use crate::rsc::regs::*;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimHwConfig {
    /// TCSes the DRV reports.
    pub num_tcs: usize,
    pub ncpt: usize,
    pub hw_solver: bool,
    /// Firmware time per triggered TCS.
    pub latency_us: u64,
    /// Retire triggered TCSes from the firmware thread; otherwise tests call `complete`.
    pub auto_complete: bool,
    /// Commands to these addresses are never issued.
    pub fault_addrs: Vec<u32>,
}

impl Config for SimHwConfig {}

impl Default for SimHwConfig {
    fn default() -> Self {
        Self {
            num_tcs: 10,
            ncpt: 16,
            hw_solver: false,
            latency_us: 20,
            auto_complete: true,
            fault_addrs: Vec::new(),
        }
    }
}

impl SimHwConfig {
    pub fn manual() -> Self {
        Self {
            auto_complete: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    regs: HashMap<usize, u32>,
    /// Triggered and not yet retired.
    busy: u32,
    /// Last value each resource address was driven to.
    applied: BTreeMap<u32, u32>,
}

impl SimState {
    fn get(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }
}

pub struct SimRsc {
    layout: RegLayout,
    hw: SimHwConfig,
    state: Mutex<SimState>,
    handler: OnceLock<IrqHandler>,
    /// One interrupt context: handler invocations never overlap.
    irq_lock: Mutex<()>,
    firmware: Mutex<Option<(Sender<usize>, JoinHandle<()>)>>,
}

impl SimRsc {
    pub fn new(tcs_offset: usize, drv_id: u32, hw: SimHwConfig) -> Arc<Self> {
        let mut state = SimState::default();
        let num_tcs = (hw.num_tcs as u32 & DRV_NUM_TCS_MASK)
            .checked_shl(DRV_NUM_TCS_SHIFT * drv_id)
            .unwrap_or(0);
        let ncpt = (hw.ncpt as u32 & DRV_NCPT_MASK) << DRV_NCPT_SHIFT;
        state.regs.insert(DRV_PRNT_CHLD_CONFIG, num_tcs | ncpt);
        state
            .regs
            .insert(DRV_SOLVER_CONFIG, (hw.hw_solver as u32) << DRV_HW_SOLVER_SHIFT);

        Arc::new(Self {
            layout: RegLayout::new(tcs_offset),
            hw,
            state: Mutex::new(state),
            handler: OnceLock::new(),
            irq_lock: Mutex::new(()),
            firmware: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the firmware thread, if configured to retire TCSes on its own.
    pub fn start(self: &Arc<Self>) {
        if !self.hw.auto_complete {
            return;
        }
        let mut firmware = self.firmware.lock().unwrap_or_else(PoisonError::into_inner);
        if firmware.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<usize>();
        let sim: Weak<SimRsc> = Arc::downgrade(self);
        let latency = Duration::from_micros(self.hw.latency_us);
        let spawned = thread::Builder::new()
            .name("rsc-firmware".to_string())
            .spawn(move || {
                while let Ok(tcs_id) = rx.recv() {
                    thread::sleep(latency);
                    match sim.upgrade() {
                        Some(sim) => sim.complete(tcs_id),
                        None => break,
                    }
                }
            });
        match spawned {
            Ok(handle) => *firmware = Some((tx, handle)),
            Err(err) => error!("cannot spawn firmware thread: {}", err),
        }
    }

    /// Stop the firmware thread after it drained every queued completion.
    pub fn stop(&self) {
        let firmware = self
            .firmware
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((tx, handle)) = firmware {
            drop(tx);
            if handle.join().is_err() {
                error!("firmware thread panicked");
            }
        }
    }

    fn on_trigger(&self, state: &mut SimState, tcs_id: usize) {
        state.busy |= 1 << tcs_id;
        let enabled = state.get(self.layout.tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id));
        for j in (0..MAX_CMDS_PER_TCS).filter(|j| enabled & (1 << j) != 0) {
            let addr = state.get(self.layout.tcs_cmd(RSC_DRV_CMD_ADDR, tcs_id, j));
            let status = if self.hw.fault_addrs.contains(&addr) { 0 } else { CMD_STATUS_ISSUED };
            state
                .regs
                .insert(self.layout.tcs_cmd(RSC_DRV_CMD_STATUS, tcs_id, j), status);
        }
        debug!("sim: TCS {} triggered, cmds {:#x}", tcs_id, enabled);

        let firmware = self.firmware.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((tx, _)) = firmware.as_ref() {
            let _ = tx.send(tcs_id);
        }
    }

    /// Apply the enabled commands of `tcs_id`; faulting addresses are left untouched.
    fn apply(&self, state: &mut SimState, tcs_id: usize, set_status: bool) {
        let enabled = state.get(self.layout.tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id));
        for j in (0..MAX_CMDS_PER_TCS).filter(|j| enabled & (1 << j) != 0) {
            let addr = state.get(self.layout.tcs_cmd(RSC_DRV_CMD_ADDR, tcs_id, j));
            let data = state.get(self.layout.tcs_cmd(RSC_DRV_CMD_DATA, tcs_id, j));
            let status = if self.hw.fault_addrs.contains(&addr) {
                0
            } else {
                state.applied.insert(addr, data);
                CMD_STATUS_ISSUED | CMD_STATUS_COMPL
            };
            if set_status {
                state
                    .regs
                    .insert(self.layout.tcs_cmd(RSC_DRV_CMD_STATUS, tcs_id, j), status);
            }
        }
    }

    /// Retire a triggered TCS and raise its interrupt if enabled.
    pub fn complete(&self, tcs_id: usize) {
        let raise = {
            let mut state = self.lock();
            if state.busy & (1 << tcs_id) == 0 {
                warn!("sim: TCS {} completed without a trigger", tcs_id);
                return;
            }
            self.apply(&mut state, tcs_id, true);
            state.busy &= !(1 << tcs_id);
            let irq_enable = state.get(self.layout.irq_reg(RSC_DRV_IRQ_ENABLE));
            let irq_enabled = irq_enable & (1 << tcs_id) != 0;
            if irq_enabled {
                let status = self.layout.irq_reg(RSC_DRV_IRQ_STATUS);
                let pending = state.get(status) | (1 << tcs_id);
                state.regs.insert(status, pending);
            }
            irq_enabled
        };

        if raise {
            let _irq = self.irq_lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.handler.get() {
                Some(handler) => handler(),
                None => warn!("sim: IRQ for TCS {} with no handler", tcs_id),
            }
        }
    }

    /// What firmware does on a power transition: send whatever is staged in `tcs_ids`.
    pub fn fire(&self, tcs_ids: Range<usize>) {
        let mut state = self.lock();
        for tcs_id in tcs_ids {
            self.apply(&mut state, tcs_id, false);
        }
    }

    pub fn applied(&self, addr: u32) -> Option<u32> {
        self.lock().applied.get(&addr).copied()
    }

    pub fn irq_enable(&self) -> u32 {
        self.lock().get(self.layout.irq_reg(RSC_DRV_IRQ_ENABLE))
    }

    pub fn cmd_enable(&self, tcs_id: usize) -> u32 {
        self.lock().get(self.layout.tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id))
    }

    pub fn is_triggered(&self, tcs_id: usize) -> bool {
        self.lock().busy & (1 << tcs_id) != 0
    }
}

impl RegisterBus for SimRsc {
    fn read32_impl(&self, offset: usize) -> u32 {
        let state = self.lock();
        match self.layout.decode_tcs(offset) {
            Some((tcs_id, RSC_DRV_STATUS)) => (state.busy & (1 << tcs_id) == 0) as u32,
            _ => state.get(offset),
        }
    }

    fn write32_impl(&self, offset: usize, value: u32) {
        let mut state = self.lock();
        if offset == self.layout.irq_reg(RSC_DRV_IRQ_CLEAR) {
            let status = self.layout.irq_reg(RSC_DRV_IRQ_STATUS);
            let pending = state.get(status) & !value;
            state.regs.insert(status, pending);
            return;
        }
        let old = state.regs.insert(offset, value).unwrap_or(0);
        if let Some((tcs_id, RSC_DRV_CONTROL)) = self.layout.decode_tcs(offset) {
            let armed = TCS_AMC_MODE_ENABLE | TCS_AMC_MODE_TRIGGER;
            if old & TCS_AMC_MODE_TRIGGER == 0 && value & armed == armed {
                self.on_trigger(&mut state, tcs_id);
            }
        }
    }
}

impl IrqLine for SimRsc {
    fn request(&self, handler: IrqHandler) {
        if self.handler.set(handler).is_err() {
            warn!("sim: IRQ handler already installed");
        }
    }

    fn is_pending(&self) -> bool {
        let state = self.lock();
        state.get(self.layout.irq_reg(RSC_DRV_IRQ_STATUS))
            & state.get(self.layout.irq_reg(RSC_DRV_IRQ_ENABLE))
            != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn topology_registers_are_seeded() {
        let sim = SimRsc::new(0xd00, 2, SimHwConfig::manual());
        let prnt = sim.read32(DRV_PRNT_CHLD_CONFIG);
        assert_eq!(10, (prnt >> 12) & DRV_NUM_TCS_MASK);
        assert_eq!(16, (prnt >> DRV_NCPT_SHIFT) & DRV_NCPT_MASK);
        assert_eq!(0, sim.read32(DRV_SOLVER_CONFIG));
    }

    #[test]
    fn irq_clear_is_write_one_to_clear() {
        let sim = SimRsc::new(0x100, 0, SimHwConfig::manual());
        let layout = RegLayout::new(0x100);
        sim.write32(layout.irq_reg(RSC_DRV_IRQ_STATUS), 0b111);
        sim.write32(layout.irq_reg(RSC_DRV_IRQ_CLEAR), 0b010);
        assert_eq!(0b101, sim.read32(layout.irq_reg(RSC_DRV_IRQ_STATUS)));
    }

    #[test]
    fn trigger_then_complete_raises_enabled_irq() {
        let sim = SimRsc::new(0, 0, SimHwConfig::manual());
        let layout = RegLayout::new(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        sim.request(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sim.write32(layout.irq_reg(RSC_DRV_IRQ_ENABLE), 0b1);
        sim.write32(layout.tcs_cmd(RSC_DRV_CMD_ADDR, 0, 0), 0x30000);
        sim.write32(layout.tcs_cmd(RSC_DRV_CMD_DATA, 0, 0), 9);
        sim.write32(layout.tcs_reg(RSC_DRV_CMD_ENABLE, 0), 0b1);
        sim.write32(layout.tcs_reg(RSC_DRV_CONTROL, 0), TCS_AMC_MODE_ENABLE);
        sim.write32(layout.tcs_reg(RSC_DRV_CONTROL, 0), TCS_AMC_MODE_ENABLE | TCS_AMC_MODE_TRIGGER);
        assert!(sim.is_triggered(0));
        assert_eq!(0, sim.read32(layout.tcs_reg(RSC_DRV_STATUS, 0)));

        sim.complete(0);
        assert_eq!(1, hits.load(Ordering::SeqCst));
        assert!(sim.is_pending());
        assert_eq!(Some(9), sim.applied(0x30000));
        assert_eq!(1, sim.read32(layout.tcs_reg(RSC_DRV_STATUS, 0)));
    }

    #[test]
    fn fire_applies_staged_commands_without_irq() {
        let sim = SimRsc::new(0, 0, SimHwConfig::manual());
        let layout = RegLayout::new(0);
        sim.write32(layout.tcs_cmd(RSC_DRV_CMD_ADDR, 2, 3), 0x50000);
        sim.write32(layout.tcs_cmd(RSC_DRV_CMD_DATA, 2, 3), 4);
        sim.write32(layout.tcs_reg(RSC_DRV_CMD_ENABLE, 2), 0b1000);
        sim.fire(0..3);
        assert_eq!(Some(4), sim.applied(0x50000));
        assert!(!sim.is_pending());
    }
}
