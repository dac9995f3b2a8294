//! One RSC DRV: its TCS groups, the busy bitmap, and the scheduling entry points.

use std::sync::{Arc, Condvar, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use log::{debug, error, info};

use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::base::regs::RegisterBus;
use crate::rpmh::cache::{DeferredTarget, FlushOutcome, WriteBackCache};
use crate::rsc::completion::Transfer;
use crate::rsc::config::RscConfig;
use crate::rsc::error::RscError;
use crate::rsc::group::{BusyMap, TcsGroup};
use crate::rsc::irq::IrqLine;
use crate::rsc::regs::*;
use crate::rsc::stats::RscStats;
use crate::rsc::types::{RpmhState, TcsRequest, TcsType};

const FAST_PATH_POLLS: usize = 5;

#[derive(Debug)]
pub struct ControllerState {
    /// Indexed by [`TcsType::index`].
    pub(crate) groups: [TcsGroup; TCS_TYPE_NR],
    pub(crate) tcs_in_use: BusyMap,
    pub(crate) in_solver_mode: bool,
    pub(crate) stats: RscStats,
}

pub struct Controller {
    base: ModuleBase<ControllerState, RscConfig>,
    pub(crate) name: String,
    pub(crate) regs: RscRegs,
    /// Parked `send_active` callers; signalled whenever a TCS is released.
    pub(crate) tcs_wait: Condvar,
    pub(crate) cache: WriteBackCache,
    /// TCSes laid out in groups with a slot mask.
    pub(crate) num_tcs: usize,
    pub(crate) ncpt: usize,
    /// No Active TCS; Active requests go through a Wake TCS.
    pub(crate) borrow_wake: bool,
    pub(crate) fast_path: Option<usize>,
    /// The hardware solver owns sleep/wake sequencing.
    pub(crate) solver_present: bool,
    irq_line: OnceLock<Arc<dyn IrqLine>>,
}

module!(Controller, ControllerState, RscConfig,);

/// The controller lock, held. Entry points that must run under a lock taken elsewhere (the
/// last-CPU-down flush, suspend hooks) go through this.
pub struct ControllerGuard<'a> {
    drv: &'a Controller,
    state: MutexGuard<'a, ControllerState>,
}

fn probe_groups(
    config: &RscConfig,
    max_tcs: usize,
    ncpt: usize,
) -> Result<([TcsGroup; TCS_TYPE_NR], usize), RscError> {
    if config.tcs_config.len() != TCS_TYPE_NR {
        return Err(RscError::InvalidTopology(format!(
            "expected {} tcs_config entries, got {}",
            TCS_TYPE_NR,
            config.tcs_config.len()
        )));
    }

    let mut seen = [false; TCS_TYPE_NR];
    let mut groups = TcsType::ALL.map(|ty| TcsGroup::new(ty, 0, 0, ncpt, false));
    let mut st = 0;
    for entry in config.tcs_config.iter() {
        let idx = entry.ty.index();
        if seen[idx] {
            return Err(RscError::InvalidTopology(format!("{:?} configured twice", entry.ty)));
        }
        seen[idx] = true;
        if entry.count > MAX_TCS_PER_TYPE {
            return Err(RscError::InvalidTopology(format!(
                "{} {:?} TCSes, at most {} allowed",
                entry.count, entry.ty, MAX_TCS_PER_TYPE
            )));
        }

        let mapped = entry.count > 0 && entry.ty != TcsType::Control;
        if mapped && (st + entry.count > max_tcs || st + entry.count >= 32) {
            return Err(RscError::InvalidTopology(format!(
                "{:?} TCSes {}..{} exceed the {} available",
                entry.ty,
                st,
                st + entry.count,
                max_tcs
            )));
        }
        groups[idx] = TcsGroup::new(entry.ty, st, entry.count, ncpt, mapped);
        if mapped {
            st += entry.count;
        }
    }
    Ok((groups, st))
}

impl Controller {
    /// Read the DRV topology, lay out the TCS groups and arm the Active IRQs.
    pub fn probe(config: RscConfig, bus: Arc<dyn RegisterBus>) -> Result<Arc<Self>, RscError> {
        let regs = RscRegs::new(bus, RegLayout::new(config.tcs_offset));

        let shift = DRV_NUM_TCS_SHIFT
            .checked_mul(config.drv_id)
            .filter(|&shift| shift < 32)
            .ok_or_else(|| RscError::InvalidTopology(format!("bad drv_id {}", config.drv_id)))?;
        let prnt = regs.read_drv(DRV_PRNT_CHLD_CONFIG);
        let max_tcs = ((prnt >> shift) & DRV_NUM_TCS_MASK) as usize;
        let ncpt = ((prnt >> DRV_NCPT_SHIFT) & DRV_NCPT_MASK) as usize;
        if ncpt == 0 || ncpt > MAX_CMDS_PER_TCS {
            return Err(RscError::InvalidTopology(format!("{} commands per TCS", ncpt)));
        }

        let (groups, num_tcs) = probe_groups(&config, max_tcs, ncpt)?;
        let solver_config = regs.read_drv(DRV_SOLVER_CONFIG);
        let solver_present = (solver_config >> DRV_HW_SOLVER_SHIFT) & DRV_HW_SOLVER_MASK != 0;
        let borrow_wake = groups[TcsType::Active.index()].num_tcs() == 0;
        let fast_path = groups[TcsType::FastPath.index()].tcs_ids().next();
        let active_mask = groups[TcsType::Active.index()].mask();

        info!(
            "{}: {} TCSes of {} available, {} cmds each, solver {}",
            config.name,
            num_tcs,
            max_tcs,
            ncpt,
            if solver_present { "present" } else { "absent" }
        );

        let drv = Controller {
            base: ModuleBase::new(ControllerState {
                groups,
                tcs_in_use: BusyMap::default(),
                in_solver_mode: false,
                stats: RscStats::default(),
            }),
            name: config.name.clone(),
            regs,
            tcs_wait: Condvar::new(),
            cache: WriteBackCache::new(),
            num_tcs,
            ncpt,
            borrow_wake,
            fast_path,
            solver_present,
            irq_line: OnceLock::new(),
        };
        drv.init_conf(Arc::new(config));
        drv.regs.write_irq(RSC_DRV_IRQ_ENABLE, active_mask);
        Ok(Arc::new(drv))
    }

    /// Route the TX-done interrupt of `line` to this controller.
    pub fn attach_irq(self: &Arc<Self>, line: Arc<dyn IrqLine>) {
        let weak: Weak<Controller> = Arc::downgrade(self);
        line.request(Box::new(move || {
            if let Some(drv) = weak.upgrade() {
                drv.handle_irq();
            }
        }));
        if self.irq_line.set(line).is_err() {
            error!("{}: IRQ already attached", self.name);
        }
    }

    pub(crate) fn irq_pending(&self) -> bool {
        self.irq_line.get().map_or(false, |line| line.is_pending())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> &WriteBackCache {
        &self.cache
    }

    pub fn ncpt(&self) -> usize {
        self.ncpt
    }

    pub fn solver_present(&self) -> bool {
        self.solver_present
    }

    /// Group carrying Active-only transfers.
    pub fn active_type(&self) -> TcsType {
        if self.borrow_wake {
            TcsType::Wake
        } else {
            TcsType::Active
        }
    }

    /// Group a request in `state` is scheduled on.
    pub fn group_for(&self, state: RpmhState) -> TcsType {
        match state {
            RpmhState::ActiveOnly => self.active_type(),
            RpmhState::WakeOnly => TcsType::Wake,
            RpmhState::Sleep => TcsType::Sleep,
        }
    }

    /// Global TCS indices of a group.
    pub fn group_range(&self, ty: TcsType) -> std::ops::Range<usize> {
        self.state().groups[ty.index()].tcs_ids()
    }

    pub fn lock(&self) -> ControllerGuard<'_> {
        ControllerGuard {
            drv: self,
            state: self.state(),
        }
    }

    pub fn try_lock(&self) -> Option<ControllerGuard<'_>> {
        self.base_ref()
            .try_lock()
            .map(|state| ControllerGuard { drv: self, state })
    }

    /// Claim a TCS for an Active transfer and trigger it. Blocks while no TCS is free or
    /// another in-flight transfer touches the same addresses.
    ///
    /// Returns the TCS used; the result is delivered through the transfer's sink.
    pub fn send_active(&self, transfer: Transfer) -> Result<usize, RscError> {
        transfer.msg.validate(self.ncpt)?;
        let ty = self.active_type();

        let mut state = self.state();
        if state.groups[ty.index()].num_tcs() == 0 {
            return Err(RscError::NoDevice(ty));
        }
        let tcs_id = loop {
            if state.in_solver_mode {
                return Err(RscError::Busy);
            }
            let group = &state.groups[ty.index()];
            let claimed = group.claim(&state.tcs_in_use, &self.regs, &transfer.msg);
            match claimed {
                Ok(tcs_id) => break tcs_id,
                Err(RscError::Busy) => {
                    state.stats.record_busy_wait();
                    state = self
                        .tcs_wait
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Err(err) => return Err(err),
            }
        };

        state.tcs_in_use.set(tcs_id);
        state.stats.record_active_sent(self.borrow_wake);
        if self.borrow_wake {
            // stale wake commands must not go out with this transfer
            self.regs.write_tcs_reg_sync(RSC_DRV_CMD_ENABLE, tcs_id, 0);
            self.regs.write_tcs_reg_sync(RSC_DRV_CMD_WAIT_FOR_CMPL, tcs_id, 0);
            self.regs.enable_tcs_irq(tcs_id, true);
            self.cache.mark_dirty();
        }
        let msg: TcsRequest = (*transfer.msg).clone();
        state.groups[ty.index()].stash(tcs_id, transfer);
        drop(state);

        self.regs.buffer_write(tcs_id, 0, &msg);
        self.regs.set_trigger(tcs_id, true);
        debug!("TCS trigger: m={} {}", tcs_id, msg);
        Ok(tcs_id)
    }

    /// Stage a sleep or wake request in its group without triggering.
    pub fn write_deferred(&self, msg: &TcsRequest) -> Result<(), RscError> {
        self.lock().write_deferred(msg)
    }

    /// Clear every staged sleep and wake command.
    pub fn invalidate(&self) -> Result<(), RscError> {
        self.lock().invalidate()
    }

    pub fn flush(&self) -> Result<FlushOutcome, RscError> {
        self.lock().flush()
    }

    /// An Active transfer is in flight, or the fast-path TCS is.
    pub fn is_busy(&self) -> bool {
        self.lock().is_busy()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_busy()
    }

    pub fn in_solver_mode(&self) -> bool {
        self.state().in_solver_mode
    }

    /// Enter or leave solver mode. Entering is refused while Active transfers are in flight;
    /// a contended lock is reported as `Busy` too.
    pub fn set_solver_mode(&self, enable: bool) -> Result<(), RscError> {
        let mut guard = self.try_lock().ok_or(RscError::Busy)?;
        if enable && guard.is_busy() {
            return Err(RscError::Busy);
        }
        guard.state.in_solver_mode = enable;
        guard.state.stats.record_solver_toggle();
        info!("{}: solver mode set: {}", self.name, enable);
        Ok(())
    }

    /// Program the fast-path TCS once; later updates only change data.
    pub fn init_fast_path(&self, msg: &TcsRequest) -> Result<(), RscError> {
        let tcs_id = self.fast_path.ok_or(RscError::NoDevice(TcsType::FastPath))?;
        msg.validate(self.ncpt)?;
        // completion is polled through STATUS, not signalled
        self.regs.enable_tcs_irq(tcs_id, false);
        self.regs.buffer_write(tcs_id, 0, msg);
        Ok(())
    }

    /// Rewrite the data of the commands selected by `mask` and trigger the fast-path TCS.
    /// Callers serialize among themselves.
    pub fn update_fast_path(&self, msg: &TcsRequest, mask: u32) -> Result<(), RscError> {
        let tcs_id = self.fast_path.ok_or(RscError::NoDevice(TcsType::FastPath))?;
        msg.validate(self.ncpt)?;

        let mut polls = FAST_PATH_POLLS;
        while self.regs.read_tcs_reg(RSC_DRV_STATUS, tcs_id) == 0 {
            polls -= 1;
            if polls == 0 {
                error!("{}: fast-path TCS is too busy", self.name);
                return Err(RscError::Busy);
            }
            std::thread::sleep(Duration::from_micros(1));
        }

        for (i, cmd) in msg.cmds.iter().enumerate() {
            if mask & (1 << i) != 0 {
                self.regs.write_tcs_cmd(RSC_DRV_CMD_DATA, tcs_id, i, cmd.data);
            }
        }
        self.regs.set_trigger(tcs_id, true);
        self.state().stats.record_fast_path_update();
        Ok(())
    }

    /// Re-arm the Active IRQs, e.g. after the register block lost state.
    pub fn restore_irq(&self) {
        let mask = self.state().groups[TcsType::Active.index()].mask();
        self.regs.write_irq(RSC_DRV_IRQ_ENABLE, mask);
    }

    pub fn stats(&self) -> RscStats {
        self.state().stats.clone()
    }

    fn busy_locked(&self, state: &ControllerState) -> bool {
        let mask = state.groups[self.active_type().index()].mask();
        if state.tcs_in_use.bits() & mask != 0 {
            return true;
        }
        self.fast_path
            .map_or(false, |tcs_id| self.regs.read_tcs_reg(RSC_DRV_STATUS, tcs_id) == 0)
    }
}

impl<'a> ControllerGuard<'a> {
    pub fn controller(&self) -> &'a Controller {
        self.drv
    }

    pub fn is_busy(&self) -> bool {
        self.drv.busy_locked(&self.state)
    }

    pub fn in_solver_mode(&self) -> bool {
        self.state.in_solver_mode
    }

    pub fn tcs_in_use(&self) -> BusyMap {
        self.state.tcs_in_use
    }

    /// Program the write-back cache into the Sleep/Wake TCSes.
    pub fn flush(&mut self) -> Result<FlushOutcome, RscError> {
        let drv = self.drv;
        let outcome = drv.cache.flush(self, drv.conf().invalidate_retries)?;
        self.state.stats.record_flush(outcome == FlushOutcome::Skipped);
        Ok(outcome)
    }
}

impl DeferredTarget for ControllerGuard<'_> {
    fn sleep_wake_busy(&self) -> bool {
        [TcsType::Sleep, TcsType::Wake].iter().any(|ty| {
            let group = &self.state.groups[ty.index()];
            group.tcs_ids().any(|tcs_id| self.state.tcs_in_use.test(tcs_id))
        })
    }

    fn invalidate(&mut self) -> Result<(), RscError> {
        if self.sleep_wake_busy() {
            return Err(RscError::Retry);
        }
        for ty in [TcsType::Sleep, TcsType::Wake] {
            let group = &self.state.groups[ty.index()];
            if group.slots().is_empty() {
                continue;
            }
            for tcs_id in group.tcs_ids() {
                let regs = &self.drv.regs;
                if !regs.write_tcs_reg_sync(RSC_DRV_CMD_ENABLE, tcs_id, 0)
                    || !regs.write_tcs_reg_sync(RSC_DRV_CMD_WAIT_FOR_CMPL, tcs_id, 0)
                {
                    return Err(RscError::Retry);
                }
            }
            self.state.groups[ty.index()].reset();
        }
        self.state.stats.record_invalidate();
        Ok(())
    }

    fn write_deferred(&mut self, msg: &TcsRequest) -> Result<(), RscError> {
        if msg.state.is_active() {
            return Err(RscError::InvalidRequest("active requests cannot be deferred"));
        }
        msg.validate(self.drv.ncpt)?;
        let ty = self.drv.group_for(msg.state);
        let handle = self.state.groups[ty.index()].pack_slots(msg)?;
        self.drv.regs.buffer_write(handle.tcs_id(), handle.cmd_id(), msg);
        self.state.stats.record_deferred_write();
        Ok(())
    }
}
