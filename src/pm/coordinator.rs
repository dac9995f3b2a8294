//! Deciding who flushes the sleep/wake cache when CPUs power down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::registry::RscRegistry;
use crate::rpmh::cache::FlushOutcome;
use crate::rsc::controller::Controller;
use crate::rsc::error::RscError;

/// Name of the controller the system-suspend hook flushes.
pub const APPS_RSC: &str = "apps_rsc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPmEvent {
    Enter,
    EnterFailed,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmVerdict {
    Ok,
    /// Abort this low-power entry.
    Veto,
    /// Not handled by this controller.
    Done,
}

/// Last-CPU-down flush for one controller.
///
/// Each CPU entering low power bumps a counter; the one that brings it to the online count
/// flushes. That guess is re-checked under the controller lock, which any CPU waking up and
/// sending an Active vote also needs.
pub struct CpuPmCoordinator {
    drv: Arc<Controller>,
    cpus_in_pm: AtomicUsize,
    online_cpus: usize,
}

impl CpuPmCoordinator {
    pub fn new(drv: Arc<Controller>, online_cpus: usize) -> Self {
        Self {
            drv,
            cpus_in_pm: AtomicUsize::new(0),
            online_cpus,
        }
    }

    pub fn cpus_in_pm(&self) -> usize {
        self.cpus_in_pm.load(Ordering::SeqCst)
    }

    fn online(&self) -> usize {
        self.online_cpus
    }

    fn leave(&self) {
        let _ = self
            .cpus_in_pm
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn notify(&self, event: CpuPmEvent) -> PmVerdict {
        // the hardware solver stages sleep/wake itself
        if self.drv.solver_present() {
            return PmVerdict::Done;
        }

        let cpus_in_pm = match event {
            CpuPmEvent::Enter => self.cpus_in_pm.fetch_add(1, Ordering::SeqCst) + 1,
            CpuPmEvent::EnterFailed | CpuPmEvent::Exit => {
                self.leave();
                return PmVerdict::Ok;
            }
        };
        if cpus_in_pm < self.online() {
            return PmVerdict::Ok;
        }

        let verdict = match self.drv.try_lock() {
            // another CPU is up and using the controller
            None => return PmVerdict::Ok,
            Some(mut guard) => {
                if self.cpus_in_pm() < self.online() {
                    debug!("{}: a CPU woke up, not flushing", self.drv.name());
                    return PmVerdict::Ok;
                }
                if guard.in_solver_mode() {
                    return PmVerdict::Ok;
                }
                if guard.is_busy() {
                    PmVerdict::Veto
                } else {
                    match guard.flush() {
                        Ok(_) => PmVerdict::Ok,
                        Err(err) => {
                            warn!("{}: last CPU flush failed: {}", self.drv.name(), err);
                            PmVerdict::Veto
                        }
                    }
                }
            }
        };

        if verdict == PmVerdict::Veto {
            if cpus_in_pm < self.online() {
                return PmVerdict::Ok;
            }
            // no EnterFailed follows a veto
            self.leave();
        }
        verdict
    }
}

/// Power-domain pre-off: the domain is going down, so flush or refuse. Domain transitions are
/// serialized, so no CPU counting.
pub fn power_domain_pre_off(drv: &Controller) -> PmVerdict {
    let mut guard = drv.lock();
    if guard.is_busy() {
        return PmVerdict::Veto;
    }
    match guard.flush() {
        Ok(_) => PmVerdict::Ok,
        Err(err) => {
            warn!("{}: pre-off flush failed: {}", drv.name(), err);
            PmVerdict::Veto
        }
    }
}

/// System suspend: flush the application processor's controller, if there is one.
pub fn syscore_suspend(registry: &RscRegistry) -> Result<(), RscError> {
    let Some(drv) = registry.get(APPS_RSC) else {
        return Ok(());
    };
    let mut guard = drv.lock();
    if guard.is_busy() {
        return Err(RscError::Retry);
    }
    let outcome = guard.flush()?;
    if let FlushOutcome::Flushed { writes } = outcome {
        info!("{}: suspend flush wrote {} requests", drv.name(), writes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsc::completion::Transfer;
    use crate::rsc::config::RscConfig;
    use crate::rsc::types::{RpmhState, TcsRequest};
    use crate::sim::hw::{SimHwConfig, SimRsc};

    fn bring_up(hw: SimHwConfig) -> (Arc<SimRsc>, Arc<Controller>) {
        let conf = RscConfig::default();
        let sim = SimRsc::new(conf.tcs_offset, conf.drv_id, hw);
        let drv = Controller::probe(conf, sim.clone()).unwrap();
        drv.attach_irq(sim.clone());
        (sim, drv)
    }

    fn dirty(drv: &Controller) {
        drv.cache().record(0x30000, RpmhState::Sleep, 0);
        drv.cache().record(0x30000, RpmhState::WakeOnly, 1);
    }

    #[test]
    fn only_last_cpu_flushes() {
        let (_sim, drv) = bring_up(SimHwConfig::manual());
        dirty(&drv);
        let pm = CpuPmCoordinator::new(drv.clone(), 3);
        assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
        assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
        assert!(drv.cache().is_dirty());
        assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
        assert!(!drv.cache().is_dirty());
        assert_eq!(3, pm.cpus_in_pm());

        pm.notify(CpuPmEvent::Exit);
        pm.notify(CpuPmEvent::EnterFailed);
        assert_eq!(1, pm.cpus_in_pm());
    }

    #[test]
    fn busy_controller_vetoes() {
        let (sim, drv) = bring_up(SimHwConfig::manual());
        dirty(&drv);
        let msg = TcsRequest::single(RpmhState::ActiveOnly, 0x100, 1);
        drv.send_active(Transfer::fire_and_forget(msg)).unwrap();

        let pm = CpuPmCoordinator::new(drv.clone(), 1);
        assert_eq!(PmVerdict::Veto, pm.notify(CpuPmEvent::Enter));
        assert_eq!(0, pm.cpus_in_pm());
        assert!(drv.cache().is_dirty());

        sim.complete(0);
        assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
        assert!(!drv.cache().is_dirty());
    }

    #[test]
    fn contended_lock_means_another_cpu_is_up() {
        let (_sim, drv) = bring_up(SimHwConfig::manual());
        dirty(&drv);
        let pm = CpuPmCoordinator::new(drv.clone(), 1);
        let guard = drv.lock();
        assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
        drop(guard);
        assert!(drv.cache().is_dirty());
    }

    #[test]
    fn solver_mode_skips_flush() {
        let (_sim, drv) = bring_up(SimHwConfig::manual());
        dirty(&drv);
        drv.set_solver_mode(true).unwrap();
        let pm = CpuPmCoordinator::new(drv.clone(), 1);
        assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
        assert!(drv.cache().is_dirty());
    }

    #[test]
    fn hardware_solver_opts_out() {
        let (_sim, drv) = bring_up(SimHwConfig { hw_solver: true, ..SimHwConfig::manual() });
        let pm = CpuPmCoordinator::new(drv, 1);
        assert_eq!(PmVerdict::Done, pm.notify(CpuPmEvent::Enter));
        assert_eq!(0, pm.cpus_in_pm());
    }

    #[test]
    fn pre_off_flushes_or_vetoes() {
        let (sim, drv) = bring_up(SimHwConfig::manual());
        dirty(&drv);
        let msg = TcsRequest::single(RpmhState::ActiveOnly, 0x100, 1);
        drv.send_active(Transfer::fire_and_forget(msg)).unwrap();
        assert_eq!(PmVerdict::Veto, power_domain_pre_off(&drv));
        sim.complete(0);
        assert_eq!(PmVerdict::Ok, power_domain_pre_off(&drv));
        assert!(!drv.cache().is_dirty());
    }

    #[test]
    fn syscore_suspend_targets_apps_rsc() {
        let mut registry = RscRegistry::new();
        assert_eq!(Ok(()), syscore_suspend(&registry));

        let (sim, drv) = bring_up(SimHwConfig::manual());
        dirty(&drv);
        registry.register(drv.clone()).unwrap();
        let msg = TcsRequest::single(RpmhState::ActiveOnly, 0x100, 1);
        drv.send_active(Transfer::fire_and_forget(msg)).unwrap();
        assert_eq!(Err(RscError::Retry), syscore_suspend(&registry));
        sim.complete(0);
        assert_eq!(Ok(()), syscore_suspend(&registry));
        assert!(!drv.cache().is_dirty());
    }
}
