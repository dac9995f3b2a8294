//! Completion interrupt bridge.

use log::{debug, error, warn};

use crate::base::module::IsModule;
use crate::rsc::completion::{Transfer, TransferResult};
use crate::rsc::controller::Controller;
use crate::rsc::error::RscError;
use crate::rsc::regs::*;

pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// The interrupt line a controller's TX-done IRQ arrives on.
pub trait IrqLine: Send + Sync {
    /// Install the handler. Called once, at attach time.
    fn request(&self, handler: IrqHandler);

    /// Whether an interrupt is raised but not yet handled.
    fn is_pending(&self) -> bool {
        false
    }
}

impl Controller {
    /// TX-done handler: retire every TCS flagged in IRQ_STATUS and wake its waiters.
    ///
    /// Never blocks on anything but the controller lock, so a parked `send_active` can
    /// re-claim the freed TCS as soon as this returns.
    pub fn handle_irq(&self) {
        let irq_status = self.regs.read_irq(RSC_DRV_IRQ_STATUS);

        for tcs_id in (0..MAX_TCS_NR).filter(|i| irq_status & (1 << i) != 0) {
            let (transfer, result) = {
                let mut state = self.state();
                let ty = self.active_type();
                let transfer = state.groups[ty.index()].take(tcs_id);
                let result = match &transfer {
                    Some(transfer) => {
                        debug!("IRQ response: m={} {}", tcs_id, *transfer.msg);
                        self.check_cmd_status(tcs_id, transfer)
                    }
                    None => {
                        warn!("TCS {} done without a request in flight", tcs_id);
                        Ok(())
                    }
                };

                // a borrowed wake TCS would otherwise re-fire on the next sleep entry
                if self.borrow_wake {
                    self.regs.set_trigger(tcs_id, false);
                }

                self.regs.write_tcs_reg(RSC_DRV_CMD_ENABLE, tcs_id, 0);
                self.regs.write_irq(RSC_DRV_IRQ_CLEAR, 1 << tcs_id);
                let control = self.regs.read_tcs_reg(RSC_DRV_CONTROL, tcs_id);
                self.regs
                    .write_tcs_reg(RSC_DRV_CONTROL, tcs_id, control & !TCS_AMC_MODE_TRIGGER);

                state.tcs_in_use.clear(tcs_id);
                if self.borrow_wake {
                    // do not get spammed by the solver's own wake votes
                    self.regs.enable_tcs_irq(tcs_id, false);
                }
                if transfer.is_some() {
                    state.stats.record_completed(result.is_err());
                }
                (transfer, result)
            };

            self.tcs_wait.notify_all();
            if let Some(transfer) = transfer {
                transfer.complete(result);
            }
        }
    }

    fn check_cmd_status(&self, tcs_id: usize, transfer: &Transfer) -> TransferResult {
        let mut result = Ok(());
        for (j, cmd) in transfer.msg.cmds.iter().enumerate() {
            let status = self.regs.read_tcs_cmd(RSC_DRV_CMD_STATUS, tcs_id, j);
            let issued = status & CMD_STATUS_ISSUED != 0;
            let completed = status & CMD_STATUS_COMPL != 0;
            if !issued || (transfer.msg.response_required(j) && !completed) {
                error!(
                    "incomplete request: m={} n={} addr={:#x} data={:#x} status={:#x}",
                    tcs_id, j, cmd.addr, cmd.data, status
                );
                if result.is_ok() {
                    result = Err(RscError::HardwareFault {
                        tcs_id,
                        cmd_id: j,
                        addr: cmd.addr,
                        status,
                    });
                }
            }
        }
        result
    }
}
