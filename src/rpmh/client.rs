use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;

use crate::base::behavior::Parameterizable;
use crate::rpmh::cache::FlushOutcome;
use crate::rsc::completion::{Completion, CompletionSink, RequestRef, Transfer, TransferResult};
use crate::rsc::controller::Controller;
use crate::rsc::error::RscError;
use crate::rsc::types::{RpmhState, TcsCmd, TcsRequest};

/// Client handle for voting resource state through one controller.
#[derive(Clone)]
pub struct RpmhClient {
    drv: Arc<Controller>,
}

impl RpmhClient {
    pub fn new(drv: Arc<Controller>) -> Self {
        Self { drv }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.drv
    }

    fn standalone(&self) -> bool {
        self.drv.conf().standalone
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.drv.conf().sync_timeout_ms)
    }

    /// Vote without waiting. Active votes are sent right away; sleep and wake votes are cached
    /// for the next flush and succeed immediately.
    pub fn write_async(&self, state: RpmhState, cmds: &[TcsCmd]) -> Result<(), RscError> {
        if self.standalone() {
            return Ok(());
        }
        let msg = TcsRequest::new(state, cmds);
        msg.validate(self.drv.ncpt())?;
        self.drv.cache().record_request(&msg);
        if state.is_active() {
            self.drv.send_active(Transfer::fire_and_forget(msg))?;
        }
        Ok(())
    }

    /// Vote and, for active votes, wait until hardware acknowledged every command.
    pub fn write_sync(&self, state: RpmhState, cmds: &[TcsCmd]) -> Result<(), RscError> {
        if self.standalone() {
            return Ok(());
        }
        let msg = Arc::new(TcsRequest::new(state, cmds).wait_for_compl(true));
        msg.validate(self.drv.ncpt())?;
        self.drv.cache().record_request(&msg);
        if !state.is_active() {
            return Ok(());
        }

        let done = Completion::new();
        self.drv.send_active(Transfer::waited(msg, Arc::clone(&done)))?;
        let timeout = self.timeout();
        match done.wait_timeout(timeout) {
            Some(result) => result,
            None => self.hung(Some(&done), timeout),
        }
    }

    fn hung(&self, done: Option<&Completion>, timeout: Duration) -> TransferResult {
        error!("{}: no response within {:?}", self.drv.name(), timeout);
        let snapshot = self.drv.debug_dump(done);
        if self.drv.conf().panic_on_hang && !snapshot.busy.is_empty() {
            panic!("{}: TCSes {:?} never retired", self.drv.name(), snapshot.busy);
        }
        Err(RscError::Timeout(timeout))
    }

    /// Several requests as one transaction.
    ///
    /// Sleep and wake batches are queued and replayed verbatim on flush. Active batches are
    /// sent together and waited for under one timeout; any failed request fails the batch, but
    /// every request that went out is still waited for.
    pub fn write_batch(&self, state: RpmhState, batch: &[Vec<TcsCmd>]) -> Result<(), RscError> {
        if batch.is_empty() {
            return Err(RscError::InvalidRequest("empty batch"));
        }
        if self.standalone() {
            return Ok(());
        }
        let reqs: Vec<TcsRequest> = batch
            .iter()
            .map(|cmds| TcsRequest::new(state, cmds).wait_for_compl(state.is_active()))
            .collect();
        for req in reqs.iter() {
            req.validate(self.drv.ncpt())?;
        }
        if !state.is_active() {
            self.drv.cache().append_batch(reqs);
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let mut submitted = 0;
        let mut submit_err = None;
        for (tag, req) in reqs.into_iter().enumerate() {
            let sink = CompletionSink::Channel { tag, tx: tx.clone() };
            let transfer = Transfer::new(RequestRef::Owned(Box::new(req)), sink);
            if let Err(err) = self.drv.send_active(transfer) {
                error!("{}: batch request {} not sent: {}", self.drv.name(), tag, err);
                submit_err = Some(err);
                break;
            }
            submitted += 1;
        }
        drop(tx);

        let timeout = self.timeout();
        let deadline = Instant::now() + timeout;
        let mut results: Vec<Option<TransferResult>> = vec![None; submitted];
        for _ in 0..submitted {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok((tag, result)) => results[tag] = Some(result),
                Err(RecvTimeoutError::Timeout) => return self.hung(None, timeout),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(err) = submit_err {
            return Err(err);
        }
        match results.into_iter().flatten().find_map(Result::err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Program cached sleep/wake state into hardware. Only safe with every other CPU quiet.
    pub fn flush(&self) -> Result<FlushOutcome, RscError> {
        if self.standalone() {
            return Ok(FlushOutcome::Skipped);
        }
        self.drv.flush()
    }

    /// Forget queued batches and reprogram everything on the next flush.
    pub fn invalidate(&self) -> Result<(), RscError> {
        if !self.standalone() {
            self.drv.cache().invalidate();
        }
        Ok(())
    }

    pub fn mode_solver_set(&self, enable: bool) -> Result<(), RscError> {
        if self.standalone() {
            return Ok(());
        }
        self.drv.set_solver_mode(enable)
    }

    pub fn ctrlr_idle(&self) -> bool {
        self.standalone() || self.drv.is_idle()
    }

    pub fn init_fast_path(&self, cmds: &[TcsCmd]) -> Result<(), RscError> {
        if self.standalone() {
            return Ok(());
        }
        self.drv
            .init_fast_path(&TcsRequest::new(RpmhState::ActiveOnly, cmds))
    }

    pub fn update_fast_path(&self, cmds: &[TcsCmd], mask: u32) -> Result<(), RscError> {
        if self.standalone() {
            return Ok(());
        }
        self.drv
            .update_fast_path(&TcsRequest::new(RpmhState::ActiveOnly, cmds), mask)
    }
}
