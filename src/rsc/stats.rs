use serde::Serialize;

/// Per-controller counters, reported by the simulator summary.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RscStats {
    pub active_sent: u64,
    /// Active transfers carried by a borrowed Wake TCS.
    pub borrowed_wake: u64,
    pub completed: u64,
    pub faults: u64,
    /// Times a `send_active` caller parked waiting for a TCS.
    pub busy_waits: u64,
    pub deferred_writes: u64,
    pub invalidates: u64,
    pub flushes: u64,
    pub flushes_skipped: u64,
    pub solver_toggles: u64,
    pub fast_path_updates: u64,
}

impl RscStats {
    pub fn record_active_sent(&mut self, borrowed: bool) {
        self.active_sent = self.active_sent.saturating_add(1);
        if borrowed {
            self.borrowed_wake = self.borrowed_wake.saturating_add(1);
        }
    }

    pub fn record_completed(&mut self, fault: bool) {
        self.completed = self.completed.saturating_add(1);
        if fault {
            self.faults = self.faults.saturating_add(1);
        }
    }

    pub fn record_busy_wait(&mut self) {
        self.busy_waits = self.busy_waits.saturating_add(1);
    }

    pub fn record_deferred_write(&mut self) {
        self.deferred_writes = self.deferred_writes.saturating_add(1);
    }

    pub fn record_invalidate(&mut self) {
        self.invalidates = self.invalidates.saturating_add(1);
    }

    pub fn record_flush(&mut self, skipped: bool) {
        if skipped {
            self.flushes_skipped = self.flushes_skipped.saturating_add(1);
        } else {
            self.flushes = self.flushes.saturating_add(1);
        }
    }

    pub fn record_solver_toggle(&mut self) {
        self.solver_toggles = self.solver_toggles.saturating_add(1);
    }

    pub fn record_fast_path_update(&mut self) {
        self.fast_path_updates = self.fast_path_updates.saturating_add(1);
    }

    /// Active transfers triggered but not yet retired.
    pub fn in_flight(&self) -> u64 {
        self.active_sent.saturating_sub(self.completed)
    }
}
