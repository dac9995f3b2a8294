//! Sleep/wake write-back cache.
//!
//! Sleep and wake votes are not sent when a client makes them. The last vote per address is
//! kept here, together with verbatim sleep/wake batches, and everything is programmed into the
//! Sleep and Wake TCSes in one go by [`WriteBackCache::flush`] when the last CPU goes down.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use serde::Serialize;

use crate::rsc::error::RscError;
use crate::rsc::types::{RpmhState, TcsCmd, TcsRequest};

/// Value of a cache slot no client has voted for yet.
pub const UNSET: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub addr: u32,
    pub sleep_val: u32,
    pub wake_val: u32,
}

impl CacheEntry {
    fn new(addr: u32) -> Self {
        Self {
            addr,
            sleep_val: UNSET,
            wake_val: UNSET,
        }
    }

    /// Whether the entry carries a sleep/wake transition worth programming.
    pub fn needs_flush(&self) -> bool {
        self.sleep_val != UNSET && self.wake_val != UNSET && self.sleep_val != self.wake_val
    }
}

/// Where a flush lands: the Sleep/Wake TCS groups of a locked controller.
pub trait DeferredTarget {
    /// A Sleep/Wake TCS carries an Active transfer; only its completion can free it.
    fn sleep_wake_busy(&self) -> bool;
    fn invalidate(&mut self) -> Result<(), RscError>;
    fn write_deferred(&mut self, msg: &TcsRequest) -> Result<(), RscError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since the last flush.
    Skipped,
    Flushed { writes: usize },
}

#[derive(Debug, Default)]
struct CacheState {
    /// In first-write order; flush walks it in this order.
    entries: Vec<CacheEntry>,
    index: HashMap<u32, usize>,
    batches: Vec<Vec<TcsRequest>>,
    dirty: bool,
}

impl CacheState {
    fn entry_mut(&mut self, addr: u32) -> &mut CacheEntry {
        let entries = &mut self.entries;
        let idx = *self.index.entry(addr).or_insert_with(|| {
            entries.push(CacheEntry::new(addr));
            entries.len() - 1
        });
        &mut self.entries[idx]
    }
}

#[derive(Debug, Default)]
pub struct WriteBackCache {
    state: Mutex<CacheState>,
}

impl WriteBackCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember the latest vote for `addr`. Returns whether the stored pair changed.
    ///
    /// An active vote is mirrored into the wake slot only when a sleep vote exists, so that
    /// waking up does not restore a stale wake value.
    pub fn record(&self, addr: u32, state: RpmhState, value: u32) -> bool {
        let mut cache = self.lock();
        let entry = cache.entry_mut(addr);
        let old = *entry;
        match state {
            RpmhState::ActiveOnly => {
                if entry.sleep_val != UNSET {
                    entry.wake_val = value;
                }
            }
            RpmhState::WakeOnly => entry.wake_val = value,
            RpmhState::Sleep => entry.sleep_val = value,
        }
        let changed = *entry != old;
        cache.dirty |= changed;
        changed
    }

    pub fn record_request(&self, msg: &TcsRequest) {
        for cmd in msg.cmds.iter() {
            self.record(cmd.addr, msg.state, cmd.data);
        }
    }

    /// Queue a sleep/wake batch for verbatim replay on the next flush.
    pub fn append_batch(&self, batch: Vec<TcsRequest>) {
        debug_assert!(batch.iter().all(|req| !req.state.is_active()));
        let mut cache = self.lock();
        cache.batches.push(batch);
        cache.dirty = true;
    }

    /// Drop queued batches and force the next flush to reprogram everything.
    pub fn invalidate(&self) {
        let mut cache = self.lock();
        cache.batches.clear();
        cache.dirty = true;
    }

    /// Hardware copy is known stale; reprogram on the next flush.
    pub fn mark_dirty(&self) {
        self.lock().dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn entry(&self, addr: u32) -> Option<CacheEntry> {
        let cache = self.lock();
        cache.index.get(&addr).map(|&idx| cache.entries[idx])
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_count(&self) -> usize {
        self.lock().batches.len()
    }

    /// Program the cached state into `target`.
    ///
    /// Must only run with the controller otherwise quiet: the Sleep/Wake TCSes are invalidated
    /// first and rewritten from scratch. On error the cache stays dirty.
    pub fn flush(
        &self,
        target: &mut dyn DeferredTarget,
        invalidate_retries: usize,
    ) -> Result<FlushOutcome, RscError> {
        let mut cache = self.lock();
        if !cache.dirty {
            debug!("skipping flush, TCSes hold the latest data");
            return Ok(FlushOutcome::Skipped);
        }

        if target.sleep_wake_busy() {
            debug!("flush: a sleep/wake TCS is still in flight");
            return Err(RscError::Retry);
        }
        // register read-back may need a few tries
        let mut attempt = 0;
        loop {
            match target.invalidate() {
                Ok(()) => break,
                Err(RscError::Retry) if attempt < invalidate_retries => {
                    attempt += 1;
                    std::hint::spin_loop();
                }
                Err(err) => {
                    warn!("flush: invalidate failed after {} attempts: {}", attempt + 1, err);
                    return Err(err);
                }
            }
        }

        let mut writes = 0;
        for req in cache.batches.iter().flatten() {
            target.write_deferred(req)?;
            writes += 1;
        }

        for entry in cache.entries.iter().filter(|entry| entry.needs_flush()) {
            // wake sets are always complete, sleep sets are not
            let sleep_cmd = TcsCmd::new(entry.addr, entry.sleep_val);
            let sleep = TcsRequest::new(RpmhState::Sleep, &[sleep_cmd]);
            target.write_deferred(&sleep)?;
            let wake_cmd = TcsCmd::new(entry.addr, entry.wake_val);
            let wake = TcsRequest::new(RpmhState::WakeOnly, &[wake_cmd]).wait_for_compl(true);
            target.write_deferred(&wake)?;
            writes += 2;
        }

        cache.dirty = false;
        debug!("flushed {} sleep/wake requests", writes);
        Ok(FlushOutcome::Flushed { writes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        invalidates: usize,
        busy_invalidates: usize,
        in_flight: bool,
        writes: Vec<TcsRequest>,
        fail_after: Option<usize>,
    }

    impl DeferredTarget for Recorder {
        fn sleep_wake_busy(&self) -> bool {
            self.in_flight
        }

        fn invalidate(&mut self) -> Result<(), RscError> {
            if self.busy_invalidates > 0 {
                self.busy_invalidates -= 1;
                return Err(RscError::Retry);
            }
            self.invalidates += 1;
            Ok(())
        }

        fn write_deferred(&mut self, msg: &TcsRequest) -> Result<(), RscError> {
            if self.fail_after == Some(self.writes.len()) {
                let group = crate::rsc::types::TcsType::Sleep;
                return Err(RscError::OutOfSpace { group, needed: 1 });
            }
            self.writes.push(msg.clone());
            Ok(())
        }
    }

    #[test]
    fn equal_sleep_and_wake_is_not_written() {
        let cache = WriteBackCache::new();
        cache.record(0x1000, RpmhState::Sleep, 5);
        cache.record(0x1000, RpmhState::WakeOnly, 5);
        assert!(cache.is_dirty());

        let mut hw = Recorder::default();
        assert_eq!(FlushOutcome::Flushed { writes: 0 }, cache.flush(&mut hw, 0).unwrap());
        assert_eq!(1, hw.invalidates);
        assert!(hw.writes.is_empty());
        assert!(!cache.is_dirty());
    }

    #[test]
    fn flush_writes_sleep_then_waited_wake() {
        let cache = WriteBackCache::new();
        cache.record(0x2000, RpmhState::Sleep, 0);
        cache.record(0x2000, RpmhState::WakeOnly, 3);
        let mut hw = Recorder::default();
        cache.flush(&mut hw, 0).unwrap();

        assert_eq!(2, hw.writes.len());
        assert_eq!(RpmhState::Sleep, hw.writes[0].state);
        assert!(!hw.writes[0].wait_for_compl);
        assert_eq!(RpmhState::WakeOnly, hw.writes[1].state);
        assert!(hw.writes[1].wait_for_compl);
        assert_eq!(3, hw.writes[1].cmds[0].data);
    }

    #[test]
    fn unset_half_is_skipped() {
        let cache = WriteBackCache::new();
        cache.record(0x3000, RpmhState::Sleep, 1);
        let mut hw = Recorder::default();
        cache.flush(&mut hw, 0).unwrap();
        assert!(hw.writes.is_empty());
    }

    #[test]
    fn clean_cache_skips_flush() {
        let cache = WriteBackCache::new();
        let mut hw = Recorder::default();
        assert_eq!(FlushOutcome::Skipped, cache.flush(&mut hw, 0).unwrap());
        assert_eq!(0, hw.invalidates);
    }

    #[test]
    fn repeated_vote_does_not_dirty() {
        let cache = WriteBackCache::new();
        assert!(cache.record(0x10, RpmhState::Sleep, 7));
        cache.flush(&mut Recorder::default(), 0).unwrap();
        assert!(!cache.record(0x10, RpmhState::Sleep, 7));
        assert!(!cache.is_dirty());
    }

    #[test]
    fn active_vote_mirrors_into_wake_only_with_sleep_vote() {
        let cache = WriteBackCache::new();
        cache.record(0x20, RpmhState::ActiveOnly, 4);
        assert_eq!(UNSET, cache.entry(0x20).unwrap().wake_val);

        cache.record(0x20, RpmhState::Sleep, 1);
        cache.record(0x20, RpmhState::ActiveOnly, 4);
        let entry = cache.entry(0x20).unwrap();
        assert_eq!((1, 4), (entry.sleep_val, entry.wake_val));
    }

    #[test]
    fn batches_replay_verbatim_before_entries() {
        let cache = WriteBackCache::new();
        cache.record(0x40, RpmhState::Sleep, 0);
        cache.record(0x40, RpmhState::WakeOnly, 1);
        cache.append_batch(vec![
            TcsRequest::single(RpmhState::Sleep, 0x50, 1),
            TcsRequest::single(RpmhState::Sleep, 0x50, 2),
        ]);

        let mut hw = Recorder::default();
        assert_eq!(FlushOutcome::Flushed { writes: 4 }, cache.flush(&mut hw, 0).unwrap());
        let data: Vec<_> = hw.writes.iter().map(|w| (w.cmds[0].addr, w.cmds[0].data)).collect();
        assert_eq!(vec![(0x50, 1), (0x50, 2), (0x40, 0), (0x40, 1)], data);
        // batches are kept for the next cycle
        assert_eq!(1, cache.batch_count());
    }

    #[test]
    fn invalidate_drops_batches_and_dirties() {
        let cache = WriteBackCache::new();
        cache.append_batch(vec![TcsRequest::single(RpmhState::WakeOnly, 0x60, 1)]);
        cache.flush(&mut Recorder::default(), 0).unwrap();
        cache.invalidate();
        assert_eq!(0, cache.batch_count());
        assert!(cache.is_dirty());
    }

    #[test]
    fn invalidate_is_retried() {
        let cache = WriteBackCache::new();
        cache.invalidate();
        let mut hw = Recorder { busy_invalidates: 3, ..Default::default() };
        assert!(cache.flush(&mut hw, 2).is_err());
        assert!(cache.is_dirty());

        let mut hw = Recorder { busy_invalidates: 3, ..Default::default() };
        assert!(cache.flush(&mut hw, 3).is_ok());
        assert_eq!(1, hw.invalidates);
    }

    #[test]
    fn in_flight_sleep_wake_tcs_fails_fast() {
        let cache = WriteBackCache::new();
        cache.invalidate();
        let mut hw = Recorder { in_flight: true, busy_invalidates: 1, ..Default::default() };
        assert_eq!(Err(RscError::Retry), cache.flush(&mut hw, 100));
        // invalidate was never attempted
        assert_eq!(1, hw.busy_invalidates);
        assert!(cache.is_dirty());
    }

    #[test]
    fn failed_write_keeps_cache_dirty() {
        let cache = WriteBackCache::new();
        cache.record(0x70, RpmhState::Sleep, 0);
        cache.record(0x70, RpmhState::WakeOnly, 9);
        let mut hw = Recorder { fail_after: Some(1), ..Default::default() };
        assert!(cache.flush(&mut hw, 0).is_err());
        assert!(cache.is_dirty());
    }
}
