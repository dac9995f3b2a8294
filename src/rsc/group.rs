use std::ops::Range;

use crate::base::behavior::ModuleBehaviors;
use crate::rsc::completion::Transfer;
use crate::rsc::error::RscError;
use crate::rsc::regs::{RscRegs, MAX_TCS_NR};
use crate::rsc::types::{TcsRequest, TcsType};

/// Bitmap of physical TCS indices, one bit per TCS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusyMap(u32);

impl BusyMap {
    pub fn test(&self, tcs_id: usize) -> bool {
        self.0 & (1 << tcs_id) != 0
    }

    pub fn set(&mut self, tcs_id: usize) {
        debug_assert!(tcs_id < MAX_TCS_NR);
        self.0 |= 1 << tcs_id;
    }

    pub fn clear(&mut self, tcs_id: usize) {
        self.0 &= !(1 << tcs_id);
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..32).filter(move |i| bits & (1 << i) != 0)
    }
}

/// Location of a packed sleep/wake request: a physical TCS and the first command slot in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    tcs_id: usize,
    cmd_id: usize,
}

impl SlotHandle {
    pub fn tcs_id(&self) -> usize {
        self.tcs_id
    }

    pub fn cmd_id(&self) -> usize {
        self.cmd_id
    }
}

/// First-fit allocator over the `num_tcs * ncpt` command slots of a group.
///
/// A run never straddles two TCSes. Slots are only returned wholesale, by [`SlotArena::clear`].
#[derive(Debug, Clone)]
pub struct SlotArena {
    num_tcs: usize,
    ncpt: usize,
    used: u64,
}

impl SlotArena {
    pub fn new(num_tcs: usize, ncpt: usize) -> Self {
        assert!(num_tcs * ncpt <= 64, "slot bitmap overflow");
        Self { num_tcs, ncpt, used: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn used(&self) -> usize {
        self.used.count_ones() as usize
    }

    fn is_free(&self, slot: usize) -> bool {
        self.used & (1 << slot) == 0
    }

    /// Reserve `n` adjacent slots inside one TCS; returns (tcs index within group, cmd index).
    pub fn alloc(&mut self, n: usize) -> Option<(usize, usize)> {
        if n == 0 || n > self.ncpt {
            return None;
        }
        for tcs in 0..self.num_tcs {
            let first = tcs * self.ncpt;
            let last_start = first + self.ncpt - n;
            let start = (first..=last_start)
                .find(|&start| (start..start + n).all(|slot| self.is_free(slot)));
            if let Some(start) = start {
                for slot in start..start + n {
                    self.used |= 1 << slot;
                }
                return Some((tcs, start - first));
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

/// One typed pool of physical TCSes.
#[derive(Debug)]
pub struct TcsGroup {
    ty: TcsType,
    mask: u32,
    offset: usize,
    num_tcs: usize,
    ncpt: usize,
    /// In-flight request per TCS of the group (Active-class use only).
    reqs: Vec<Option<Transfer>>,
    /// Sleep/wake command slots handed out since the last invalidate.
    slots: SlotArena,
}

impl TcsGroup {
    /// A group with `num_tcs` TCSes starting at global index `offset`. Groups without a slot
    /// mask (Control) are described with `mapped == false`.
    pub fn new(ty: TcsType, offset: usize, num_tcs: usize, ncpt: usize, mapped: bool) -> Self {
        let mask = if mapped && num_tcs > 0 {
            ((1u32 << num_tcs) - 1) << offset
        } else {
            0
        };
        Self {
            ty,
            mask,
            offset,
            num_tcs,
            ncpt,
            reqs: (0..num_tcs).map(|_| None).collect(),
            slots: SlotArena::new(num_tcs, ncpt),
        }
    }

    pub fn ty(&self) -> TcsType {
        self.ty
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn num_tcs(&self) -> usize {
        self.num_tcs
    }

    pub fn ncpt(&self) -> usize {
        self.ncpt
    }

    pub fn contains(&self, tcs_id: usize) -> bool {
        tcs_id < 32 && self.mask & (1 << tcs_id) != 0
    }

    /// Global TCS indices owned by this group.
    pub fn tcs_ids(&self) -> Range<usize> {
        if self.mask == 0 {
            return 0..0;
        }
        self.offset..self.offset + self.num_tcs
    }

    pub fn slots(&self) -> &SlotArena {
        &self.slots
    }

    /// First TCS of the group not claimed in `busy`.
    pub fn find_free_slot(&self, busy: &BusyMap) -> Option<usize> {
        self.tcs_ids().find(|&tcs_id| !busy.test(tcs_id))
    }

    /// Fail with `Busy` if a claimed TCS of the group is sending to an address `msg` touches.
    ///
    /// Both the stashed request and the addresses enabled in hardware are checked: the former
    /// covers a TCS claimed but not yet programmed.
    pub fn check_conflict(
        &self,
        busy: &BusyMap,
        regs: &RscRegs,
        msg: &TcsRequest,
    ) -> Result<(), RscError> {
        for tcs_id in self.tcs_ids().filter(|&id| busy.test(id)) {
            if let Some(inflight) = &self.reqs[tcs_id - self.offset] {
                if inflight.msg.cmds.iter().any(|cmd| msg.touches(cmd.addr)) {
                    return Err(RscError::Busy);
                }
            }
            if regs.enabled_addrs(tcs_id).any(|addr| msg.touches(addr)) {
                return Err(RscError::Busy);
            }
        }
        Ok(())
    }

    /// Conflict check plus free-TCS scan. Caller holds the controller lock.
    pub fn claim(
        &self,
        busy: &BusyMap,
        regs: &RscRegs,
        msg: &TcsRequest,
    ) -> Result<usize, RscError> {
        self.check_conflict(busy, regs, msg)?;
        self.find_free_slot(busy).ok_or(RscError::Busy)
    }

    /// Reserve command slots for a sleep/wake request.
    pub fn pack_slots(&mut self, msg: &TcsRequest) -> Result<SlotHandle, RscError> {
        let (tcs, cmd_id) = self.slots.alloc(msg.len()).ok_or(RscError::OutOfSpace {
            group: self.ty,
            needed: msg.len(),
        })?;
        Ok(SlotHandle {
            tcs_id: self.offset + tcs,
            cmd_id,
        })
    }

    pub fn stash(&mut self, tcs_id: usize, transfer: Transfer) {
        debug_assert!(self.reqs[tcs_id - self.offset].is_none(), "TCS {} already owned", tcs_id);
        self.reqs[tcs_id - self.offset] = Some(transfer);
    }

    pub fn take(&mut self, tcs_id: usize) -> Option<Transfer> {
        self.reqs.get_mut(tcs_id.checked_sub(self.offset)?)?.take()
    }

    pub fn request(&self, tcs_id: usize) -> Option<&Transfer> {
        self.reqs.get(tcs_id.checked_sub(self.offset)?)?.as_ref()
    }

    pub fn owned_count(&self) -> usize {
        self.reqs.iter().filter(|req| req.is_some()).count()
    }
}

impl ModuleBehaviors for TcsGroup {
    /// Forget every staged sleep/wake command.
    fn reset(&mut self) {
        self.slots.clear();
    }
}
