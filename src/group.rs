//! Group table.
//!
//! A group bundles a classifier program, an optional byte-code filter, a
//! VLAN id set, an opaque state blob, and the per-class socket membership
//! masks. The batch processor snapshots these fields with plain atomic
//! loads under an epoch guard; the control plane replaces them with
//! publish-then-defer-free: swap the pointer atomically and hand the old
//! value to the epoch collector, which frees it only after every in-flight
//! batch has unpinned.

use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };

use crossbeam::epoch::{ self, Atomic, Guard, Owned, Shared };
use parking_lot::Mutex;

use crate::bpf::BpfProgram;
use crate::constants::{ CLASS_MASK_ALL, MAX_CLASSES, MAX_GROUPS, VLAN_VID_MAX };
use crate::error::{ Result, SteerError };
use crate::lang::Computation;
use crate::stats::GroupCounters;

const VLAN_WORDS: usize = 4096 / 64;

/// Which sockets may join a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupPolicy {
    /// Only the owning socket.
    Private,
    /// The owner and sockets already in the member set.
    Restricted,
    /// Any socket.
    #[default]
    Shared,
}

#[derive(Debug, Default)]
struct GroupCtl {
    policy: GroupPolicy,
    owner: Option<usize>,
    members: u64,
}

pub struct Group {
    comp: Atomic<Computation>,
    bp_filter: Atomic<BpfProgram>,
    state: Atomic<Vec<u8>>,
    vlan_enabled: AtomicBool,
    vlan_set: [AtomicU64; VLAN_WORDS],
    sock_id: [AtomicU64; MAX_CLASSES],
    ctl: Mutex<GroupCtl>,
    pub stats: GroupCounters,
}

impl Group {
    fn new(cpus: usize) -> Self {
        Self {
            comp: Atomic::null(),
            bp_filter: Atomic::null(),
            state: Atomic::null(),
            vlan_enabled: AtomicBool::new(false),
            vlan_set: std::array::from_fn(|_| AtomicU64::new(0)),
            sock_id: std::array::from_fn(|_| AtomicU64::new(0)),
            ctl: Mutex::new(GroupCtl::default()),
            stats: GroupCounters::new(cpus),
        }
    }

    // -- hot path snapshots -------------------------------------------------

    #[inline]
    pub fn comp<'g>(&self, guard: &'g Guard) -> Option<&'g Computation> {
        // SAFETY: the pointer was published by set_computation and is only
        // reclaimed after every guard pinned before the swap is dropped.
        unsafe { self.comp.load(Ordering::Acquire, guard).as_ref() }
    }

    #[inline]
    pub fn bp_filter<'g>(&self, guard: &'g Guard) -> Option<&'g BpfProgram> {
        // SAFETY: as above.
        unsafe { self.bp_filter.load(Ordering::Acquire, guard).as_ref() }
    }

    #[inline]
    pub fn state<'g>(&self, guard: &'g Guard) -> Option<&'g [u8]> {
        // SAFETY: as above.
        unsafe {
            self.state
                .load(Ordering::Acquire, guard)
                .as_ref()
                .map(|v| v.as_slice())
        }
    }

    #[inline]
    pub fn vlan_filters_enabled(&self) -> bool {
        self.vlan_enabled.load(Ordering::Acquire)
    }

    /// True when `vid` is admitted by the group's VLAN set.
    #[inline]
    pub fn vlan_check(&self, vid: u16) -> bool {
        let vid = vid as usize;
        if vid >= 4096 {
            return false;
        }
        self.vlan_set[vid / 64].load(Ordering::Acquire) & (1 << (vid % 64)) != 0
    }

    #[inline]
    pub fn sock_id(&self, class: usize) -> u64 {
        self.sock_id[class].load(Ordering::Acquire)
    }

    // -- control plane ------------------------------------------------------

    pub fn set_computation(&self, comp: Option<Computation>, guard: &Guard) {
        let new = match comp {
            Some(c) => Owned::new(c).into_shared(guard),
            None => Shared::null(),
        };
        let old = self.comp.swap(new, Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: old was published by a previous swap; no new reader
            // can acquire it after this point.
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }

    pub fn set_filter(&self, filter: Option<BpfProgram>, guard: &Guard) {
        let new = match filter {
            Some(f) => Owned::new(f).into_shared(guard),
            None => Shared::null(),
        };
        let old = self.bp_filter.swap(new, Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: as above.
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }

    pub fn set_state(&self, state: Option<Vec<u8>>, guard: &Guard) {
        let new = match state {
            Some(s) => Owned::new(s).into_shared(guard),
            None => Shared::null(),
        };
        let old = self.state.swap(new, Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: as above.
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }

    pub fn vlan_toggle(&self, enable: bool) {
        self.vlan_enabled.store(enable, Ordering::Release);
        if !enable {
            for word in &self.vlan_set {
                word.store(0, Ordering::Release);
            }
        }
    }

    fn vlan_set_vid(&self, vid: u16, toggle: bool) {
        let vid = vid as usize;
        let bit = 1u64 << (vid % 64);
        if toggle {
            self.vlan_set[vid / 64].fetch_or(bit, Ordering::AcqRel);
        } else {
            self.vlan_set[vid / 64].fetch_and(!bit, Ordering::AcqRel);
        }
    }

    fn clear(&self, guard: &Guard) {
        self.set_computation(None, guard);
        self.set_filter(None, guard);
        self.set_state(None, guard);
        self.vlan_toggle(false);
        for class in &self.sock_id {
            class.store(0, Ordering::Release);
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        // SAFETY: the table is being torn down, no readers remain.
        unsafe {
            let guard = epoch::unprotected();
            let comp = self.comp.load(Ordering::Relaxed, guard);
            if !comp.is_null() {
                drop(comp.into_owned());
            }
            let filter = self.bp_filter.load(Ordering::Relaxed, guard);
            if !filter.is_null() {
                drop(filter.into_owned());
            }
            let state = self.state.load(Ordering::Relaxed, guard);
            if !state.is_null() {
                drop(state.into_owned());
            }
        }
    }
}

pub struct GroupTable {
    groups: Vec<Group>,
}

impl GroupTable {
    pub fn new(cpus: usize) -> Self {
        Self {
            groups: (0..MAX_GROUPS).map(|_| Group::new(cpus)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, gid: usize) -> Option<&Group> {
        self.groups.get(gid)
    }

    /// Look up a group after validating the id, for control-plane calls.
    pub fn checked(&self, gid: usize) -> Result<&Group> {
        self.groups
            .get(gid)
            .ok_or(SteerError::InvalidGroup { gid: gid as isize })
    }

    /// Join socket `sid` to group `gid` under the classes of `class_mask`.
    pub fn join(
        &self,
        gid: usize,
        sid: usize,
        class_mask: u64,
        policy: GroupPolicy
    ) -> Result<()> {
        if class_mask == 0 || class_mask & !CLASS_MASK_ALL != 0 {
            return Err(SteerError::InvalidClassMask { mask: class_mask });
        }
        let group = self.checked(gid)?;

        let mut ctl = group.ctl.lock();
        if ctl.members == 0 {
            ctl.policy = policy;
            ctl.owner = Some(sid);
        } else {
            let admitted = match ctl.policy {
                GroupPolicy::Shared => true,
                GroupPolicy::Restricted => {
                    ctl.owner == Some(sid) || ctl.members & (1 << sid) != 0
                }
                GroupPolicy::Private => ctl.owner == Some(sid),
            };
            if !admitted {
                return Err(SteerError::PermissionDenied { gid });
            }
        }
        ctl.members |= 1 << sid;

        for class in crate::bits::set_bits(class_mask) {
            group.sock_id[class].fetch_or(1 << sid, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Join the lowest unused group.
    pub fn join_free(&self, sid: usize, class_mask: u64, policy: GroupPolicy) -> Result<usize> {
        if class_mask == 0 || class_mask & !CLASS_MASK_ALL != 0 {
            return Err(SteerError::InvalidClassMask { mask: class_mask });
        }
        for gid in 0..MAX_GROUPS {
            let free = {
                let ctl = self.groups[gid].ctl.lock();
                ctl.members == 0
            };
            if free && self.join(gid, sid, class_mask, policy).is_ok() {
                return Ok(gid);
            }
        }
        Err(SteerError::NoFreeGroup)
    }

    /// Remove socket `sid` from group `gid`. Returns true when the group
    /// became empty and was cleared.
    pub fn leave(&self, gid: usize, sid: usize, guard: &Guard) -> Result<bool> {
        let group = self.checked(gid)?;
        let mut ctl = group.ctl.lock();
        if ctl.members & (1 << sid) == 0 {
            return Err(SteerError::PermissionDenied { gid });
        }
        ctl.members &= !(1 << sid);
        for class in &group.sock_id {
            class.fetch_and(!(1 << sid), Ordering::AcqRel);
        }
        if ctl.members == 0 {
            ctl.owner = None;
            ctl.policy = GroupPolicy::default();
            drop(ctl);
            group.clear(guard);
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove socket `sid` from every group it joined; returns the mask of
    /// groups that became empty.
    pub fn leave_all(&self, sid: usize, guard: &Guard) -> u64 {
        let mut emptied = 0u64;
        for gid in 0..MAX_GROUPS {
            if self.has_joined(gid, sid) {
                if let Ok(true) = self.leave(gid, sid, guard) {
                    emptied |= 1 << gid;
                }
            }
        }
        emptied
    }

    pub fn has_joined(&self, gid: usize, sid: usize) -> bool {
        self.groups
            .get(gid)
            .map(|g| g.ctl.lock().members & (1 << sid) != 0)
            .unwrap_or(false)
    }

    /// Bitmask of groups socket `sid` has joined.
    pub fn groups_of(&self, sid: usize) -> u64 {
        let mut mask = 0u64;
        for gid in 0..MAX_GROUPS {
            if self.has_joined(gid, sid) {
                mask |= 1 << gid;
            }
        }
        mask
    }

    /// Add or remove VLAN ids from a group's set; `vid == -1` expands to the
    /// whole valid range.
    pub fn vlan_set_filter(&self, gid: usize, vid: i32, toggle: bool) -> Result<()> {
        let group = self.checked(gid)?;
        if !(-1..=VLAN_VID_MAX as i32).contains(&vid) {
            return Err(SteerError::InvalidVlanId { vid });
        }
        if !group.vlan_filters_enabled() {
            return Err(SteerError::invalid_argument("vlan filters disabled for this group"));
        }
        if vid == -1 {
            for v in 1..=VLAN_VID_MAX {
                group.vlan_set_vid(v, toggle);
            }
        } else {
            group.vlan_set_vid(vid as u16, toggle);
        }
        Ok(())
    }
}
