//! Consumer socket table.
//!
//! Sockets live in a fixed vector indexed by socket id. Ids are allocated
//! by scanning the vector with compare-and-swap, lowest id first, so the
//! hot path can resolve an id to its socket with one epoch-protected load.
//! Closing a socket swaps its slot to null and defers destruction until
//! every in-flight batch has unpinned, which is the grace period the
//! steering snapshot needs.

use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };

use crossbeam::epoch::{ self, Atomic, Guard, Owned, Shared };

use crate::constants::{ MAX_SOCKETS, MAX_WEIGHT };
use crate::error::{ Result, SteerError };
use crate::sock_queue::{ queue_mem, SockQueue };
use crate::stats::SockCounters;

pub struct Sock {
    id: usize,
    active: AtomicBool,
    weight: AtomicUsize,
    caplen: AtomicUsize,
    offset: AtomicUsize,
    slots: AtomicUsize,
    tstamp: AtomicBool,
    queue: Atomic<SockQueue>,
    pub stats: SockCounters,
}

impl Sock {
    fn new(id: usize, caplen: usize, slots: usize, cpus: usize) -> Self {
        Self {
            id,
            active: AtomicBool::new(false),
            weight: AtomicUsize::new(1),
            caplen: AtomicUsize::new(caplen),
            offset: AtomicUsize::new(0),
            slots: AtomicUsize::new(slots),
            tstamp: AtomicBool::new(false),
            queue: Atomic::null(),
            stats: SockCounters::new(cpus),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn weight(&self) -> usize {
        self.weight.load(Ordering::Acquire)
    }

    pub fn set_weight(&self, weight: usize) -> Result<()> {
        if weight == 0 || weight > MAX_WEIGHT {
            return Err(
                SteerError::invalid_argument(
                    format!("weight must be in [1, {}], got {}", MAX_WEIGHT, weight)
                )
            );
        }
        self.weight.store(weight, Ordering::Release);
        Ok(())
    }

    pub fn caplen(&self) -> usize {
        self.caplen.load(Ordering::Acquire)
    }

    /// Takes effect the next time the queue is enabled.
    pub fn set_caplen(&self, caplen: usize) -> Result<()> {
        if caplen == 0 {
            return Err(SteerError::invalid_argument("caplen must be greater than 0"));
        }
        self.caplen.store(caplen, Ordering::Release);
        Ok(())
    }

    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, offset: usize) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn slots(&self) -> usize {
        self.slots.load(Ordering::Acquire)
    }

    /// Takes effect the next time the queue is enabled.
    pub fn set_slots(&self, slots: usize) -> Result<()> {
        if slots == 0 {
            return Err(SteerError::invalid_argument("slots must be greater than 0"));
        }
        self.slots.store(slots, Ordering::Release);
        Ok(())
    }

    pub fn tstamp_enabled(&self) -> bool {
        self.tstamp.load(Ordering::Acquire)
    }

    pub fn set_tstamp(&self, enable: bool) {
        self.tstamp.store(enable, Ordering::Release);
    }

    #[inline]
    pub fn queue<'g>(&self, guard: &'g Guard) -> Option<&'g SockQueue> {
        // SAFETY: the queue pointer is only reclaimed after every guard
        // pinned before the disable swap has been dropped.
        unsafe { self.queue.load(Ordering::Acquire, guard).as_ref() }
    }

    /// Bytes of the mapped queue region (0 when disabled).
    pub fn queue_mem(&self, guard: &Guard) -> usize {
        self.queue(guard)
            .map(|q| q.mem_size())
            .unwrap_or(0)
    }

    /// Total bytes a queue with the current geometry would map.
    pub fn queue_mem_needed(&self) -> usize {
        queue_mem(self.slots(), self.caplen())
    }

    /// Allocate and publish the queue region, then mark the socket active.
    pub fn enable(&self, guard: &Guard) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let queue = SockQueue::new(self.slots(), self.caplen(), self.offset())?;
        let old = self.queue.swap(Owned::new(queue), Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: the previous queue was published by an earlier enable.
            unsafe {
                guard.defer_destroy(old);
            }
        }
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Deactivate and tear down the queue after the grace period.
    pub fn disable(&self, guard: &Guard) {
        self.active.store(false, Ordering::Release);
        let old = self.queue.swap(Shared::null(), Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: no new reader can acquire the pointer after the swap.
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }
}

impl Drop for Sock {
    fn drop(&mut self) {
        // SAFETY: drop means no readers remain.
        unsafe {
            let guard = epoch::unprotected();
            let queue = self.queue.load(Ordering::Relaxed, guard);
            if !queue.is_null() {
                drop(queue.into_owned());
            }
        }
    }
}

pub struct SockTable {
    vector: Vec<Atomic<Sock>>,
    cpus: usize,
}

impl SockTable {
    pub fn new(cpus: usize) -> Self {
        Self {
            vector: (0..MAX_SOCKETS).map(|_| Atomic::null()).collect(),
            cpus,
        }
    }

    /// Allocate the lowest free socket id.
    pub fn open(&self, caplen: usize, slots: usize, guard: &Guard) -> Result<usize> {
        for sid in 0..MAX_SOCKETS {
            let sock = Owned::new(Sock::new(sid, caplen, slots, self.cpus));
            let claimed = self.vector[sid].compare_exchange(
                Shared::null(),
                sock,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard
            );
            if claimed.is_ok() {
                return Ok(sid);
            }
        }
        Err(SteerError::NoFreeId)
    }

    #[inline]
    pub fn get<'g>(&self, sid: usize, guard: &'g Guard) -> Option<&'g Sock> {
        if sid >= MAX_SOCKETS {
            return None;
        }
        // SAFETY: slot pointers are reclaimed only after the grace period.
        unsafe { self.vector[sid].load(Ordering::Acquire, guard).as_ref() }
    }

    pub fn checked<'g>(&self, sid: usize, guard: &'g Guard) -> Result<&'g Sock> {
        self.get(sid, guard).ok_or(SteerError::InvalidSocket { sid })
    }

    /// Release the id and defer destruction of the socket (and its queue)
    /// past the grace period.
    pub fn close(&self, sid: usize, guard: &Guard) -> Result<()> {
        if sid >= MAX_SOCKETS {
            return Err(SteerError::InvalidSocket { sid });
        }
        let old = self.vector[sid].swap(Shared::null(), Ordering::AcqRel, guard);
        if old.is_null() {
            return Err(SteerError::InvalidSocket { sid });
        }
        // SAFETY: the id is unpublished; in-flight batches may still hold
        // the reference until they unpin.
        unsafe {
            guard.defer_destroy(old);
        }
        Ok(())
    }
}

impl Drop for SockTable {
    fn drop(&mut self) {
        // SAFETY: table teardown, no readers remain.
        unsafe {
            let guard = epoch::unprotected();
            for slot in &self.vector {
                let sock = slot.load(Ordering::Relaxed, guard);
                if !sock.is_null() {
                    drop(sock.into_owned());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_allocates_lowest_free_id() {
        let table = SockTable::new(1);
        let guard = epoch::pin();
        assert_eq!(table.open(64, 8, &guard).unwrap(), 0);
        assert_eq!(table.open(64, 8, &guard).unwrap(), 1);

        table.close(0, &guard).unwrap();
        assert_eq!(table.open(64, 8, &guard).unwrap(), 0);
    }

    #[test]
    fn test_close_unpublishes_id() {
        let table = SockTable::new(1);
        let guard = epoch::pin();
        let sid = table.open(64, 8, &guard).unwrap();
        assert!(table.get(sid, &guard).is_some());

        table.close(sid, &guard).unwrap();
        assert!(table.get(sid, &guard).is_none());
        assert!(table.close(sid, &guard).is_err());
    }

    #[test]
    fn test_enable_disable_queue() {
        let table = SockTable::new(1);
        let guard = epoch::pin();
        let sid = table.open(32, 8, &guard).unwrap();
        let sock = table.get(sid, &guard).unwrap();

        assert!(!sock.is_active());
        assert_eq!(sock.queue_mem(&guard), 0);

        sock.enable(&guard).unwrap();
        assert!(sock.is_active());
        assert_eq!(sock.queue_mem(&guard), sock.queue_mem_needed());

        sock.disable(&guard);
        assert!(!sock.is_active());
        assert_eq!(sock.queue_mem(&guard), 0);
    }

    #[test]
    fn test_option_roundtrips() {
        let table = SockTable::new(1);
        let guard = epoch::pin();
        let sid = table.open(1514, 131072, &guard).unwrap();
        let sock = table.get(sid, &guard).unwrap();

        for caplen in [1usize, 96, 1514, 65535] {
            sock.set_caplen(caplen).unwrap();
            assert_eq!(sock.caplen(), caplen);
        }
        for slots in [1usize, 8, 131072] {
            sock.set_slots(slots).unwrap();
            assert_eq!(sock.slots(), slots);
        }
        for offset in [0usize, 14, 64] {
            sock.set_offset(offset);
            assert_eq!(sock.offset(), offset);
        }
        sock.set_tstamp(true);
        assert!(sock.tstamp_enabled());
        sock.set_tstamp(false);
        assert!(!sock.tstamp_enabled());
    }

    #[test]
    fn test_weight_bounds() {
        let table = SockTable::new(1);
        let guard = epoch::pin();
        let sid = table.open(64, 8, &guard).unwrap();
        let sock = table.get(sid, &guard).unwrap();

        assert_eq!(sock.weight(), 1);
        sock.set_weight(MAX_WEIGHT).unwrap();
        assert_eq!(sock.weight(), MAX_WEIGHT);
        assert!(sock.set_weight(0).is_err());
        assert!(sock.set_weight(MAX_WEIGHT + 1).is_err());
    }

    #[test]
    fn test_geometry_changes_apply_on_enable() {
        let table = SockTable::new(1);
        let guard = epoch::pin();
        let sid = table.open(64, 16, &guard).unwrap();
        let sock = table.get(sid, &guard).unwrap();

        sock.enable(&guard).unwrap();
        let before = sock.queue_mem(&guard);

        sock.set_slots(32).unwrap();
        // Unchanged until re-enable.
        assert_eq!(sock.queue_mem(&guard), before);

        sock.disable(&guard);
        sock.enable(&guard).unwrap();
        assert!(sock.queue_mem(&guard) > before);
    }
}
