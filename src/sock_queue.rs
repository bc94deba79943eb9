//! Per-consumer socket queue.
//!
//! A shared-memory ring of fixed-size slots, written by every producer CPU
//! and read by one user-space consumer. The region starts with a fixed
//! header (`data` write cursor, `reader` cursor, `poll_wait` flag) followed
//! by the slot array; the layout is stable so a consumer can map the region
//! and walk it without any library code.
//!
//! ## Enqueue protocol
//!
//! Producers reserve a contiguous run of sequence numbers by advancing the
//! shared write cursor, fill their slots, then publish each slot by storing
//! `sequence + 1` into its commit word with release ordering. The consumer
//! walks sequences in order and stops at the first slot whose commit word
//! does not match, so partially filled runs are never observed. A batch
//! that does not fit is accepted partially; the caller accounts the
//! remainder as lost.

use std::sync::atomic::{ AtomicU32, AtomicU64, Ordering };

use memmap2::MmapMut;

use crate::constants::SLOT_ALIGNMENT;
use crate::error::Result;
use crate::qbuff::Qbuff;

/// Size of the fixed queue header, one cache line.
pub const QUEUE_HEADER_SIZE: usize = 64;

/// Size of the per-slot header preceding the payload.
pub const SLOT_HEADER_SIZE: usize = 24;

/// Slot flag: the packet carried a VLAN tag.
pub const SLOT_FLAG_VLAN: u8 = 0b0000_0001;

/// Bounded retries for the reserve CAS before a contended batch is counted
/// lost.
const CLAIM_RETRIES: usize = 64;

/// Shared queue header at the start of the mapped region.
#[repr(C)]
pub struct QueueHeader {
    /// Producer write cursor: next sequence to claim.
    pub data: AtomicU64,
    /// Consumer cursor: next sequence to read.
    pub reader: AtomicU64,
    /// Set by a sleepy consumer; producers wake it when data arrives.
    pub poll_wait: AtomicU32,
    _pad: u32,
}

/// Size in bytes of one slot for a given capture length.
pub fn slot_size(caplen: usize) -> usize {
    (SLOT_HEADER_SIZE + caplen + SLOT_ALIGNMENT - 1) & !(SLOT_ALIGNMENT - 1)
}

/// Total mapped bytes for a queue geometry.
pub fn queue_mem(slots: usize, caplen: usize) -> usize {
    QUEUE_HEADER_SIZE + slots * slot_size(caplen)
}

/// A consumer-side copy of one captured slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedSlot {
    pub tstamp: u64,
    pub len: u16,
    pub caplen: u16,
    pub gid: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

pub struct SockQueue {
    mmap: MmapMut,
    base: *mut u8,
    slots: usize,
    slot_size: usize,
    caplen: usize,
    offset: usize,
}

// SAFETY: the raw base pointer is safe to share between threads because
// all cross-thread coordination goes through the atomic cursor and commit
// words, slot bodies are only written between a successful reserve and the
// commit store, and the mapping lives as long as the queue (Drop unmaps).
unsafe impl Send for SockQueue {}
unsafe impl Sync for SockQueue {}

impl SockQueue {
    /// Map and initialize a queue region.
    pub fn new(slots: usize, caplen: usize, offset: usize) -> Result<Self> {
        let size = queue_mem(slots, caplen);
        let mut mmap = MmapMut::map_anon(size)?;
        let base = mmap.as_mut_ptr();

        // Keep the queue region resident; failure is not fatal.
        // SAFETY: base/size describe the mapping we just created.
        unsafe {
            let _ = libc::mlock(base as *const libc::c_void, size);
        }

        let queue = Self {
            mmap,
            base,
            slots,
            slot_size: slot_size(caplen),
            caplen,
            offset,
        };
        // Fresh anonymous maps are zeroed; make the header state explicit
        // anyway so re-initialization is not mapping-dependent.
        let hdr = queue.header();
        hdr.data.store(0, Ordering::Release);
        hdr.reader.store(0, Ordering::Release);
        hdr.poll_wait.store(0, Ordering::Release);
        Ok(queue)
    }

    #[inline]
    pub fn header(&self) -> &QueueHeader {
        // SAFETY: the region starts with a QueueHeader and is at least
        // QUEUE_HEADER_SIZE bytes; alignment comes from the page-aligned map.
        unsafe { &*(self.base as *const QueueHeader) }
    }

    #[inline]
    fn slot_base(&self, seq: u64) -> *mut u8 {
        let index = (seq % (self.slots as u64)) as usize;
        // SAFETY: index < slots, so the offset stays inside the mapping.
        unsafe { self.base.add(QUEUE_HEADER_SIZE + index * self.slot_size) }
    }

    #[inline]
    fn slot_commit(&self, seq: u64) -> &AtomicU64 {
        // SAFETY: the commit word is the first, 8-byte-aligned field of the
        // slot header.
        unsafe { &*(self.slot_base(seq) as *const AtomicU64) }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn caplen(&self) -> usize {
        self.caplen
    }

    /// Bytes of the mapped region.
    pub fn mem_size(&self) -> usize {
        self.mmap.len()
    }

    /// Number of sequences claimed but not yet consumed.
    #[inline]
    pub fn len(&self) -> usize {
        let hdr = self.header();
        let tail = hdr.data.load(Ordering::Acquire);
        let head = hdr.reader.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve up to `want` slots. Returns the first claimed sequence and
    /// the accepted count (possibly 0 on a full queue).
    fn try_claim(&self, want: usize) -> (u64, usize) {
        let hdr = self.header();
        for _ in 0..CLAIM_RETRIES {
            let tail = hdr.data.load(Ordering::Acquire);
            let head = hdr.reader.load(Ordering::Acquire);
            let avail = self.slots.saturating_sub(tail.saturating_sub(head) as usize);
            let n = want.min(avail);
            if n == 0 {
                return (tail, 0);
            }
            match
                hdr.data.compare_exchange_weak(
                    tail,
                    tail + (n as u64),
                    Ordering::AcqRel,
                    Ordering::Acquire
                )
            {
                Ok(_) => {
                    return (tail, n);
                }
                Err(_) => {
                    continue;
                }
            }
        }
        (0, 0)
    }

    /// Enqueue the payloads of `buffs` under group `gid`.
    ///
    /// Accepts a prefix of the batch when the queue is short on space and
    /// returns the number accepted; the caller accounts the rest as lost.
    pub fn enqueue_batch<'a, I>(&self, buffs: I, want: usize, gid: usize) -> usize
        where I: IntoIterator<Item = &'a Qbuff>
    {
        if want == 0 {
            return 0;
        }
        let (first_seq, accepted) = self.try_claim(want);
        if accepted == 0 {
            return 0;
        }

        let mut seq = first_seq;
        for buff in buffs.into_iter().take(accepted) {
            self.fill_slot(seq, buff, gid);
            seq += 1;
        }
        accepted
    }

    fn fill_slot(&self, seq: u64, buff: &Qbuff, gid: usize) {
        let data = &buff.packet.data;
        let skip = self.offset.min(data.len());
        let copy_len = (data.len() - skip).min(self.caplen);

        let base = self.slot_base(seq);
        // SAFETY: the slot at `seq` was reserved by try_claim, so no other
        // producer writes it, and the consumer will not read it before the
        // commit store below. All offsets stay within the slot.
        unsafe {
            let tstamp = base.add(8) as *mut u64;
            tstamp.write_unaligned(buff.packet.tstamp);
            let len = base.add(16) as *mut u16;
            len.write_unaligned(data.len() as u16);
            let caplen = base.add(18) as *mut u16;
            caplen.write_unaligned(copy_len as u16);
            let gid_ptr = base.add(20);
            gid_ptr.write(gid as u8);
            let flags = if buff.packet.vlan_tci != 0 { SLOT_FLAG_VLAN } else { 0 };
            base.add(21).write(flags);

            std::ptr::copy_nonoverlapping(
                data.as_ptr().add(skip),
                base.add(SLOT_HEADER_SIZE),
                copy_len
            );
        }
        self.slot_commit(seq).store(seq + 1, Ordering::Release);
    }

    /// Read up to `max` committed slots, advancing the reader cursor.
    pub fn try_read_batch(&self, max: usize) -> Vec<CapturedSlot> {
        let hdr = self.header();
        let mut seq = hdr.reader.load(Ordering::Acquire);
        let tail = hdr.data.load(Ordering::Acquire);
        let mut out = Vec::new();

        while out.len() < max && seq < tail {
            if self.slot_commit(seq).load(Ordering::Acquire) != seq + 1 {
                // Claimed but not yet published.
                break;
            }
            let base = self.slot_base(seq);
            // SAFETY: the commit word matched, so the producer finished
            // writing this slot; the payload length was bounded by caplen.
            let slot = unsafe {
                let tstamp = (base.add(8) as *const u64).read_unaligned();
                let len = (base.add(16) as *const u16).read_unaligned();
                let caplen = (base.add(18) as *const u16).read_unaligned();
                let gid = base.add(20).read();
                let flags = base.add(21).read();
                let payload = std::slice
                    ::from_raw_parts(base.add(SLOT_HEADER_SIZE), caplen as usize)
                    .to_vec();
                CapturedSlot { tstamp, len, caplen, gid, flags, payload }
            };
            out.push(slot);
            seq += 1;
        }

        hdr.reader.store(seq, Ordering::Release);
        out
    }

    /// Poll: readable when the fill level reaches half the slots; otherwise
    /// arm the wait flag.
    pub fn poll_readable(&self) -> bool {
        let hdr = self.header();
        if self.len() >= self.slots >> 1 {
            hdr.poll_wait.store(0, Ordering::Release);
            true
        } else {
            hdr.poll_wait.store(1, Ordering::Release);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qbuff::RawPacket;

    fn buff(bytes: &[u8]) -> Qbuff {
        Qbuff::from_packet(RawPacket::new(bytes.to_vec(), 1, 0), false)
    }

    #[test]
    fn test_slot_size_is_aligned() {
        assert_eq!(slot_size(0), SLOT_HEADER_SIZE);
        assert_eq!(slot_size(1) % SLOT_ALIGNMENT, 0);
        assert!(slot_size(1514) >= SLOT_HEADER_SIZE + 1514);
    }

    #[test]
    fn test_enqueue_and_read_roundtrip() {
        let queue = SockQueue::new(16, 64, 0).unwrap();
        let buffs: Vec<Qbuff> = (0u8..4).map(|i| buff(&[i; 10])).collect();

        let accepted = queue.enqueue_batch(buffs.iter(), 4, 3);
        assert_eq!(accepted, 4);
        assert_eq!(queue.len(), 4);

        let slots = queue.try_read_batch(10);
        assert_eq!(slots.len(), 4);
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.gid, 3);
            assert_eq!(slot.len, 10);
            assert_eq!(slot.caplen, 10);
            assert_eq!(slot.payload, vec![i as u8; 10]);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_caplen_truncates_payload() {
        let queue = SockQueue::new(8, 4, 0).unwrap();
        queue.enqueue_batch(std::iter::once(&buff(&[7u8; 32])), 1, 0);
        let slots = queue.try_read_batch(1);
        assert_eq!(slots[0].len, 32);
        assert_eq!(slots[0].caplen, 4);
        assert_eq!(slots[0].payload, vec![7u8; 4]);
    }

    #[test]
    fn test_offset_skips_prefix() {
        let queue = SockQueue::new(8, 16, 2).unwrap();
        queue.enqueue_batch(std::iter::once(&buff(&[1, 2, 3, 4, 5])), 1, 0);
        let slots = queue.try_read_batch(1);
        assert_eq!(slots[0].payload, vec![3, 4, 5]);
    }

    #[test]
    fn test_overflow_accepts_prefix() {
        let queue = SockQueue::new(8, 32, 0).unwrap();
        let buffs: Vec<Qbuff> = (0u8..16).map(|i| buff(&[i; 8])).collect();

        let accepted = queue.enqueue_batch(buffs.iter(), 16, 0);
        assert_eq!(accepted, 8);

        let slots = queue.try_read_batch(16);
        assert_eq!(slots.len(), 8);
        // The accepted prefix preserves arrival order.
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.payload, vec![i as u8; 8]);
        }
    }

    #[test]
    fn test_ring_wraps_after_consume() {
        let queue = SockQueue::new(4, 16, 0).unwrap();
        for round in 0u8..5 {
            let b = buff(&[round; 4]);
            assert_eq!(queue.enqueue_batch(std::iter::once(&b), 1, 0), 1);
            let slots = queue.try_read_batch(1);
            assert_eq!(slots[0].payload, vec![round; 4]);
        }
    }

    #[test]
    fn test_poll_threshold() {
        let queue = SockQueue::new(8, 16, 0).unwrap();
        assert!(!queue.poll_readable());
        assert_eq!(queue.header().poll_wait.load(Ordering::Relaxed), 1);

        let buffs: Vec<Qbuff> = (0u8..4).map(|i| buff(&[i; 4])).collect();
        queue.enqueue_batch(buffs.iter(), 4, 0);
        assert!(queue.poll_readable());
        assert_eq!(queue.header().poll_wait.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_vlan_flag() {
        let queue = SockQueue::new(4, 16, 0).unwrap();
        let mut b = buff(&[0u8; 4]);
        b.packet.vlan_tci = 100;
        queue.enqueue_batch(std::iter::once(&b), 1, 0);
        let slots = queue.try_read_batch(1);
        assert_eq!(slots[0].flags & SLOT_FLAG_VLAN, SLOT_FLAG_VLAN);
    }
}
