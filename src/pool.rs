//! Per-CPU buffer pool and the per-batch arena.
//!
//! Every CPU owns a bounded free list of reusable [`Qbuff`]s and one
//! [`BatchArena`] that holds the buffers currently being processed. The
//! arena is the ownership root for a batch: indices into it key the
//! per-socket fan-out bitmasks, and it is reset (all buffers recycled to the
//! free list) at every batch end, so no buffer and no classifier-borrowed
//! reference can outlive a batch.

use std::collections::VecDeque;

use crate::constants::{ BATCH_LEN, MAX_DEVICES, POOL_SIZE };
use crate::qbuff::{ Qbuff, RawPacket };

/// Bounded free list of recycled packet buffers, privately owned by one CPU.
pub struct BuffPool {
    free: VecDeque<Qbuff>,
    capacity: usize,
}

impl BuffPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Take a buffer for `packet`, reusing a pooled allocation when one is
    /// available.
    pub fn acquire(&mut self, packet: RawPacket, direct: bool) -> Qbuff {
        match self.free.pop_front() {
            Some(mut buff) => {
                buff.packet = packet;
                buff.direct = direct;
                buff
            }
            None => Qbuff::from_packet(packet, direct),
        }
    }

    /// Return a buffer to the pool. Buffers beyond the pool capacity are
    /// dropped outright.
    pub fn release(&mut self, mut buff: Qbuff) {
        if self.free.len() < self.capacity {
            buff.recycle();
            self.free.push_back(buff);
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl Default for BuffPool {
    fn default() -> Self {
        Self::new(POOL_SIZE)
    }
}

/// Egress endpoints recorded lazily by classifiers during a batch.
#[derive(Debug, Default, Clone)]
pub struct EndpointInfo {
    /// Distinct egress device indices, in first-seen order.
    pub devs: Vec<u32>,
    /// Total number of transmissions requested across the batch.
    pub cnt_total: usize,
}

/// Ordered set of buffers owned by the current batch.
pub struct BatchArena {
    pool: Vec<Qbuff>,
}

impl BatchArena {
    pub fn new() -> Self {
        Self { pool: Vec::with_capacity(BATCH_LEN) }
    }

    /// Number of buffers in the current batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.pool.len() >= BATCH_LEN
    }

    /// Append a buffer in arrival order. Returns its batch slot index, or
    /// the buffer itself when the arena is full.
    pub fn push(&mut self, buff: Qbuff) -> Result<usize, Qbuff> {
        if self.is_full() {
            return Err(buff);
        }
        self.pool.push(buff);
        Ok(self.pool.len() - 1)
    }

    #[inline]
    pub fn get(&self, n: usize) -> Option<&Qbuff> {
        self.pool.get(n)
    }

    #[inline]
    pub fn get_mut(&mut self, n: usize) -> Option<&mut Qbuff> {
        self.pool.get_mut(n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Qbuff> {
        self.pool.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Qbuff> {
        self.pool.iter_mut()
    }

    /// Collect the lazy egress endpoints recorded by classifiers on the
    /// buffers of this batch.
    pub fn lazy_endpoints(&self) -> EndpointInfo {
        let mut info = EndpointInfo::default();
        let mut seen = [false; MAX_DEVICES];
        for buff in &self.pool {
            for &dev in buff.log.devs() {
                info.cnt_total += 1;
                let idx = dev as usize;
                if idx < MAX_DEVICES && !seen[idx] {
                    seen[idx] = true;
                    info.devs.push(dev);
                }
            }
        }
        info
    }

    /// End the batch: recycle every buffer to the free list and empty the
    /// arena.
    pub fn reset(&mut self, pool: &mut BuffPool) {
        for buff in self.pool.drain(..) {
            pool.release(buff);
        }
    }
}

impl Default for BatchArena {
    fn default() -> Self {
        Self::new()
    }
}
