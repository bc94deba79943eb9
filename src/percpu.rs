//! Per-CPU pipeline state.
//!
//! Every CPU privately owns one [`CpuContext`]: the batch arena its
//! prefetched packets accumulate in, the buffer free list, the sequence
//! counter, and the memoized expansion of the current eligible-socket mask
//! into the weighted flat array used by hash steering. Nothing in here is
//! ever shared across CPUs; the engine wraps each context in its own cell
//! and the batch processor runs to completion while holding it.

use std::time::Instant;

use crate::constants::MAX_SOCK_MASK;
use crate::pool::{ BatchArena, BuffPool };

pub struct CpuContext {
    /// Buffers accumulated since the last batch, in arrival order.
    pub arena: BatchArena,
    /// Recycled buffer allocations.
    pub pool: BuffPool,
    /// Per-CPU packet sequence counter.
    pub counter: u32,
    /// Arrival time of the most recent packet.
    pub last_rx: Instant,
    /// Eligible-socket mask the weighted array below was built from.
    pub sock_eligible_mask: u64,
    /// Length of the valid prefix of `sock_mask`.
    pub sock_cnt: usize,
    /// Weighted expansion: each eligible socket appears `weight` times.
    pub sock_mask: Box<[u64; MAX_SOCK_MASK]>,
    /// Packets still to be dropped at the hook after an overflow.
    pub flowctrl: u32,
}

impl CpuContext {
    pub fn new() -> Self {
        Self {
            arena: BatchArena::new(),
            pool: BuffPool::default(),
            counter: 0,
            last_rx: Instant::now(),
            sock_eligible_mask: 0,
            sock_cnt: 0,
            sock_mask: Box::new([0u64; MAX_SOCK_MASK]),
            flowctrl: 0,
        }
    }

    /// Next value of the per-CPU sequence counter.
    #[inline]
    pub fn next_counter(&mut self) -> u32 {
        let value = self.counter;
        self.counter = self.counter.wrapping_add(1);
        value
    }

    /// Drop the memoized steering expansion, forcing a rebuild on the next
    /// steering decision.
    pub fn invalidate_steering_cache(&mut self) {
        self.sock_eligible_mask = 0;
        self.sock_cnt = 0;
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}
