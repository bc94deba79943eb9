//! Per-CPU statistics counters.
//!
//! All hot-path accounting is write-local: every counter is striped across
//! CPUs with one cache-padded cell per CPU, so the capture path never
//! contends on a shared line. Readers aggregate the stripes on demand.

use std::sync::atomic::{ AtomicU64, Ordering };

use crossbeam::utils::CachePadded;
use serde::{ Deserialize, Serialize };

/// A counter striped across CPUs.
///
/// Writes go to the caller's stripe with relaxed ordering; reads sum all
/// stripes. The value is monotonically increasing.
pub struct SparseCounter {
    cells: Box<[CachePadded<AtomicU64>]>,
}

impl SparseCounter {
    pub fn new(cpus: usize) -> Self {
        let cells = (0..cpus.max(1))
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self { cells }
    }

    #[inline]
    pub fn inc(&self, cpu: usize) {
        self.add(cpu, 1);
    }

    #[inline]
    pub fn add(&self, cpu: usize, value: u64) {
        // Out-of-range CPUs fold onto the last stripe; the sum is unaffected.
        let cell = &self.cells[cpu.min(self.cells.len() - 1)];
        cell.store(cell.load(Ordering::Relaxed).wrapping_add(value), Ordering::Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .fold(0u64, u64::wrapping_add)
    }

    pub fn reset(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }
}

/// Counters owned by a consumer socket.
pub struct SockCounters {
    pub recv: SparseCounter,
    pub lost: SparseCounter,
    pub drop: SparseCounter,
}

impl SockCounters {
    pub fn new(cpus: usize) -> Self {
        Self {
            recv: SparseCounter::new(cpus),
            lost: SparseCounter::new(cpus),
            drop: SparseCounter::new(cpus),
        }
    }

    pub fn snapshot(&self) -> SockStats {
        SockStats {
            recv: self.recv.read(),
            lost: self.lost.read(),
            drop: self.drop.read(),
        }
    }
}

/// Counters owned by a group.
pub struct GroupCounters {
    pub recv: SparseCounter,
    pub lost: SparseCounter,
    pub drop: SparseCounter,
    pub frwd: SparseCounter,
    pub kern: SparseCounter,
}

impl GroupCounters {
    pub fn new(cpus: usize) -> Self {
        Self {
            recv: SparseCounter::new(cpus),
            lost: SparseCounter::new(cpus),
            drop: SparseCounter::new(cpus),
            frwd: SparseCounter::new(cpus),
            kern: SparseCounter::new(cpus),
        }
    }

    pub fn snapshot(&self) -> GroupStats {
        GroupStats {
            recv: self.recv.read(),
            lost: self.lost.read(),
            drop: self.drop.read(),
            frwd: self.frwd.read(),
            kern: self.kern.read(),
        }
    }
}

/// Engine-wide counters.
pub struct GlobalCounters {
    pub recv: SparseCounter,
    pub frwd: SparseCounter,
    pub disc: SparseCounter,
    pub kern: SparseCounter,
}

impl GlobalCounters {
    pub fn new(cpus: usize) -> Self {
        Self {
            recv: SparseCounter::new(cpus),
            frwd: SparseCounter::new(cpus),
            disc: SparseCounter::new(cpus),
            kern: SparseCounter::new(cpus),
        }
    }

    pub fn snapshot(&self) -> GlobalStats {
        GlobalStats {
            recv: self.recv.read(),
            frwd: self.frwd.read(),
            disc: self.disc.read(),
            kern: self.kern.read(),
        }
    }
}

/// User-visible socket statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SockStats {
    pub recv: u64,
    pub lost: u64,
    pub drop: u64,
}

/// User-visible per-group statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub recv: u64,
    pub lost: u64,
    pub drop: u64,
    pub frwd: u64,
    pub kern: u64,
}

/// User-visible engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub recv: u64,
    pub frwd: u64,
    pub disc: u64,
    pub kern: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_counter_aggregates_stripes() {
        let counter = SparseCounter::new(4);
        counter.add(0, 10);
        counter.add(1, 20);
        counter.add(3, 5);
        counter.inc(3);
        assert_eq!(counter.read(), 36);
    }

    #[test]
    fn test_sparse_counter_out_of_range_cpu() {
        let counter = SparseCounter::new(2);
        counter.add(100, 7);
        assert_eq!(counter.read(), 7);
    }

    #[test]
    fn test_snapshots() {
        let socks = SockCounters::new(2);
        socks.recv.add(0, 3);
        socks.lost.add(1, 1);
        assert_eq!(socks.snapshot(), SockStats { recv: 3, lost: 1, drop: 0 });

        let group = GroupCounters::new(2);
        group.frwd.add(0, 2);
        group.lost.add(1, 3);
        let snap = group.snapshot();
        assert_eq!(snap.frwd, 2);
        assert_eq!(snap.lost, 3);
    }
}
