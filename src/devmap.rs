//! Device map: `(ifindex, rx_queue) → group bitmask`.
//!
//! The map is read on every packet and updated rarely. Reads are plain
//! atomic loads on a fixed matrix of words; writers serialize behind a
//! mutex so concurrent bind/unbind calls compose, and only publish whole
//! words. A per-device monitor flag gates direct capture.

use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };

use parking_lot::Mutex;

use crate::constants::{ MAX_DEVICES, MAX_GROUPS, MAX_RX_QUEUES };
use crate::error::{ Result, SteerError };

/// Wildcard receive queue: the binding applies to every queue of the device.
pub const ANY_QUEUE: i32 = -1;

/// Bind/unbind selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapUpdate {
    Set,
    Reset,
}

pub struct DevMap {
    groups: Box<[[AtomicU64; MAX_RX_QUEUES]]>,
    monitor: Box<[AtomicBool]>,
    write_lock: Mutex<()>,
}

impl DevMap {
    pub fn new() -> Self {
        let groups = (0..MAX_DEVICES)
            .map(|_| std::array::from_fn(|_| AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let monitor = (0..MAX_DEVICES)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            groups,
            monitor,
            write_lock: Mutex::new(()),
        }
    }

    /// Groups bound to `(ifindex, rx_queue)`. Unknown devices and queues map
    /// to the empty mask.
    #[inline]
    pub fn get_groups(&self, ifindex: u32, rx_queue: u16) -> u64 {
        let dev = ifindex as usize;
        let queue = rx_queue as usize;
        if dev >= MAX_DEVICES || queue >= MAX_RX_QUEUES {
            return 0;
        }
        self.groups[dev][queue].load(Ordering::Acquire)
    }

    /// Bind or unbind group `gid` on `(ifindex, rx_queue)`; `ANY_QUEUE`
    /// applies the update to every queue of the device.
    pub fn update(&self, op: MapUpdate, ifindex: u32, rx_queue: i32, gid: usize) -> Result<()> {
        if gid >= MAX_GROUPS {
            return Err(SteerError::InvalidGroup { gid: gid as isize });
        }
        let dev = ifindex as usize;
        if dev >= MAX_DEVICES {
            return Err(SteerError::invalid_argument(format!("ifindex {} out of range", ifindex)));
        }
        if rx_queue != ANY_QUEUE && (rx_queue < 0 || rx_queue as usize >= MAX_RX_QUEUES) {
            return Err(SteerError::invalid_argument(format!("rx_queue {} out of range", rx_queue)));
        }

        let _guard = self.write_lock.lock();
        let bit = 1u64 << gid;
        let queues: &[AtomicU64] = &self.groups[dev];
        let range = if rx_queue == ANY_QUEUE {
            0..MAX_RX_QUEUES
        } else {
            let q = rx_queue as usize;
            q..q + 1
        };
        for queue in range {
            match op {
                MapUpdate::Set => queues[queue].fetch_or(bit, Ordering::AcqRel),
                MapUpdate::Reset => queues[queue].fetch_and(!bit, Ordering::AcqRel),
            };
        }
        Ok(())
    }

    /// Remove `gid` from every `(device, queue)` entry.
    pub fn reset_group(&self, gid: usize) {
        let _guard = self.write_lock.lock();
        let clear = !(1u64 << (gid % MAX_GROUPS));
        for dev in self.groups.iter() {
            for queue in dev.iter() {
                queue.fetch_and(clear, Ordering::AcqRel);
            }
        }
    }

    #[inline]
    pub fn monitor_get(&self, ifindex: u32) -> bool {
        let dev = ifindex as usize;
        dev < MAX_DEVICES && self.monitor[dev].load(Ordering::Relaxed)
    }

    pub fn monitor_set(&self, ifindex: u32, enable: bool) {
        let dev = ifindex as usize;
        if dev < MAX_DEVICES {
            self.monitor[dev].store(enable, Ordering::Relaxed);
        }
    }

    /// Disable direct capture on every device.
    pub fn monitor_reset(&self) {
        for flag in self.monitor.iter() {
            flag.store(false, Ordering::Relaxed);
        }
    }
}

impl Default for DevMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_reset_single_queue() {
        let map = DevMap::new();
        map.update(MapUpdate::Set, 2, 1, 5).unwrap();
        assert_eq!(map.get_groups(2, 1), 1 << 5);
        assert_eq!(map.get_groups(2, 0), 0);

        map.update(MapUpdate::Reset, 2, 1, 5).unwrap();
        assert_eq!(map.get_groups(2, 1), 0);
    }

    #[test]
    fn test_bind_unbind_is_idempotent_on_the_map() {
        let map = DevMap::new();
        map.update(MapUpdate::Set, 1, 0, 3).unwrap();
        let before = map.get_groups(1, 0);

        map.update(MapUpdate::Set, 1, 0, 7).unwrap();
        map.update(MapUpdate::Reset, 1, 0, 7).unwrap();
        assert_eq!(map.get_groups(1, 0), before);
    }

    #[test]
    fn test_any_queue_applies_to_all_queues() {
        let map = DevMap::new();
        map.update(MapUpdate::Set, 4, ANY_QUEUE, 2).unwrap();
        for q in 0..MAX_RX_QUEUES as u16 {
            assert_eq!(map.get_groups(4, q), 1 << 2);
        }
        map.update(MapUpdate::Reset, 4, ANY_QUEUE, 2).unwrap();
        assert_eq!(map.get_groups(4, 0), 0);
    }

    #[test]
    fn test_out_of_range_reads_are_empty() {
        let map = DevMap::new();
        assert_eq!(map.get_groups(MAX_DEVICES as u32 + 1, 0), 0);
        assert_eq!(map.get_groups(0, MAX_RX_QUEUES as u16), 0);
    }

    #[test]
    fn test_update_validates_arguments() {
        let map = DevMap::new();
        assert!(map.update(MapUpdate::Set, 1, 0, MAX_GROUPS).is_err());
        assert!(map.update(MapUpdate::Set, MAX_DEVICES as u32, 0, 1).is_err());
        assert!(map.update(MapUpdate::Set, 1, MAX_RX_QUEUES as i32, 1).is_err());
        assert!(map.update(MapUpdate::Set, 1, -2, 1).is_err());
    }

    #[test]
    fn test_monitor_flags() {
        let map = DevMap::new();
        assert!(!map.monitor_get(9));
        map.monitor_set(9, true);
        assert!(map.monitor_get(9));
        map.monitor_reset();
        assert!(!map.monitor_get(9));
    }
}
