//! Engine sizing constants and default configuration values
//!
//! This module contains the fixed table sizes and tuning defaults used
//! throughout the steerq engine. The batch geometry is fundamental: the
//! per-socket fan-out bookkeeping is a single machine word whose bits index
//! batch slots, so the batch length can never exceed 64 on 64-bit hosts.

use static_assertions::const_assert;

/// Maximum number of packets processed in one batch.
///
/// The fan-out bookkeeping (`sock_queue[sid]`) is one `u64` bitmask over
/// batch slots, which caps the batch at the machine word width.
pub const BATCH_LEN: usize = 64;

/// Maximum number of consumer sockets.
pub const MAX_SOCKETS: usize = 64;

/// Maximum number of groups.
pub const MAX_GROUPS: usize = 64;

/// Number of classes (subchannels) within a group.
pub const MAX_CLASSES: usize = 16;

/// Default class mask used when a classifier does not select one.
pub const CLASS_DEFAULT: u64 = 1;

/// Mask of all valid classes.
pub const CLASS_MASK_ALL: u64 = (1 << MAX_CLASSES) - 1;

/// Total length of the weighted steering array expanded per CPU.
pub const MAX_SOCK_MASK: usize = 1024;

/// Maximum steering weight of a single socket.
pub const MAX_WEIGHT: usize = MAX_SOCK_MASK / MAX_SOCKETS;

/// Maximum number of devices tracked by the device map.
pub const MAX_DEVICES: usize = 256;

/// Maximum number of hardware receive queues per device.
pub const MAX_RX_QUEUES: usize = 64;

/// Maximum number of lazy egress devices recorded per packet.
pub const MAX_FWD_DEVS: usize = 16;

/// Highest valid VLAN id.
pub const VLAN_VID_MAX: u16 = 4094;

/// Default capture length in bytes (Ethernet MTU + header).
pub const DEFAULT_CAP_LEN: usize = 1514;

/// Default number of slots per socket queue.
pub const DEFAULT_QUEUE_SLOTS: usize = 131072;

/// Default prefetch length (packets buffered before a batch runs).
pub const DEFAULT_PREFETCH_LEN: usize = 1;

/// Default flow control value (0 = disabled).
pub const DEFAULT_FLOW_CONTROL: u32 = 0;

/// Default period of the per-CPU flush timer in milliseconds.
pub const DEFAULT_FLUSH_PERIOD_MS: u64 = 10;

/// Number of reusable packet buffers kept in each per-CPU pool.
pub const POOL_SIZE: usize = 1024;

/// Alignment of socket queue slots in the shared memory region.
pub const SLOT_ALIGNMENT: usize = 8;

/// Cache line size for alignment optimizations (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// The batch bitmask must fit one machine word, and the weighted steering
// array must admit at least weight 1 for every socket.
const_assert!(BATCH_LEN <= u64::BITS as usize);
const_assert!(MAX_SOCKETS <= u64::BITS as usize);
const_assert!(MAX_GROUPS <= u64::BITS as usize);
const_assert!(MAX_CLASSES <= u64::BITS as usize);
const_assert!(MAX_WEIGHT >= 1);

/// Validate that all constants are properly configured
pub fn validate_constants() -> Result<(), &'static str> {
    if BATCH_LEN == 0 || BATCH_LEN > 64 {
        return Err("BATCH_LEN must be in (0, 64]");
    }

    if MAX_SOCK_MASK % MAX_SOCKETS != 0 {
        return Err("MAX_SOCK_MASK must be a multiple of MAX_SOCKETS");
    }

    if DEFAULT_PREFETCH_LEN == 0 || DEFAULT_PREFETCH_LEN > BATCH_LEN {
        return Err("DEFAULT_PREFETCH_LEN must be in [1, BATCH_LEN]");
    }

    if DEFAULT_CAP_LEN == 0 || DEFAULT_QUEUE_SLOTS == 0 {
        return Err("Capture length and queue slots must be greater than 0");
    }

    if !SLOT_ALIGNMENT.is_power_of_two() {
        return Err("SLOT_ALIGNMENT must be a power of 2");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_validation() {
        assert!(validate_constants().is_ok());
    }

    #[test]
    fn test_batch_fits_machine_word() {
        assert!(BATCH_LEN <= 64);
        assert!(MAX_SOCKETS <= 64);
    }

    #[test]
    fn test_weight_bounds() {
        assert_eq!(MAX_WEIGHT, MAX_SOCK_MASK / MAX_SOCKETS);
        assert!(MAX_WEIGHT >= 1);
    }

    #[test]
    fn test_class_masks() {
        assert_eq!(CLASS_DEFAULT & CLASS_MASK_ALL, CLASS_DEFAULT);
        assert_eq!(CLASS_MASK_ALL.count_ones() as usize, MAX_CLASSES);
    }
}
