//! Packet buffers.
//!
//! A [`RawPacket`] is what the capture source hands in: raw bytes plus
//! ingress metadata. A [`Qbuff`] wraps one raw packet with the scratch
//! fields the pipeline needs while the packet is in flight: the group
//! membership mask filled at batch entry, the per-CPU sequence counter, an
//! opaque state word carried across classifier invocations, and the
//! forwarding log. Qbuffs are owned exclusively by the per-batch arena and
//! never survive a batch boundary.

use crate::constants::MAX_FWD_DEVS;

/// Direction of a captured packet relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketDirection {
    #[default]
    Incoming,
    Outgoing,
    Loopback,
}

/// A captured packet as delivered by the packet source.
#[derive(Debug, Clone, Default)]
pub struct RawPacket {
    /// Raw packet bytes, starting at the link-layer header.
    pub data: Vec<u8>,
    /// Ingress interface index.
    pub ifindex: u32,
    /// Hardware receive queue the packet arrived on.
    pub rx_queue: u16,
    /// VLAN tag control information (0 when untagged).
    pub vlan_tci: u16,
    /// Packet direction at the capture point.
    pub direction: PacketDirection,
    /// Capture timestamp in nanoseconds since the epoch (0 = not stamped).
    pub tstamp: u64,
}

impl RawPacket {
    pub fn new(data: Vec<u8>, ifindex: u32, rx_queue: u16) -> Self {
        Self { data, ifindex, rx_queue, ..Default::default() }
    }

    /// VLAN id of the packet, 0 when untagged.
    #[inline]
    pub fn vlan_vid(&self) -> u16 {
        self.vlan_tci & 0x0fff
    }
}

/// Record of forwarding decisions made by the classifier for one packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardLog {
    /// How many times the classifier asked for kernel re-injection.
    pub to_kernel: usize,
    /// Number of egress devices recorded.
    pub num_devs: usize,
    /// Egress device indices, valid up to `num_devs`.
    pub devs: [u32; MAX_FWD_DEVS],
}

impl ForwardLog {
    /// Record a lazy transmit towards `ifindex`. Silently saturates when the
    /// device log is full.
    #[inline]
    pub fn push_dev(&mut self, ifindex: u32) {
        if self.num_devs < MAX_FWD_DEVS {
            self.devs[self.num_devs] = ifindex;
            self.num_devs += 1;
        }
    }

    #[inline]
    pub fn devs(&self) -> &[u32] {
        &self.devs[..self.num_devs]
    }
}

/// One in-flight packet with its pipeline scratch state.
#[derive(Debug, Default)]
pub struct Qbuff {
    /// The captured packet.
    pub packet: RawPacket,
    /// Bitmask of groups interested in this packet, filled at batch entry.
    pub group_mask: u64,
    /// Per-CPU monotonically increasing sequence number.
    pub counter: u64,
    /// Opaque state word carried across classifier invocations.
    pub state: u64,
    /// Forwarding record.
    pub log: ForwardLog,
    /// Packet was delivered by the direct-capture path.
    pub direct: bool,
    /// A classifier took ownership of the packet for this batch.
    pub stolen: bool,
}

impl Qbuff {
    pub fn from_packet(packet: RawPacket, direct: bool) -> Self {
        Self { packet, direct, ..Default::default() }
    }

    /// Clear scratch state and drop the payload, keeping the allocation for
    /// reuse by the pool.
    pub fn recycle(&mut self) {
        self.packet.data.clear();
        self.packet.ifindex = 0;
        self.packet.rx_queue = 0;
        self.packet.vlan_tci = 0;
        self.packet.direction = PacketDirection::Incoming;
        self.packet.tstamp = 0;
        self.group_mask = 0;
        self.counter = 0;
        self.state = 0;
        self.log = ForwardLog::default();
        self.direct = false;
        self.stolen = false;
    }

    #[inline]
    pub fn ifindex(&self) -> u32 {
        self.packet.ifindex
    }

    #[inline]
    pub fn rx_queue(&self) -> u16 {
        self.packet.rx_queue
    }

    /// True when the classifier asked for kernel re-injection.
    #[inline]
    pub fn fwd_to_kernel(&self) -> bool {
        self.log.to_kernel > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_vid_masks_tci() {
        let mut pkt = RawPacket::new(vec![0u8; 64], 1, 0);
        pkt.vlan_tci = 0x3000 | 100;
        assert_eq!(pkt.vlan_vid(), 100);
    }

    #[test]
    fn test_forward_log_saturates() {
        let mut log = ForwardLog::default();
        for i in 0..(MAX_FWD_DEVS as u32 + 4) {
            log.push_dev(i);
        }
        assert_eq!(log.num_devs, MAX_FWD_DEVS);
        assert_eq!(log.devs().len(), MAX_FWD_DEVS);
    }

    #[test]
    fn test_recycle_keeps_allocation() {
        let mut buff = Qbuff::from_packet(RawPacket::new(vec![1u8; 128], 3, 1), true);
        buff.state = 42;
        buff.log.to_kernel = 1;
        let cap = buff.packet.data.capacity();
        buff.recycle();
        assert_eq!(buff.packet.data.len(), 0);
        assert_eq!(buff.packet.data.capacity(), cap);
        assert_eq!(buff.state, 0);
        assert!(!buff.fwd_to_kernel());
        assert!(!buff.direct);
    }
}
