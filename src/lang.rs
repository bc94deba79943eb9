//! Functional classifier programs.
//!
//! A compiled classifier is a sequence of tagged primitive nodes evaluated
//! by a single interpreter; there is no per-function dispatch at the data
//! structure level. The engine treats a program as opaque: it initializes a
//! [`Monad`], calls [`run`], and reads the resulting fanout decision. Side
//! effects are confined to the packet buffer, its forwarding log, and the
//! monad.
//!
//! Action flags steal/drop/pass/clone may be combined by a program; the
//! resolution precedence is fixed: steal > drop > pass > clone. `pass`
//! resolves to normal delivery (the kernel hand-off is recorded on the
//! forwarding log, not here).

use crate::bpf::BpfProgram;
use crate::constants::{ CLASS_DEFAULT, CLASS_MASK_ALL };
use crate::qbuff::Qbuff;

/// Endpoint context: which flow endpoints participate in steering hashes.
pub const EPOINT_SRC: u8 = 0b01;
pub const EPOINT_DST: u8 = 0b10;

/// IP protocol placeholder for "not parsed yet".
pub const IPPROTO_NONE: u8 = 255;

/// Fanout decision kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutKind {
    /// Drop the packet for this group.
    Drop,
    /// Broadcast to every eligible socket.
    #[default]
    Copy,
    /// Pick one socket from the weighted eligible set by hash.
    Steer,
    /// Pick two sockets, one per hash.
    DoubleSteer,
}

/// The classifier's output for one (packet, group) evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fanout {
    pub kind: FanoutKind,
    pub class_mask: u64,
    pub hash: u32,
    pub hash2: u32,
}

impl Fanout {
    #[inline]
    pub fn is_drop(&self) -> bool {
        self.kind == FanoutKind::Drop
    }

    #[inline]
    pub fn is_steering(&self) -> bool {
        matches!(self.kind, FanoutKind::Steer | FanoutKind::DoubleSteer)
    }

    #[inline]
    pub fn is_double_steering(&self) -> bool {
        self.kind == FanoutKind::DoubleSteer
    }
}

/// Action flags a program may raise during evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionFlags(u8);

impl ActionFlags {
    pub const STEAL: Self = Self(0b0001);
    pub const DROP: Self = Self(0b0010);
    pub const PASS: Self = Self(0b0100);
    pub const CLONE: Self = Self(0b1000);

    #[inline]
    pub fn set(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    #[inline]
    pub fn contains(&self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    /// Resolve combined flags to one effective disposition.
    ///
    /// Precedence: steal > drop > pass > clone. With no flag set the packet
    /// is delivered according to the fanout alone.
    pub fn resolve(&self) -> Disposition {
        if self.contains(Self::STEAL) {
            Disposition::Steal
        } else if self.contains(Self::DROP) {
            Disposition::Drop
        } else if self.contains(Self::PASS) {
            Disposition::Deliver
        } else if self.contains(Self::CLONE) {
            Disposition::Clone
        } else {
            Disposition::Deliver
        }
    }
}

/// Effective disposition of a packet after action resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Normal fan-out delivery.
    Deliver,
    /// Eligible sockets join the batch's socket mask, but the packet itself
    /// is not enqueued for this slot.
    Clone,
    /// Dropped for this group.
    Drop,
    /// A primitive took the packet; skip fan-out and kernel hand-off.
    Steal,
}

/// Per-evaluation scratch state shared between the engine and the program.
#[derive(Debug)]
pub struct Monad<'a> {
    pub fanout: Fanout,
    pub action: ActionFlags,
    /// Opaque state word, persisted to the buffer after the run.
    pub state: u64,
    pub shift: usize,
    pub ipoff: usize,
    pub ipproto: u8,
    pub ep_ctx: u8,
    /// Snapshot of the group's opaque state blob, if any.
    pub group_state: Option<&'a [u8]>,
}

impl<'a> Monad<'a> {
    /// The engine-side initial state for one (packet, group) evaluation.
    pub fn reset(group_state: Option<&'a [u8]>) -> Self {
        Self {
            fanout: Fanout {
                kind: FanoutKind::Copy,
                class_mask: CLASS_DEFAULT,
                hash: 0,
                hash2: 0,
            },
            action: ActionFlags::default(),
            state: 0,
            shift: 0,
            ipoff: 0,
            ipproto: IPPROTO_NONE,
            ep_ctx: EPOINT_SRC | EPOINT_DST,
            group_state,
        }
    }
}

/// One classifier primitive.
#[derive(Debug, Clone)]
pub enum Node {
    /// Select the classes this packet belongs to.
    Classify { class_mask: u64 },
    /// Steer by the big-endian word at an absolute packet offset.
    SteerWord { offset: u16 },
    /// Steer by a symmetric hash of the IPv4 addresses.
    SteerFlow,
    /// Double-steer by the words at two packet offsets.
    DoubleSteerWord { offset: u16, offset2: u16 },
    /// Broadcast to every eligible socket.
    Broadcast,
    /// Drop the packet for this group.
    DropPacket,
    /// Ask for kernel re-injection.
    Kernel,
    /// Record a lazy transmit towards an egress device.
    Forward { ifindex: u32 },
    /// Take ownership of the packet for this batch.
    Steal,
    /// Clone towards the eligible set.
    CloneAll,
    /// Apply the inner primitive only when the filter accepts the packet.
    When { filter: BpfProgram, then: Box<Node> },
}

/// A compiled classifier program.
#[derive(Debug, Clone, Default)]
pub struct Computation {
    nodes: Vec<Node>,
}

impl Computation {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// The identity program: default fanout, no side effects.
    pub fn unit() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn broadcast() -> Self {
        Self::new(vec![Node::Broadcast])
    }

    pub fn steer_word(offset: u16) -> Self {
        Self::new(vec![Node::SteerWord { offset }])
    }

    pub fn double_steer_word(offset: u16, offset2: u16) -> Self {
        Self::new(vec![Node::DoubleSteerWord { offset, offset2 }])
    }

    pub fn steer_flow() -> Self {
        Self::new(vec![Node::SteerFlow])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Verdict of one program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
}

/// Evaluate `comp` over `buff`.
///
/// Post-conditions: `monad.fanout` has a defined kind and class mask; a
/// steering kind carries its hash(es). A `Drop` verdict means "drop this
/// packet for this group".
pub fn run(buff: &mut Qbuff, comp: &Computation, monad: &mut Monad<'_>) -> Verdict {
    for node in &comp.nodes {
        eval(node, buff, monad);
        // Steal and drop terminate the chain.
        match monad.action.resolve() {
            Disposition::Steal | Disposition::Drop => {
                break;
            }
            _ => {}
        }
    }

    if monad.fanout.is_drop() || monad.action.resolve() == Disposition::Drop {
        Verdict::Drop
    } else {
        Verdict::Keep
    }
}

fn eval(node: &Node, buff: &mut Qbuff, monad: &mut Monad<'_>) {
    match node {
        Node::Classify { class_mask } => {
            monad.fanout.class_mask = class_mask & CLASS_MASK_ALL;
        }
        Node::SteerWord { offset } => {
            match load_word(&buff.packet.data, *offset as usize) {
                Some(word) => {
                    monad.fanout.kind = FanoutKind::Steer;
                    monad.fanout.hash = word;
                }
                None => {
                    monad.action.set(ActionFlags::DROP);
                }
            }
        }
        Node::SteerFlow => {
            match flow_hash(&buff.packet.data, monad) {
                Some(hash) => {
                    monad.fanout.kind = FanoutKind::Steer;
                    monad.fanout.hash = hash;
                }
                None => {
                    monad.action.set(ActionFlags::DROP);
                }
            }
        }
        Node::DoubleSteerWord { offset, offset2 } => {
            let first = load_word(&buff.packet.data, *offset as usize);
            let second = load_word(&buff.packet.data, *offset2 as usize);
            match (first, second) {
                (Some(hash), Some(hash2)) => {
                    monad.fanout.kind = FanoutKind::DoubleSteer;
                    monad.fanout.hash = hash;
                    monad.fanout.hash2 = hash2;
                }
                _ => {
                    monad.action.set(ActionFlags::DROP);
                }
            }
        }
        Node::Broadcast => {
            monad.fanout.kind = FanoutKind::Copy;
        }
        Node::DropPacket => {
            monad.fanout.kind = FanoutKind::Drop;
            monad.action.set(ActionFlags::DROP);
        }
        Node::Kernel => {
            buff.log.to_kernel += 1;
            monad.action.set(ActionFlags::PASS);
        }
        Node::Forward { ifindex } => {
            buff.log.push_dev(*ifindex);
        }
        Node::Steal => {
            monad.action.set(ActionFlags::STEAL);
        }
        Node::CloneAll => {
            monad.action.set(ActionFlags::CLONE);
        }
        Node::When { filter, then } => {
            if filter.run(&buff.packet.data) != 0 {
                eval(then, buff, monad);
            }
        }
    }
}

#[inline]
fn load_word(pkt: &[u8], offset: usize) -> Option<u32> {
    if offset + 4 > pkt.len() {
        return None;
    }
    Some(u32::from_be_bytes([pkt[offset], pkt[offset + 1], pkt[offset + 2], pkt[offset + 3]]))
}

/// Symmetric IPv4 flow hash over the endpoints selected by `ep_ctx`.
fn flow_hash(pkt: &[u8], monad: &mut Monad<'_>) -> Option<u32> {
    // Ethernet + IPv4 only.
    if pkt.len() < 34 || pkt[12] != 0x08 || pkt[13] != 0x00 {
        return None;
    }
    monad.ipoff = 14;
    monad.ipproto = pkt[23];

    let src = u32::from_be_bytes([pkt[26], pkt[27], pkt[28], pkt[29]]);
    let dst = u32::from_be_bytes([pkt[30], pkt[31], pkt[32], pkt[33]]);

    let mut hash = 0u32;
    if monad.ep_ctx & EPOINT_SRC != 0 {
        hash ^= src;
    }
    if monad.ep_ctx & EPOINT_DST != 0 {
        hash ^= dst;
    }
    Some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qbuff::RawPacket;

    fn buff_with(data: Vec<u8>) -> Qbuff {
        Qbuff::from_packet(RawPacket::new(data, 1, 0), false)
    }

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut pkt = vec![0u8; 64];
        pkt[12] = 0x08;
        pkt[13] = 0x00;
        pkt[14] = 0x45;
        pkt[23] = 17;
        pkt[26..30].copy_from_slice(&src);
        pkt[30..34].copy_from_slice(&dst);
        pkt
    }

    #[test]
    fn test_action_precedence() {
        // steal > drop > pass > clone, exhaustively over combinations.
        let all = [ActionFlags::STEAL, ActionFlags::DROP, ActionFlags::PASS, ActionFlags::CLONE];
        for bits in 0u8..16 {
            let mut flags = ActionFlags::default();
            for (i, flag) in all.iter().enumerate() {
                if bits & (1 << i) != 0 {
                    flags.set(*flag);
                }
            }
            let expected = if flags.contains(ActionFlags::STEAL) {
                Disposition::Steal
            } else if flags.contains(ActionFlags::DROP) {
                Disposition::Drop
            } else if flags.contains(ActionFlags::PASS) {
                Disposition::Deliver
            } else if flags.contains(ActionFlags::CLONE) {
                Disposition::Clone
            } else {
                Disposition::Deliver
            };
            assert_eq!(flags.resolve(), expected, "flags {:#06b}", bits);
        }
    }

    #[test]
    fn test_unit_program_keeps_default_fanout() {
        let mut buff = buff_with(vec![0u8; 32]);
        let mut monad = Monad::reset(None);
        let verdict = run(&mut buff, &Computation::unit(), &mut monad);
        assert_eq!(verdict, Verdict::Keep);
        assert_eq!(monad.fanout.kind, FanoutKind::Copy);
        assert_eq!(monad.fanout.class_mask, CLASS_DEFAULT);
    }

    #[test]
    fn test_steer_word_reads_packet() {
        let mut data = vec![0u8; 32];
        data[8..12].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        let mut buff = buff_with(data);
        let mut monad = Monad::reset(None);

        let verdict = run(&mut buff, &Computation::steer_word(8), &mut monad);
        assert_eq!(verdict, Verdict::Keep);
        assert_eq!(monad.fanout.kind, FanoutKind::Steer);
        assert_eq!(monad.fanout.hash, 0x1234_5678);
    }

    #[test]
    fn test_steer_word_out_of_bounds_drops() {
        let mut buff = buff_with(vec![0u8; 8]);
        let mut monad = Monad::reset(None);
        let verdict = run(&mut buff, &Computation::steer_word(100), &mut monad);
        assert_eq!(verdict, Verdict::Drop);
    }

    #[test]
    fn test_flow_hash_is_symmetric() {
        let mut fwd = buff_with(ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]));
        let mut rev = buff_with(ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1]));

        let mut m1 = Monad::reset(None);
        let mut m2 = Monad::reset(None);
        assert_eq!(run(&mut fwd, &Computation::steer_flow(), &mut m1), Verdict::Keep);
        assert_eq!(run(&mut rev, &Computation::steer_flow(), &mut m2), Verdict::Keep);
        assert_eq!(m1.fanout.hash, m2.fanout.hash);
        assert_eq!(m1.ipproto, 17);
    }

    #[test]
    fn test_flow_hash_non_ip_drops() {
        let mut buff = buff_with(vec![0u8; 64]);
        let mut monad = Monad::reset(None);
        assert_eq!(run(&mut buff, &Computation::steer_flow(), &mut monad), Verdict::Drop);
    }

    #[test]
    fn test_kernel_records_log_and_passes() {
        let mut buff = buff_with(vec![0u8; 32]);
        let mut monad = Monad::reset(None);
        let comp = Computation::new(vec![Node::Kernel]);
        assert_eq!(run(&mut buff, &comp, &mut monad), Verdict::Keep);
        assert_eq!(buff.log.to_kernel, 1);
        assert_eq!(monad.action.resolve(), Disposition::Deliver);
    }

    #[test]
    fn test_steal_terminates_chain() {
        let mut buff = buff_with(vec![0u8; 32]);
        let mut monad = Monad::reset(None);
        let comp = Computation::new(vec![Node::Steal, Node::Kernel]);
        run(&mut buff, &comp, &mut monad);
        assert_eq!(monad.action.resolve(), Disposition::Steal);
        // The chain stopped before the kernel primitive.
        assert_eq!(buff.log.to_kernel, 0);
    }

    #[test]
    fn test_when_gates_on_filter() {
        let comp = Computation::new(
            vec![Node::When {
                filter: crate::bpf::BpfProgram::reject_udp_dst_port(5060),
                then: Box::new(Node::Kernel),
            }]
        );

        // Non-matching packet passes the filter, so the inner node runs.
        let mut buff = buff_with(ipv4_packet([1, 1, 1, 1], [2, 2, 2, 2]));
        let mut monad = Monad::reset(None);
        run(&mut buff, &comp, &mut monad);
        assert_eq!(buff.log.to_kernel, 1);
    }

    #[test]
    fn test_classify_masks_invalid_classes() {
        let mut buff = buff_with(vec![0u8; 32]);
        let mut monad = Monad::reset(None);
        let comp = Computation::new(vec![Node::Classify { class_mask: u64::MAX }]);
        run(&mut buff, &comp, &mut monad);
        assert_eq!(monad.fanout.class_mask, CLASS_MASK_ALL);
    }
}
