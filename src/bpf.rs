//! Byte-code packet filter.
//!
//! A deliberately small classic-BPF-style instruction set: absolute loads
//! into an accumulator, compare-and-branch, and accept/reject returns. The
//! compiled form is opaque to the engine core, which only asks "does this
//! packet pass". A return value of 0 rejects the packet; any other value is
//! the accept length.
//!
//! Programs are validated at construction: every jump must land inside the
//! program and move forward, so the interpreter needs no runtime bounds or
//! termination checks beyond the instruction walk itself.

use crate::error::{ Result, SteerError };

/// One filter instruction. Jump offsets are relative to the next
/// instruction, forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// Load the byte at absolute offset into the accumulator.
    LdB(u16),
    /// Load the big-endian half word at absolute offset.
    LdH(u16),
    /// Load the big-endian word at absolute offset.
    LdW(u16),
    /// Accumulator &= k.
    AndK(u32),
    /// Branch: if accumulator == k skip `jt` instructions, else skip `jf`.
    JeqK { k: u32, jt: u8, jf: u8 },
    /// Branch: if accumulator > k skip `jt` instructions, else skip `jf`.
    JgtK { k: u32, jt: u8, jf: u8 },
    /// Return the constant k (0 rejects the packet).
    RetK(u32),
    /// Return the accumulator.
    RetA,
}

/// A validated filter program.
#[derive(Debug, Clone)]
pub struct BpfProgram {
    insns: Vec<Insn>,
}

impl BpfProgram {
    /// Validate and wrap an instruction sequence.
    pub fn new(insns: Vec<Insn>) -> Result<Self> {
        if insns.is_empty() {
            return Err(SteerError::invalid_filter("empty program"));
        }
        let len = insns.len();
        for (pc, insn) in insns.iter().enumerate() {
            if let Insn::JeqK { jt, jf, .. } | Insn::JgtK { jt, jf, .. } = insn {
                if pc + 1 + (*jt as usize) >= len || pc + 1 + (*jf as usize) >= len {
                    return Err(
                        SteerError::invalid_filter(format!("jump out of range at pc {}", pc))
                    );
                }
            }
        }
        match insns[len - 1] {
            Insn::RetK(_) | Insn::RetA => {}
            _ => {
                return Err(SteerError::invalid_filter("program does not end with a return"));
            }
        }
        Ok(Self { insns })
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Run the program over `pkt`. Returns the accept length; 0 rejects.
    ///
    /// Loads beyond the packet end reject the packet, matching the classic
    /// out-of-bounds semantics.
    pub fn run(&self, pkt: &[u8]) -> u32 {
        let mut acc: u32 = 0;
        let mut pc = 0usize;

        while pc < self.insns.len() {
            match self.insns[pc] {
                Insn::LdB(off) => {
                    let off = off as usize;
                    match pkt.get(off) {
                        Some(&b) => {
                            acc = b as u32;
                        }
                        None => {
                            return 0;
                        }
                    }
                }
                Insn::LdH(off) => {
                    let off = off as usize;
                    if off + 2 > pkt.len() {
                        return 0;
                    }
                    acc = u16::from_be_bytes([pkt[off], pkt[off + 1]]) as u32;
                }
                Insn::LdW(off) => {
                    let off = off as usize;
                    if off + 4 > pkt.len() {
                        return 0;
                    }
                    acc = u32::from_be_bytes([pkt[off], pkt[off + 1], pkt[off + 2], pkt[off + 3]]);
                }
                Insn::AndK(k) => {
                    acc &= k;
                }
                Insn::JeqK { k, jt, jf } => {
                    pc += 1 + (if acc == k { jt } else { jf }) as usize;
                    continue;
                }
                Insn::JgtK { k, jt, jf } => {
                    pc += 1 + (if acc > k { jt } else { jf }) as usize;
                    continue;
                }
                Insn::RetK(k) => {
                    return k;
                }
                Insn::RetA => {
                    return acc;
                }
            }
            pc += 1;
        }

        0
    }

    /// Accept everything.
    pub fn accept_all() -> Self {
        Self { insns: vec![Insn::RetK(u32::MAX)] }
    }

    /// Reject IPv4/UDP packets whose destination port equals `port`; accept
    /// everything else. Assumes an Ethernet frame with a 20-byte IP header.
    pub fn reject_udp_dst_port(port: u16) -> Self {
        Self {
            insns: vec![
                Insn::LdH(12), // ethertype
                Insn::JeqK { k: 0x0800, jt: 0, jf: 5 },
                Insn::LdB(23), // ip protocol
                Insn::JeqK { k: 17, jt: 0, jf: 3 },
                Insn::LdH(36), // udp destination port
                Insn::JeqK { k: port as u32, jt: 0, jf: 1 },
                Insn::RetK(0),
                Insn::RetK(u32::MAX)
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ethernet + IPv4 (no options) + UDP header with the given ports.
    fn udp_packet(dst_port: u16) -> Vec<u8> {
        let mut pkt = vec![0u8; 64];
        pkt[12] = 0x08;
        pkt[13] = 0x00; // IPv4
        pkt[14] = 0x45; // version + IHL
        pkt[23] = 17; // UDP
        pkt[34..36].copy_from_slice(&5000u16.to_be_bytes());
        pkt[36..38].copy_from_slice(&dst_port.to_be_bytes());
        pkt
    }

    #[test]
    fn test_reject_udp_dst_port() {
        let filter = BpfProgram::reject_udp_dst_port(5060);
        assert_eq!(filter.run(&udp_packet(5060)), 0);
        assert_ne!(filter.run(&udp_packet(8000)), 0);
    }

    #[test]
    fn test_non_ip_passes_port_filter() {
        let filter = BpfProgram::reject_udp_dst_port(5060);
        let mut arp = vec![0u8; 64];
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert_ne!(filter.run(&arp), 0);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let filter = BpfProgram::new(vec![Insn::LdW(60), Insn::RetA]).unwrap();
        assert_eq!(filter.run(&[0u8; 16]), 0);
    }

    #[test]
    fn test_accept_all() {
        assert_ne!(BpfProgram::accept_all().run(&[]), 0);
    }

    #[test]
    fn test_validation_rejects_bad_programs() {
        assert!(BpfProgram::new(vec![]).is_err());
        assert!(BpfProgram::new(vec![Insn::LdB(0)]).is_err());
        assert!(
            BpfProgram::new(vec![Insn::JeqK { k: 0, jt: 5, jf: 0 }, Insn::RetK(1)]).is_err()
        );
    }

    #[test]
    fn test_and_and_ret_a() {
        let prg = BpfProgram::new(vec![Insn::LdB(0), Insn::AndK(0x0f), Insn::RetA]).unwrap();
        assert_eq!(prg.run(&[0xabu8]), 0x0b);
    }
}
