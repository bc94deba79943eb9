//! steerq - User-space packet capture and steering engine
//!
//! A per-CPU batch pipeline that demultiplexes captured packets to groups,
//! evaluates per-group byte-code filters and functional classifiers, and
//! fans payloads out to consumer sockets through shared-memory slot rings.

pub mod bits;
pub mod bpf;
pub mod config;
pub mod constants;
pub mod devmap;
pub mod engine;
pub mod error;
pub mod group;
pub mod lang;
pub mod percpu;
pub mod pool;
pub mod qbuff;
pub mod socket;
pub mod sock_queue;
pub mod stats;

// Re-export main components
pub use config::EngineConfig;
pub use engine::{ Engine, EgressHook, KernelHook, NullKernel, SinkEgress };
pub use error::{ Result, SteerError };
pub use group::GroupPolicy;
pub use lang::{ Computation, Fanout, FanoutKind, Node };
pub use qbuff::{ PacketDirection, Qbuff, RawPacket };
pub use sock_queue::CapturedSlot;
pub use stats::{ GlobalStats, GroupStats, SockStats };

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation() {
        let config = EngineConfig::new(1).unwrap();
        let engine = Engine::new(config);
        assert!(engine.is_ok());
    }

    #[test]
    fn test_capture_roundtrip() {
        let engine = Engine::new(EngineConfig::new(1).unwrap()).unwrap();

        let sid = engine.socket_open().unwrap();
        engine.toggle_queue(sid, true).unwrap();
        let gid = engine.group_join(sid, None, 1, GroupPolicy::Shared).unwrap();
        engine.bind(sid, gid, 1, -1).unwrap();

        engine.receive(0, RawPacket::new(vec![0u8; 60], 1, 0), false).unwrap();

        let slots = engine.read_batch(sid, 8).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].len, 60);
    }
}
