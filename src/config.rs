//! Engine configuration.
//!
//! The configuration mirrors the original module-load parameters: capture
//! admission switches, default socket geometry, prefetch depth and flow
//! control. Values are validated up front so the engine never has to check
//! them on the capture path.

use std::time::Duration;

use serde::{ Deserialize, Serialize };

use crate::constants::{
    BATCH_LEN,
    DEFAULT_CAP_LEN,
    DEFAULT_FLOW_CONTROL,
    DEFAULT_FLUSH_PERIOD_MS,
    DEFAULT_PREFETCH_LEN,
    DEFAULT_QUEUE_SLOTS,
};
use crate::error::{ Result, SteerError };

/// Configuration for the capture engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of CPUs (per-CPU pipelines) the engine runs.
    pub cpus: usize,
    /// Deliver packets straight from capable sources, bypassing the kernel path.
    pub direct_capture: bool,
    /// Admit incoming packets at the receive hook.
    pub sniff_incoming: bool,
    /// Admit outgoing packets at the receive hook.
    pub sniff_outgoing: bool,
    /// Admit loopback packets at the receive hook.
    pub sniff_loopback: bool,
    /// Default capture length for new sockets (bytes).
    pub cap_len: usize,
    /// Default slot count for new socket queues.
    pub queue_slots: usize,
    /// Packets buffered per CPU before a batch runs.
    pub prefetch_len: usize,
    /// After a socket queue overflows, drop this many packets at the hook.
    pub flow_control: u32,
    /// Period of the per-CPU flush timer.
    pub flush_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpus: num_cpus::get(),
            direct_capture: false,
            sniff_incoming: true,
            sniff_outgoing: false,
            sniff_loopback: false,
            cap_len: DEFAULT_CAP_LEN,
            queue_slots: DEFAULT_QUEUE_SLOTS,
            prefetch_len: DEFAULT_PREFETCH_LEN,
            flow_control: DEFAULT_FLOW_CONTROL,
            flush_period: Duration::from_millis(DEFAULT_FLUSH_PERIOD_MS),
        }
    }
}

impl EngineConfig {
    /// Create a configuration for the given number of CPUs.
    pub fn new(cpus: usize) -> Result<Self> {
        if cpus == 0 {
            return Err(SteerError::config("cpus must be greater than 0"));
        }
        Ok(Self { cpus, ..Default::default() })
    }

    /// Set the prefetch length (batch trigger depth).
    pub fn with_prefetch_len(mut self, prefetch_len: usize) -> Result<Self> {
        if prefetch_len == 0 || prefetch_len > BATCH_LEN {
            return Err(
                SteerError::config(
                    format!("prefetch_len must be in [1, {}], got {}", BATCH_LEN, prefetch_len)
                )
            );
        }
        self.prefetch_len = prefetch_len;
        Ok(self)
    }

    /// Set the default capture length for new sockets.
    pub fn with_cap_len(mut self, cap_len: usize) -> Result<Self> {
        if cap_len == 0 {
            return Err(SteerError::config("cap_len must be greater than 0"));
        }
        self.cap_len = cap_len;
        Ok(self)
    }

    /// Set the default slot count for new socket queues.
    pub fn with_queue_slots(mut self, queue_slots: usize) -> Result<Self> {
        if queue_slots == 0 {
            return Err(SteerError::config("queue_slots must be greater than 0"));
        }
        self.queue_slots = queue_slots;
        Ok(self)
    }

    /// Enable direct capture from monitored devices.
    pub fn with_direct_capture(mut self, enable: bool) -> Self {
        self.direct_capture = enable;
        self
    }

    /// Select which packet directions the hook admits.
    pub fn with_sniffing(mut self, incoming: bool, outgoing: bool, loopback: bool) -> Self {
        self.sniff_incoming = incoming;
        self.sniff_outgoing = outgoing;
        self.sniff_loopback = loopback;
        self
    }

    /// Set the flow control value (0 disables flow control).
    pub fn with_flow_control(mut self, flow_control: u32) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Set the flush timer period.
    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.cpus >= 1);
        assert_eq!(config.cap_len, DEFAULT_CAP_LEN);
        assert_eq!(config.queue_slots, DEFAULT_QUEUE_SLOTS);
        assert_eq!(config.prefetch_len, 1);
        assert!(config.sniff_incoming);
        assert!(!config.sniff_outgoing);
        assert!(!config.sniff_loopback);
        assert!(!config.direct_capture);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new(2)
            .unwrap()
            .with_prefetch_len(32)
            .unwrap()
            .with_cap_len(256)
            .unwrap()
            .with_flow_control(8)
            .with_sniffing(true, true, false);

        assert_eq!(config.cpus, 2);
        assert_eq!(config.prefetch_len, 32);
        assert_eq!(config.cap_len, 256);
        assert_eq!(config.flow_control, 8);
        assert!(config.sniff_outgoing);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(EngineConfig::new(0).is_err());
        assert!(EngineConfig::default().with_prefetch_len(0).is_err());
        assert!(EngineConfig::default().with_prefetch_len(BATCH_LEN + 1).is_err());
        assert!(EngineConfig::default().with_cap_len(0).is_err());
        assert!(EngineConfig::default().with_queue_slots(0).is_err());
    }
}
