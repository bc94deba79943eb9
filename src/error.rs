//! Error types for steerq.
//!
//! Control-plane calls fail with a precise typed error and leave no partial
//! state behind. The capture path itself never returns per-packet errors;
//! packet-level failures degrade to drop/lost counters.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SteerError>;

#[derive(Error, Debug)]
pub enum SteerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("invalid group id: {gid}")]
    InvalidGroup { gid: isize },

    #[error("invalid class mask: {mask:#x}")]
    InvalidClassMask { mask: u64 },

    #[error("invalid socket id: {sid}")]
    InvalidSocket { sid: usize },

    #[error("invalid vlan id: {vid}")]
    InvalidVlanId { vid: i32 },

    #[error("permission denied for group {gid}")]
    PermissionDenied { gid: usize },

    #[error("no free socket id available")]
    NoFreeId,

    #[error("no free group available")]
    NoFreeGroup,

    #[error("socket queue is disabled")]
    QueueDisabled,

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("invalid filter program: {reason}")]
    InvalidFilter { reason: String },
}

impl SteerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn invalid_filter(reason: impl Into<String>) -> Self {
        Self::InvalidFilter { reason: reason.into() }
    }
}
