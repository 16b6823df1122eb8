//! Error taxonomy of the core.
//!
//! A [`Fault`] is raised by an instruction and is visible to the guest: the driver turns it into an
//! interrupt. A [`CpuError`] that is not a fault stops the emulation loop and is reported to the host.

use crate::address::SegmentedAddress;
use thiserror::Error;

/// CPU exceptions redispatched to the guest as interrupts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("division error: {0}")]
    DivisionError(String),
    #[error("invalid opcode {opcode:#04X}")]
    InvalidOpcode { opcode: u16 },
    #[error("invalid group index {index} for opcode {opcode:#04X}")]
    InvalidGroupIndex { opcode: u16, index: u8 },
}

impl Fault {
    /// Interrupt vector the fault is delivered through
    pub fn vector(&self) -> u8 {
        match self {
            Fault::DivisionError(_) => 0,
            Fault::InvalidOpcode { .. } | Fault::InvalidGroupIndex { .. } => 6,
        }
    }

    pub fn is_invalid_opcode(&self) -> bool {
        matches!(
            self,
            Fault::InvalidOpcode { .. } | Fault::InvalidGroupIndex { .. }
        )
    }
}

/// Everything an instruction or the driver can fail with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("return at {address} with no matching call (context depth {depth})")]
    ContextStackUnderflow {
        address: SegmentedAddress,
        depth: u32,
    },
    #[error("interrupt {vector:#04X} raised at {address} but its vector is 0000:0000")]
    UninitializedInterruptVector {
        vector: u8,
        address: SegmentedAddress,
    },
    #[error("no callback registered for number {number:#06X} (at {address})")]
    UnknownCallback {
        number: u16,
        address: SegmentedAddress,
    },
    #[error("{fault} at {address} (strict mode)")]
    UnhandledFault {
        fault: Fault,
        address: SegmentedAddress,
    },
    #[error("graph node handle is stale")]
    NodeNotFound,
}

impl CpuError {
    /// True for errors that end emulation
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CpuError::Fault(_))
    }
}

/// Failure to load a [`crate::config::CpuConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
