//! Instruction prefixes.

use crate::state::{CpuModel, SegReg};

/// Repeat prefix of string instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepKind {
    /// F3: REP, or REPE/REPZ for CMPS/SCAS
    Rep,
    /// F2: REPNE/REPNZ
    Repne,
}

impl RepKind {
    /// ZF value that keeps a CMPS/SCAS loop going
    pub fn continue_while_zero(self) -> bool {
        matches!(self, RepKind::Rep)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
    SegmentOverride(SegReg),
    OperandSize,
    AddressSize,
    Rep(RepKind),
    Lock,
}

impl Prefix {
    /// The prefix encoded by `byte`, if `model` has it
    pub fn from_byte(byte: u8, model: CpuModel) -> Option<Self> {
        let prefix = match byte {
            0x26 => Prefix::SegmentOverride(SegReg::Es),
            0x2E => Prefix::SegmentOverride(SegReg::Cs),
            0x36 => Prefix::SegmentOverride(SegReg::Ss),
            0x3E => Prefix::SegmentOverride(SegReg::Ds),
            0xF0 => Prefix::Lock,
            0xF2 => Prefix::Rep(RepKind::Repne),
            0xF3 => Prefix::Rep(RepKind::Rep),
            0x64 | 0x65 | 0x66 | 0x67 if !model.supports_80386_instructions() => return None,
            0x64 => Prefix::SegmentOverride(SegReg::Fs),
            0x65 => Prefix::SegmentOverride(SegReg::Gs),
            0x66 => Prefix::OperandSize,
            0x67 => Prefix::AddressSize,
            _ => return None,
        };
        Some(prefix)
    }
}

/// What a list of prefixes amounts to once all of them were read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrefixSummary {
    /// Last segment override wins
    pub segment_override: Option<SegReg>,
    pub operand_size_32: bool,
    pub address_size_32: bool,
    /// Last repeat prefix wins
    pub rep: Option<RepKind>,
    pub lock: bool,
}

impl PrefixSummary {
    pub fn from_prefixes(prefixes: &[Prefix]) -> Self {
        let mut summary = Self::default();
        for prefix in prefixes {
            match *prefix {
                Prefix::SegmentOverride(seg) => summary.segment_override = Some(seg),
                Prefix::OperandSize => summary.operand_size_32 = true,
                Prefix::AddressSize => summary.address_size_32 = true,
                Prefix::Rep(kind) => summary.rep = Some(kind),
                Prefix::Lock => summary.lock = true,
            }
        }
        summary
    }

    /// `default` unless a segment override is present
    pub fn segment_or(&self, default: SegReg) -> SegReg {
        self.segment_override.unwrap_or(default)
    }
}
