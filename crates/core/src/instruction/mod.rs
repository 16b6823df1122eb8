//! Instruction model: fields, prefixes, addressing and the operation catalog.

pub mod field;
pub mod modrm;
pub mod node;
pub mod operation;
pub mod prefix;

pub use field::{FieldKind, FieldRef, InstructionField};
pub use modrm::{ModRm, RmOperand, Sib};
pub use node::CfgInstruction;
pub use operation::{
    AluOp, BitOp, FlowKind, Imm, LoopKind, Operation, ShiftCount, ShiftOp, StringOp,
};
pub use prefix::{Prefix, PrefixSummary, RepKind};

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_LENGTH: usize = 15;
