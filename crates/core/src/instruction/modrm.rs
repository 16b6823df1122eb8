//! ModRM/SIB addressing.

use super::field::FieldRef;
use super::node::CfgInstruction;
use crate::bus::Memory;
use crate::state::{CpuState, SegReg, REG_BP, REG_BX, REG_DI, REG_SI, REG_SP};

/// Scaled-index byte of 32-bit addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sib {
    pub scale: u8,
    /// `None` when the index field is 4
    pub index: Option<u8>,
    /// `None` for the disp32-only form (base 5 with mod 0)
    pub base: Option<u8>,
}

impl Sib {
    pub fn from_byte(byte: u8, mode: u8) -> Self {
        let index = (byte >> 3) & 7;
        let base = byte & 7;
        Self {
            scale: byte >> 6,
            index: (index != 4).then_some(index),
            base: (!(base == 5 && mode == 0)).then_some(base),
        }
    }
}

/// A decoded ModRM operand.
///
/// The segment is final: the default for the addressing form with any override prefix applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
    pub address_size_32: bool,
    pub sib: Option<Sib>,
    pub displacement: Option<FieldRef>,
    pub segment: SegReg,
}

/// Where an r/m operand lives, resolved once per execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    Register(u8),
    Memory { segment: u16, offset: u32 },
}

impl RmOperand {
    /// Same operand, `delta` bytes further (memory only)
    pub fn offset_by(self, delta: i32) -> Self {
        match self {
            RmOperand::Memory { segment, offset } => RmOperand::Memory {
                segment,
                offset: offset.wrapping_add(delta as u32),
            },
            register => register,
        }
    }
}

impl ModRm {
    /// Split a ModRM byte into `(mod, reg, rm)`
    #[inline]
    pub fn split(byte: u8) -> (u8, u8, u8) {
        (byte >> 6, (byte >> 3) & 7, byte & 7)
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        self.mode == 3
    }

    /// Segment used when no override is present
    pub fn default_segment(mode: u8, rm: u8, address_size_32: bool, sib: Option<Sib>) -> SegReg {
        if mode == 3 {
            return SegReg::Ds;
        }
        let stack_based = if address_size_32 {
            match (rm, sib) {
                (4, Some(sib)) => matches!(sib.base, Some(b) if b == REG_SP || b == REG_BP),
                (5, _) => mode != 0,
                _ => false,
            }
        } else {
            matches!(rm, 2 | 3) || (rm == 6 && mode != 0)
        };
        if stack_based {
            SegReg::Ss
        } else {
            SegReg::Ds
        }
    }

    /// Effective address offset: 16-bit forms wrap at 64 KiB
    pub fn effective_offset(
        &self,
        node: &CfgInstruction,
        memory: &dyn Memory,
        state: &CpuState,
    ) -> u32 {
        let disp = self
            .displacement
            .map(|field| node.signed(memory, field) as u32)
            .unwrap_or(0);
        if self.address_size_32 {
            let base = match (self.rm, self.sib) {
                (4, Some(sib)) => {
                    let base = sib.base.map(|b| state.reg32(b)).unwrap_or(0);
                    let index = sib
                        .index
                        .map(|i| state.reg32(i) << sib.scale)
                        .unwrap_or(0);
                    base.wrapping_add(index)
                }
                (5, _) if self.mode == 0 => 0,
                (rm, _) => state.reg32(rm),
            };
            base.wrapping_add(disp)
        } else {
            let bx = state.reg16(REG_BX);
            let bp = state.reg16(REG_BP);
            let si = state.reg16(REG_SI);
            let di = state.reg16(REG_DI);
            let base = match self.rm {
                0 => bx.wrapping_add(si),
                1 => bx.wrapping_add(di),
                2 => bp.wrapping_add(si),
                3 => bp.wrapping_add(di),
                4 => si,
                5 => di,
                6 if self.mode == 0 => 0,
                6 => bp,
                _ => bx,
            };
            base.wrapping_add(disp as u16) as u32
        }
    }

    /// Register number or segment and offset of the operand
    pub fn resolve(
        &self,
        node: &CfgInstruction,
        memory: &dyn Memory,
        state: &CpuState,
    ) -> RmOperand {
        if self.is_register() {
            RmOperand::Register(self.rm)
        } else {
            RmOperand::Memory {
                segment: state.segment(self.segment),
                offset: self.effective_offset(node, memory, state),
            }
        }
    }
}
