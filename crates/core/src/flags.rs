//! FLAGS register.
//!
//! Each flag is an independent boolean while instructions run; the packed 16/32-bit form only exists
//! at the PUSHF/POPF/LAHF/SAHF/interrupt boundary.

use serde::{Deserialize, Serialize};

// Flag bit positions in FLAGS register
pub const FLAG_CF: u32 = 0x0001; // Carry Flag
pub const FLAG_RESERVED: u32 = 0x0002; // Always reads as 1
pub const FLAG_PF: u32 = 0x0004; // Parity Flag
pub const FLAG_AF: u32 = 0x0010; // Auxiliary Carry Flag
pub const FLAG_ZF: u32 = 0x0040; // Zero Flag
pub const FLAG_SF: u32 = 0x0080; // Sign Flag
pub const FLAG_TF: u32 = 0x0100; // Trap Flag
pub const FLAG_IF: u32 = 0x0200; // Interrupt Enable Flag
pub const FLAG_DF: u32 = 0x0400; // Direction Flag
pub const FLAG_OF: u32 = 0x0800; // Overflow Flag

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    pub carry: bool,
    pub parity: bool,
    pub auxiliary: bool,
    pub zero: bool,
    pub sign: bool,
    pub trap: bool,
    pub interrupt: bool,
    pub direction: bool,
    pub overflow: bool,
}

impl Flags {
    /// Unpack from a FLAGS/EFLAGS value; unknown bits are dropped
    pub fn from_bits(value: u32) -> Self {
        let mut flags = Self::default();
        flags.set_bits(value);
        flags
    }

    /// Packed value, with the reserved bit 1 set
    pub fn bits(&self) -> u32 {
        let mut value = FLAG_RESERVED;
        for (set, bit) in [
            (self.carry, FLAG_CF),
            (self.parity, FLAG_PF),
            (self.auxiliary, FLAG_AF),
            (self.zero, FLAG_ZF),
            (self.sign, FLAG_SF),
            (self.trap, FLAG_TF),
            (self.interrupt, FLAG_IF),
            (self.direction, FLAG_DF),
            (self.overflow, FLAG_OF),
        ] {
            if set {
                value |= bit;
            }
        }
        value
    }

    #[inline]
    pub fn bits16(&self) -> u16 {
        self.bits() as u16
    }

    pub fn set_bits(&mut self, value: u32) {
        self.carry = value & FLAG_CF != 0;
        self.parity = value & FLAG_PF != 0;
        self.auxiliary = value & FLAG_AF != 0;
        self.zero = value & FLAG_ZF != 0;
        self.sign = value & FLAG_SF != 0;
        self.trap = value & FLAG_TF != 0;
        self.interrupt = value & FLAG_IF != 0;
        self.direction = value & FLAG_DF != 0;
        self.overflow = value & FLAG_OF != 0;
    }

    /// Low byte as LAHF sees it: SF ZF 0 AF 0 PF 1 CF
    pub fn low_byte(&self) -> u8 {
        (self.bits() & 0xFF) as u8
    }

    /// SAHF: only SF, ZF, AF, PF and CF are taken from `value`
    pub fn set_low_byte(&mut self, value: u8) {
        let value = value as u32;
        self.carry = value & FLAG_CF != 0;
        self.parity = value & FLAG_PF != 0;
        self.auxiliary = value & FLAG_AF != 0;
        self.zero = value & FLAG_ZF != 0;
        self.sign = value & FLAG_SF != 0;
    }

    /// Condition codes 0-F as used by Jcc, SETcc and LOOPcc:
    /// O, NO, B, NB, E, NE, BE, NBE, S, NS, P, NP, L, NL, LE, NLE
    #[inline]
    pub fn condition(&self, cc: u8) -> bool {
        match cc & 0x0F {
            0x0 => self.overflow,
            0x1 => !self.overflow,
            0x2 => self.carry,
            0x3 => !self.carry,
            0x4 => self.zero,
            0x5 => !self.zero,
            0x6 => self.carry || self.zero,
            0x7 => !self.carry && !self.zero,
            0x8 => self.sign,
            0x9 => !self.sign,
            0xA => self.parity,
            0xB => !self.parity,
            0xC => self.sign != self.overflow,
            0xD => self.sign == self.overflow,
            0xE => self.zero || (self.sign != self.overflow),
            _ => !self.zero && (self.sign == self.overflow),
        }
    }
}
