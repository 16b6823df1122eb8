//! Register file of the CPU.
//!
//! General purpose registers are stored once as 32-bit values; the 16-bit and 8-bit names are views
//! into the same storage (AL/AH/AX/EAX share one slot).

use crate::address::SegmentedAddress;
use crate::flags::Flags;
use serde::{Deserialize, Serialize};

/// CPU model/variant selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuModel {
    /// Intel 8086 (1978) - Original 16-bit x86 processor
    Intel8086,
    /// Intel 80186 (1982) - Enhanced 8086 with additional instructions
    Intel80186,
    /// Intel 80286 (1982) - Only its real-mode instruction set is used here
    Intel80286,
    /// Intel 80386 (1985) - 32-bit registers, size prefixes and the 0F page, in real mode
    #[default]
    Intel80386,
}

impl CpuModel {
    /// Returns true if this CPU model supports 80186+ instructions
    pub fn supports_80186_instructions(&self) -> bool {
        !matches!(self, CpuModel::Intel8086)
    }

    /// Returns true if this CPU model supports 80386+ instructions
    pub fn supports_80386_instructions(&self) -> bool {
        matches!(self, CpuModel::Intel80386)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuModel::Intel8086 => "Intel 8086",
            CpuModel::Intel80186 => "Intel 80186",
            CpuModel::Intel80286 => "Intel 80286",
            CpuModel::Intel80386 => "Intel 80386",
        }
    }
}

/// Operand width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u16 {
        (self.bits() / 8) as u16
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub const fn msb(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extend the low `self` bits of `value` to 32 bits
    #[inline]
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            Width::Byte => value as u8 as i8 as i32 as u32,
            Width::Word => value as u16 as i16 as i32 as u32,
            Width::Dword => value,
        }
    }

    /// Word or Dword depending on the operand-size prefix
    #[inline]
    pub const fn word_or_dword(dword: bool) -> Self {
        if dword {
            Width::Dword
        } else {
            Width::Word
        }
    }
}

/// Segment register, numbered as in the ModRM `reg` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(SegReg::Es),
            1 => Some(SegReg::Cs),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Ds),
            4 => Some(SegReg::Fs),
            5 => Some(SegReg::Gs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SegReg::Es => "ES",
            SegReg::Cs => "CS",
            SegReg::Ss => "SS",
            SegReg::Ds => "DS",
            SegReg::Fs => "FS",
            SegReg::Gs => "GS",
        }
    }
}

// General purpose register indices, as encoded in opcodes and ModRM
pub const REG_AX: u8 = 0;
pub const REG_CX: u8 = 1;
pub const REG_DX: u8 = 2;
pub const REG_BX: u8 = 3;
pub const REG_SP: u8 = 4;
pub const REG_BP: u8 = 5;
pub const REG_SI: u8 = 6;
pub const REG_DI: u8 = 7;

/// Architectural state: registers, segments, IP and flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    regs: [u32; 8],
    segs: [u16; 6],
    pub ip: u16,
    pub flags: Flags,
    /// Instructions retired
    pub cycles: u64,
}

macro_rules! gp_accessors {
    ($($idx:expr => $r32:ident, $set32:ident, $r16:ident, $set16:ident;)*) => {
        $(
            #[inline]
            pub fn $r32(&self) -> u32 {
                self.regs[$idx as usize]
            }

            #[inline]
            pub fn $set32(&mut self, value: u32) {
                self.regs[$idx as usize] = value;
            }

            #[inline]
            pub fn $r16(&self) -> u16 {
                self.regs[$idx as usize] as u16
            }

            #[inline]
            pub fn $set16(&mut self, value: u16) {
                self.set_reg16($idx, value);
            }
        )*
    };
}

macro_rules! byte_accessors {
    ($($idx:expr => $get:ident, $set:ident;)*) => {
        $(
            #[inline]
            pub fn $get(&self) -> u8 {
                self.reg8($idx)
            }

            #[inline]
            pub fn $set(&mut self, value: u8) {
                self.set_reg8($idx, value);
            }
        )*
    };
}

macro_rules! segment_accessors {
    ($($seg:expr => $get:ident, $set:ident;)*) => {
        $(
            #[inline]
            pub fn $get(&self) -> u16 {
                self.segs[$seg as usize]
            }

            #[inline]
            pub fn $set(&mut self, value: u16) {
                self.segs[$seg as usize] = value;
            }
        )*
    };
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    /// Power-on state: CS:IP = FFFF:0000, FLAGS = 0x0002
    pub fn new() -> Self {
        let mut segs = [0; 6];
        segs[SegReg::Cs as usize] = 0xFFFF;
        Self {
            regs: [0; 8],
            segs,
            ip: 0,
            flags: Flags::default(),
            cycles: 0,
        }
    }

    gp_accessors! {
        REG_AX => eax, set_eax, ax, set_ax;
        REG_CX => ecx, set_ecx, cx, set_cx;
        REG_DX => edx, set_edx, dx, set_dx;
        REG_BX => ebx, set_ebx, bx, set_bx;
        REG_SP => esp, set_esp, sp, set_sp;
        REG_BP => ebp, set_ebp, bp, set_bp;
        REG_SI => esi, set_esi, si, set_si;
        REG_DI => edi, set_edi, di, set_di;
    }

    byte_accessors! {
        0 => al, set_al;
        1 => cl, set_cl;
        2 => dl, set_dl;
        3 => bl, set_bl;
        4 => ah, set_ah;
        5 => ch, set_ch;
        6 => dh, set_dh;
        7 => bh, set_bh;
    }

    segment_accessors! {
        SegReg::Es => es, set_es;
        SegReg::Cs => cs, set_cs;
        SegReg::Ss => ss, set_ss;
        SegReg::Ds => ds, set_ds;
        SegReg::Fs => fs, set_fs;
        SegReg::Gs => gs, set_gs;
    }

    /// 8-bit register by encoding: 0-3 = AL CL DL BL, 4-7 = AH CH DH BH
    #[inline]
    pub fn reg8(&self, index: u8) -> u8 {
        debug_assert!(index < 8, "Invalid 8-bit register index: {}", index);
        let slot = self.regs[(index & 3) as usize];
        if index < 4 {
            slot as u8
        } else {
            (slot >> 8) as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, index: u8, value: u8) {
        debug_assert!(index < 8, "Invalid 8-bit register index: {}", index);
        let slot = &mut self.regs[(index & 3) as usize];
        if index < 4 {
            *slot = (*slot & !0xFF) | value as u32;
        } else {
            *slot = (*slot & !0xFF00) | ((value as u32) << 8);
        }
    }

    #[inline]
    pub fn reg16(&self, index: u8) -> u16 {
        self.regs[(index & 7) as usize] as u16
    }

    /// Writes the low 16 bits, the upper half of the 32-bit register is kept
    #[inline]
    pub fn set_reg16(&mut self, index: u8, value: u16) {
        let slot = &mut self.regs[(index & 7) as usize];
        *slot = (*slot & 0xFFFF_0000) | value as u32;
    }

    #[inline]
    pub fn reg32(&self, index: u8) -> u32 {
        self.regs[(index & 7) as usize]
    }

    #[inline]
    pub fn set_reg32(&mut self, index: u8, value: u32) {
        self.regs[(index & 7) as usize] = value;
    }

    /// Register `index` read at `width`, zero-extended
    #[inline]
    pub fn reg(&self, width: Width, index: u8) -> u32 {
        match width {
            Width::Byte => self.reg8(index) as u32,
            Width::Word => self.reg16(index) as u32,
            Width::Dword => self.reg32(index),
        }
    }

    #[inline]
    pub fn set_reg(&mut self, width: Width, index: u8, value: u32) {
        match width {
            Width::Byte => self.set_reg8(index, value as u8),
            Width::Word => self.set_reg16(index, value as u16),
            Width::Dword => self.set_reg32(index, value),
        }
    }

    #[inline]
    pub fn segment(&self, seg: SegReg) -> u16 {
        self.segs[seg as usize]
    }

    #[inline]
    pub fn set_segment(&mut self, seg: SegReg, value: u16) {
        self.segs[seg as usize] = value;
    }

    /// Current CS:IP
    #[inline]
    pub fn cs_ip(&self) -> SegmentedAddress {
        SegmentedAddress::new(self.cs(), self.ip)
    }

    #[inline]
    pub fn set_cs_ip(&mut self, address: SegmentedAddress) {
        self.set_cs(address.segment);
        self.ip = address.offset;
    }

    /// Read-only copy for tooling
    pub fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot {
            eax: self.eax(),
            ecx: self.ecx(),
            edx: self.edx(),
            ebx: self.ebx(),
            esp: self.esp(),
            ebp: self.ebp(),
            esi: self.esi(),
            edi: self.edi(),
            es: self.es(),
            cs: self.cs(),
            ss: self.ss(),
            ds: self.ds(),
            fs: self.fs(),
            gs: self.gs(),
            ip: self.ip,
            flags: self.flags.bits(),
            cycles: self.cycles,
        }
    }

    /// Restore every register from a snapshot
    pub fn restore(&mut self, snapshot: &RegisterSnapshot) {
        self.regs = [
            snapshot.eax,
            snapshot.ecx,
            snapshot.edx,
            snapshot.ebx,
            snapshot.esp,
            snapshot.ebp,
            snapshot.esi,
            snapshot.edi,
        ];
        self.segs = [
            snapshot.es,
            snapshot.cs,
            snapshot.ss,
            snapshot.ds,
            snapshot.fs,
            snapshot.gs,
        ];
        self.ip = snapshot.ip;
        self.flags = Flags::from_bits(snapshot.flags);
        self.cycles = snapshot.cycles;
    }
}

/// Serializable register dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ip: u16,
    pub flags: u32,
    pub cycles: u64,
}
