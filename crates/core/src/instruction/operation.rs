//! The closed set of instruction forms a node can carry.
//!
//! One variant per instruction family. Width, register numbers and addressing are parameters of the
//! variant; operand bytes are referenced through [`FieldRef`]s into the owning node.

use super::field::FieldRef;
use super::modrm::ModRm;
use super::node::CfgInstruction;
use super::prefix::RepKind;
use crate::bus::Memory;
use crate::error::Fault;
use crate::state::{SegReg, Width};

/// The eight two-operand ALU operations, in opcode / group 1 order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn from_index(index: u8) -> Self {
        match index & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "ADD",
            AluOp::Or => "OR",
            AluOp::Adc => "ADC",
            AluOp::Sbb => "SBB",
            AluOp::And => "AND",
            AluOp::Sub => "SUB",
            AluOp::Xor => "XOR",
            AluOp::Cmp => "CMP",
        }
    }

    /// CMP computes flags without storing a result
    pub fn writes_result(self) -> bool {
        self != AluOp::Cmp
    }
}

/// Group 2 operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    pub fn from_index(index: u8) -> Self {
        match index & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 | 6 => ShiftOp::Shl, // 6 is the undocumented SAL alias
            5 => ShiftOp::Shr,
            _ => ShiftOp::Sar,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ShiftOp::Rol => "ROL",
            ShiftOp::Ror => "ROR",
            ShiftOp::Rcl => "RCL",
            ShiftOp::Rcr => "RCR",
            ShiftOp::Shl => "SHL",
            ShiftOp::Shr => "SHR",
            ShiftOp::Sar => "SAR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftCount {
    One,
    Cl,
    Imm(FieldRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

impl StringOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            StringOp::Movs => "MOVS",
            StringOp::Cmps => "CMPS",
            StringOp::Stos => "STOS",
            StringOp::Lods => "LODS",
            StringOp::Scas => "SCAS",
            StringOp::Ins => "INS",
            StringOp::Outs => "OUTS",
        }
    }

    /// Only CMPS and SCAS look at ZF between repetitions
    pub fn checks_zero_flag(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

impl BitOp {
    pub fn from_index(index: u8) -> Self {
        match index & 3 {
            0 => BitOp::Bt,
            1 => BitOp::Bts,
            2 => BitOp::Btr,
            _ => BitOp::Btc,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BitOp::Bt => "BT",
            BitOp::Bts => "BTS",
            BitOp::Btr => "BTR",
            BitOp::Btc => "BTC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Loopnz,
    Loopz,
    Loop,
    Jcxz,
}

/// Immediate operand, optionally sign-extended to the operation width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Imm {
    pub field: FieldRef,
    pub sign_extend: bool,
}

impl Imm {
    pub fn plain(field: FieldRef) -> Self {
        Self {
            field,
            sign_extend: false,
        }
    }

    pub fn signed(field: FieldRef) -> Self {
        Self {
            field,
            sign_extend: true,
        }
    }

    #[inline]
    pub fn resolve(&self, node: &CfgInstruction, memory: &dyn Memory, width: Width) -> u32 {
        let value = if self.sign_extend {
            node.signed(memory, self.field) as u32
        } else {
            node.value(memory, self.field)
        };
        value & width.mask()
    }
}

/// How an operation leaves its node, as far as the graph and the JIT are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Sequential,
    /// Jumps and loops that stay at the current call level
    Branch,
    /// CALL, INT and friends: enters a new execution context
    ContextPush,
    /// RET, RETF, IRET
    ContextPop,
    Halt,
    Callback,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    // Arithmetic and logic
    AluRmReg { op: AluOp, width: Width, modrm: ModRm },
    AluRegRm { op: AluOp, width: Width, modrm: ModRm },
    AluAccImm { op: AluOp, width: Width, imm: Imm },
    AluRmImm { op: AluOp, width: Width, modrm: ModRm, imm: Imm },
    TestRmReg { width: Width, modrm: ModRm },
    TestAccImm { width: Width, imm: Imm },
    TestRmImm { width: Width, modrm: ModRm, imm: Imm },
    IncReg { width: Width, reg: u8 },
    DecReg { width: Width, reg: u8 },
    IncRm { width: Width, modrm: ModRm },
    DecRm { width: Width, modrm: ModRm },
    Not { width: Width, modrm: ModRm },
    Neg { width: Width, modrm: ModRm },
    Mul { width: Width, modrm: ModRm },
    Imul { width: Width, modrm: ModRm },
    Div { width: Width, modrm: ModRm },
    Idiv { width: Width, modrm: ModRm },
    ImulRegRm { width: Width, modrm: ModRm },
    ImulRegRmImm { width: Width, modrm: ModRm, imm: Imm },
    /// `masked_count`: the count is taken modulo 32 (80186 and later)
    Shift { op: ShiftOp, width: Width, modrm: ModRm, count: ShiftCount, masked_count: bool },
    Shld { width: Width, modrm: ModRm, count: ShiftCount },
    Shrd { width: Width, modrm: ModRm, count: ShiftCount },
    BitTestReg { op: BitOp, width: Width, modrm: ModRm },
    BitTestImm { op: BitOp, width: Width, modrm: ModRm, imm: FieldRef },
    Bsf { width: Width, modrm: ModRm },
    Bsr { width: Width, modrm: ModRm },
    Daa,
    Das,
    Aaa,
    Aas,
    Aam { base: FieldRef },
    Aad { base: FieldRef },
    Salc,
    /// CBW / CWDE
    Cbw { width: Width },
    /// CWD / CDQ
    Cwd { width: Width },

    // Data movement
    MovRmReg { width: Width, modrm: ModRm },
    MovRegRm { width: Width, modrm: ModRm },
    MovRmSreg { modrm: ModRm, sreg: SegReg },
    MovSregRm { modrm: ModRm, sreg: SegReg },
    MovRegImm { width: Width, reg: u8, imm: Imm },
    MovRmImm { width: Width, modrm: ModRm, imm: Imm },
    MovAccMoffs { width: Width, offset: FieldRef, segment: SegReg },
    MovMoffsAcc { width: Width, offset: FieldRef, segment: SegReg },
    Movzx { width: Width, src_width: Width, modrm: ModRm },
    Movsx { width: Width, src_width: Width, modrm: ModRm },
    Lea { width: Width, modrm: ModRm },
    /// LES LDS LSS LFS LGS
    LoadFarPointer { width: Width, modrm: ModRm, sreg: SegReg },
    XchgRmReg { width: Width, modrm: ModRm },
    XchgAccReg { width: Width, reg: u8 },
    Nop,
    Xlat { segment: SegReg, address_size_32: bool },
    Lahf,
    Sahf,
    SetCc { cc: u8, modrm: ModRm },

    // Stack
    PushReg { width: Width, reg: u8 },
    PopReg { width: Width, reg: u8 },
    PushSreg { width: Width, sreg: SegReg },
    PopSreg { width: Width, sreg: SegReg },
    PushImm { width: Width, imm: Imm },
    PushRm { width: Width, modrm: ModRm },
    PopRm { width: Width, modrm: ModRm },
    Pushf { width: Width },
    Popf { width: Width },
    Pusha { width: Width },
    Popa { width: Width },
    Enter { width: Width, size: FieldRef, level: FieldRef },
    Leave { width: Width },

    // Control transfer
    Jcc { cc: u8, disp: FieldRef },
    JmpRel { disp: FieldRef },
    JmpFar { offset: FieldRef, segment: FieldRef },
    JmpNearRm { width: Width, modrm: ModRm },
    JmpFarRm { width: Width, modrm: ModRm },
    Loop { kind: LoopKind, disp: FieldRef, address_size_32: bool },
    CallRel { width: Width, disp: FieldRef },
    CallFar { width: Width, offset: FieldRef, segment: FieldRef },
    CallNearRm { width: Width, modrm: ModRm },
    CallFarRm { width: Width, modrm: ModRm },
    RetNear { width: Width, pop: Option<FieldRef> },
    RetFar { width: Width, pop: Option<FieldRef> },
    Int { vector: FieldRef },
    Int3,
    Into,
    Iret { width: Width },
    Hlt,

    // Flags and misc
    Cmc,
    Clc,
    Stc,
    Cli,
    Sti,
    Cld,
    Std,
    Wait,
    /// D8-DF: operands are decoded, nothing is executed
    FpuEscape { opcode: u8, modrm: ModRm },

    // I/O
    /// Port from an immediate, or DX when `port` is `None`
    In { width: Width, port: Option<FieldRef> },
    Out { width: Width, port: Option<FieldRef> },

    StringOp {
        op: StringOp,
        width: Width,
        rep: Option<RepKind>,
        segment: SegReg,
        address_size_32: bool,
    },

    /// Emulator hook, `FE 38 lo hi`
    Callback { number: FieldRef },

    /// Undefined encoding, raises INT 6 every time it runs
    Invalid { fault: Fault },
}

impl Operation {
    pub fn flow(&self) -> FlowKind {
        match self {
            Operation::Jcc { .. }
            | Operation::JmpRel { .. }
            | Operation::JmpFar { .. }
            | Operation::JmpNearRm { .. }
            | Operation::JmpFarRm { .. }
            | Operation::Loop { .. } => FlowKind::Branch,
            Operation::CallRel { .. }
            | Operation::CallFar { .. }
            | Operation::CallNearRm { .. }
            | Operation::CallFarRm { .. }
            | Operation::Int { .. }
            | Operation::Int3
            | Operation::Into => FlowKind::ContextPush,
            Operation::RetNear { .. } | Operation::RetFar { .. } | Operation::Iret { .. } => {
                FlowKind::ContextPop
            }
            Operation::Hlt => FlowKind::Halt,
            Operation::Callback { .. } => FlowKind::Callback,
            Operation::Invalid { .. } => FlowKind::Invalid,
            _ => FlowKind::Sequential,
        }
    }

    /// Mnemonic for trace output
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Operation::AluRmReg { op, .. }
            | Operation::AluRegRm { op, .. }
            | Operation::AluAccImm { op, .. }
            | Operation::AluRmImm { op, .. } => op.mnemonic(),
            Operation::TestRmReg { .. }
            | Operation::TestAccImm { .. }
            | Operation::TestRmImm { .. } => "TEST",
            Operation::IncReg { .. } | Operation::IncRm { .. } => "INC",
            Operation::DecReg { .. } | Operation::DecRm { .. } => "DEC",
            Operation::Not { .. } => "NOT",
            Operation::Neg { .. } => "NEG",
            Operation::Mul { .. } => "MUL",
            Operation::Imul { .. }
            | Operation::ImulRegRm { .. }
            | Operation::ImulRegRmImm { .. } => "IMUL",
            Operation::Div { .. } => "DIV",
            Operation::Idiv { .. } => "IDIV",
            Operation::Shift { op, .. } => op.mnemonic(),
            Operation::Shld { .. } => "SHLD",
            Operation::Shrd { .. } => "SHRD",
            Operation::BitTestReg { op, .. } | Operation::BitTestImm { op, .. } => op.mnemonic(),
            Operation::Bsf { .. } => "BSF",
            Operation::Bsr { .. } => "BSR",
            Operation::Daa => "DAA",
            Operation::Das => "DAS",
            Operation::Aaa => "AAA",
            Operation::Aas => "AAS",
            Operation::Aam { .. } => "AAM",
            Operation::Aad { .. } => "AAD",
            Operation::Salc => "SALC",
            Operation::Cbw { width } => {
                if *width == Width::Dword {
                    "CWDE"
                } else {
                    "CBW"
                }
            }
            Operation::Cwd { width } => {
                if *width == Width::Dword {
                    "CDQ"
                } else {
                    "CWD"
                }
            }
            Operation::MovRmReg { .. }
            | Operation::MovRegRm { .. }
            | Operation::MovRmSreg { .. }
            | Operation::MovSregRm { .. }
            | Operation::MovRegImm { .. }
            | Operation::MovRmImm { .. }
            | Operation::MovAccMoffs { .. }
            | Operation::MovMoffsAcc { .. } => "MOV",
            Operation::Movzx { .. } => "MOVZX",
            Operation::Movsx { .. } => "MOVSX",
            Operation::Lea { .. } => "LEA",
            Operation::LoadFarPointer { sreg, .. } => match sreg {
                SegReg::Es => "LES",
                SegReg::Ds => "LDS",
                SegReg::Ss => "LSS",
                SegReg::Fs => "LFS",
                SegReg::Gs => "LGS",
                SegReg::Cs => "LCS",
            },
            Operation::XchgRmReg { .. } | Operation::XchgAccReg { .. } => "XCHG",
            Operation::Nop => "NOP",
            Operation::Xlat { .. } => "XLAT",
            Operation::Lahf => "LAHF",
            Operation::Sahf => "SAHF",
            Operation::SetCc { .. } => "SETcc",
            Operation::PushReg { .. }
            | Operation::PushSreg { .. }
            | Operation::PushImm { .. }
            | Operation::PushRm { .. } => "PUSH",
            Operation::PopReg { .. } | Operation::PopSreg { .. } | Operation::PopRm { .. } => {
                "POP"
            }
            Operation::Pushf { .. } => "PUSHF",
            Operation::Popf { .. } => "POPF",
            Operation::Pusha { .. } => "PUSHA",
            Operation::Popa { .. } => "POPA",
            Operation::Enter { .. } => "ENTER",
            Operation::Leave { .. } => "LEAVE",
            Operation::Jcc { .. } => "Jcc",
            Operation::JmpRel { .. }
            | Operation::JmpNearRm { .. }
            | Operation::JmpFar { .. }
            | Operation::JmpFarRm { .. } => "JMP",
            Operation::Loop { kind, .. } => match kind {
                LoopKind::Loopnz => "LOOPNZ",
                LoopKind::Loopz => "LOOPZ",
                LoopKind::Loop => "LOOP",
                LoopKind::Jcxz => "JCXZ",
            },
            Operation::CallRel { .. }
            | Operation::CallFar { .. }
            | Operation::CallNearRm { .. }
            | Operation::CallFarRm { .. } => "CALL",
            Operation::RetNear { .. } => "RET",
            Operation::RetFar { .. } => "RETF",
            Operation::Int { .. } => "INT",
            Operation::Int3 => "INT3",
            Operation::Into => "INTO",
            Operation::Iret { .. } => "IRET",
            Operation::Hlt => "HLT",
            Operation::Cmc => "CMC",
            Operation::Clc => "CLC",
            Operation::Stc => "STC",
            Operation::Cli => "CLI",
            Operation::Sti => "STI",
            Operation::Cld => "CLD",
            Operation::Std => "STD",
            Operation::Wait => "WAIT",
            Operation::FpuEscape { .. } => "ESC",
            Operation::In { .. } => "IN",
            Operation::Out { .. } => "OUT",
            Operation::StringOp { op, .. } => op.mnemonic(),
            Operation::Callback { .. } => "CALLBACK",
            Operation::Invalid { .. } => "(bad)",
        }
    }
}
