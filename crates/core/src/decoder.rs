//! Instruction decoder.
//!
//! Turns the bytes at an address into a [`CfgInstruction`]. Every form computes its own length from
//! the fields it reads. Encodings the configured CPU model does not have, and encodings that are
//! undefined, decode into an [`Operation::Invalid`] node that raises INT 6 when executed.

use crate::address::SegmentedAddress;
use crate::bus::Memory;
use crate::error::Fault;
use crate::instruction::{
    AluOp, BitOp, CfgInstruction, FieldKind, FieldRef, Imm, InstructionField, LoopKind, ModRm,
    Operation, Prefix, PrefixSummary, ShiftCount, ShiftOp, Sib, StringOp,
    MAX_INSTRUCTION_LENGTH,
};
use crate::logging::{log, LogCategory, LogLevel};
use crate::state::{CpuModel, SegReg, Width};

/// Reads instruction bytes and records them as fields
struct Cursor<'m> {
    memory: &'m dyn Memory,
    start: u32,
    len: usize,
    fields: Vec<InstructionField>,
}

impl<'m> Cursor<'m> {
    fn new(memory: &'m dyn Memory, address: SegmentedAddress) -> Self {
        Self {
            memory,
            start: address.linear(),
            len: 0,
            fields: Vec::with_capacity(4),
        }
    }

    #[inline]
    fn peek_at(&self, delta: usize) -> u8 {
        self.memory
            .sneak_read_u8(self.start.wrapping_add((self.len + delta) as u32))
    }

    #[inline]
    fn peek(&self) -> u8 {
        self.peek_at(0)
    }

    /// Consume `size` bytes as one field
    fn take(&mut self, kind: FieldKind, size: usize) -> Result<FieldRef, Fault> {
        if self.len + size > MAX_INSTRUCTION_LENGTH {
            return Err(Fault::InvalidOpcode {
                opcode: self.peek() as u16,
            });
        }
        let mut bytes = [0u8; InstructionField::MAX_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate().take(size) {
            *byte = self.peek_at(i);
        }
        let field = InstructionField::new(kind, self.len as u8, &bytes[..size]);
        self.fields.push(field);
        self.len += size;
        Ok(FieldRef((self.fields.len() - 1) as u8))
    }

    /// Operand bytes that still belong to the instruction identity, like branch targets
    fn fixed(&mut self, kind: FieldKind, size: usize) -> Result<FieldRef, Fault> {
        let field = self.take(kind, size)?;
        self.fields[field.index()].is_final = true;
        Ok(field)
    }

    fn imm(&mut self, width: Width) -> Result<FieldRef, Fault> {
        self.take(FieldKind::Immediate, width.bytes() as usize)
    }

    fn imm8(&mut self) -> Result<FieldRef, Fault> {
        self.take(FieldKind::Immediate, 1)
    }

    fn imm16(&mut self) -> Result<FieldRef, Fault> {
        self.take(FieldKind::Immediate, 2)
    }

    /// ModRM byte, then SIB and displacement as the addressing form requires
    fn modrm(&mut self, prefixes: &PrefixSummary) -> Result<ModRm, Fault> {
        let byte = self.peek();
        self.take(FieldKind::ModRm, 1)?;
        let (mode, reg, rm) = ModRm::split(byte);
        let address_size_32 = prefixes.address_size_32;
        let mut sib = None;
        let mut displacement = None;
        if mode != 3 {
            if address_size_32 {
                if rm == 4 {
                    let sib_byte = self.peek();
                    self.take(FieldKind::Sib, 1)?;
                    sib = Some(Sib::from_byte(sib_byte, mode));
                }
                let disp_size = match mode {
                    0 if rm == 5 => 4,
                    0 if matches!(sib, Some(Sib { base: None, .. })) => 4,
                    1 => 1,
                    2 => 4,
                    _ => 0,
                };
                if disp_size > 0 {
                    displacement = Some(self.take(FieldKind::Displacement, disp_size)?);
                }
            } else {
                let disp_size = match mode {
                    0 if rm == 6 => 2,
                    1 => 1,
                    2 => 2,
                    _ => 0,
                };
                if disp_size > 0 {
                    displacement = Some(self.take(FieldKind::Displacement, disp_size)?);
                }
            }
        }
        let segment =
            prefixes.segment_or(ModRm::default_segment(mode, rm, address_size_32, sib));
        Ok(ModRm {
            mode,
            reg,
            rm,
            address_size_32,
            sib,
            displacement,
            segment,
        })
    }

    /// ModRM that must address memory
    fn memory_modrm(&mut self, prefixes: &PrefixSummary, opcode: u16) -> Result<ModRm, Fault> {
        let modrm = self.modrm(prefixes)?;
        if modrm.is_register() {
            return Err(Fault::InvalidOpcode { opcode });
        }
        Ok(modrm)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    model: CpuModel,
}

impl Decoder {
    pub fn new(model: CpuModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> CpuModel {
        self.model
    }

    /// Decode the instruction at `address`; never fails, undefined bytes give an invalid node
    pub fn decode(&self, memory: &dyn Memory, address: SegmentedAddress) -> CfgInstruction {
        let mut cursor = Cursor::new(memory, address);
        let mut prefixes = Vec::new();
        let mut result = None;
        loop {
            let byte = cursor.peek();
            let Some(prefix) = Prefix::from_byte(byte, self.model) else {
                break;
            };
            if let Err(fault) = cursor.take(FieldKind::Prefix, 1) {
                result = Some(Err(fault));
                break;
            }
            prefixes.push(prefix);
        }
        let summary = PrefixSummary::from_prefixes(&prefixes);
        let result = result.unwrap_or_else(|| self.decode_opcode(&mut cursor, &summary));

        let operation = match result {
            Ok(operation) => operation,
            Err(fault) => {
                log(LogCategory::Decoder, LogLevel::Debug, || {
                    format!("{} {} ({:?})", address, fault, self.model)
                });
                Operation::Invalid { fault }
            }
        };
        let node = CfgInstruction::new(address, prefixes, cursor.fields, operation);
        log(LogCategory::Decoder, LogLevel::Trace, || {
            format!("decoded {}", node.describe())
        });
        node
    }

    fn require_186(&self, opcode: u16) -> Result<(), Fault> {
        if self.model.supports_80186_instructions() {
            Ok(())
        } else {
            Err(Fault::InvalidOpcode { opcode })
        }
    }

    fn decode_opcode(&self, c: &mut Cursor, p: &PrefixSummary) -> Result<Operation, Fault> {
        let op = c.peek();
        if op == 0x0F && self.model.supports_80386_instructions() {
            let second = c.peek_at(1);
            c.take(FieldKind::Opcode, 2)?;
            return self.decode_two_byte(c, p, second);
        }
        c.take(FieldKind::Opcode, 1)?;
        let opcode = op as u16;
        let invalid = Fault::InvalidOpcode { opcode };
        let wv = Width::word_or_dword(p.operand_size_32);
        let data_segment = p.segment_or(SegReg::Ds);

        let operation = match op {
            // ALU families: ADD OR ADC SBB AND SUB XOR CMP
            0x00..=0x3F if op & 7 < 6 => {
                let alu = AluOp::from_index(op >> 3);
                let width = if op & 1 == 0 { Width::Byte } else { wv };
                match op & 7 {
                    0 | 1 => Operation::AluRmReg {
                        op: alu,
                        width,
                        modrm: c.modrm(p)?,
                    },
                    2 | 3 => Operation::AluRegRm {
                        op: alu,
                        width,
                        modrm: c.modrm(p)?,
                    },
                    _ => Operation::AluAccImm {
                        op: alu,
                        width,
                        imm: Imm::plain(c.imm(width)?),
                    },
                }
            }
            0x06 | 0x0E | 0x16 | 0x1E => Operation::PushSreg {
                width: wv,
                sreg: SegReg::from_index(op >> 3).ok_or(invalid.clone())?,
            },
            // POP CS (0F) does not exist
            0x07 | 0x17 | 0x1F => Operation::PopSreg {
                width: wv,
                sreg: SegReg::from_index(op >> 3).ok_or(invalid.clone())?,
            },
            0x27 => Operation::Daa,
            0x2F => Operation::Das,
            0x37 => Operation::Aaa,
            0x3F => Operation::Aas,
            0x40..=0x47 => Operation::IncReg {
                width: wv,
                reg: op & 7,
            },
            0x48..=0x4F => Operation::DecReg {
                width: wv,
                reg: op & 7,
            },
            0x50..=0x57 => Operation::PushReg {
                width: wv,
                reg: op & 7,
            },
            0x58..=0x5F => Operation::PopReg {
                width: wv,
                reg: op & 7,
            },
            0x60 => {
                self.require_186(opcode)?;
                Operation::Pusha { width: wv }
            }
            0x61 => {
                self.require_186(opcode)?;
                Operation::Popa { width: wv }
            }
            0x68 => {
                self.require_186(opcode)?;
                Operation::PushImm {
                    width: wv,
                    imm: Imm::plain(c.imm(wv)?),
                }
            }
            0x6A => {
                self.require_186(opcode)?;
                Operation::PushImm {
                    width: wv,
                    imm: Imm::signed(c.imm8()?),
                }
            }
            0x69 | 0x6B => {
                self.require_186(opcode)?;
                let modrm = c.modrm(p)?;
                let imm = if op == 0x69 {
                    Imm::plain(c.imm(wv)?)
                } else {
                    Imm::signed(c.imm8()?)
                };
                Operation::ImulRegRmImm {
                    width: wv,
                    modrm,
                    imm,
                }
            }
            0x6C..=0x6F => {
                self.require_186(opcode)?;
                let width = if op & 1 == 0 { Width::Byte } else { wv };
                let string_op = if op < 0x6E {
                    StringOp::Ins
                } else {
                    StringOp::Outs
                };
                self.string_op(string_op, width, p)
            }
            0x70..=0x7F => Operation::Jcc {
                cc: op & 0x0F,
                disp: c.fixed(FieldKind::Displacement, 1)?,
            },
            // Group 1
            0x80..=0x83 => {
                let width = if op & 1 == 0 { Width::Byte } else { wv };
                let modrm = c.modrm(p)?;
                let imm = match op {
                    0x81 => Imm::plain(c.imm(width)?),
                    0x83 => Imm::signed(c.imm8()?),
                    _ => Imm::plain(c.imm8()?),
                };
                Operation::AluRmImm {
                    op: AluOp::from_index(modrm.reg),
                    width,
                    modrm,
                    imm,
                }
            }
            0x84 | 0x85 => Operation::TestRmReg {
                width: if op == 0x84 { Width::Byte } else { wv },
                modrm: c.modrm(p)?,
            },
            0x86 | 0x87 => Operation::XchgRmReg {
                width: if op == 0x86 { Width::Byte } else { wv },
                modrm: c.modrm(p)?,
            },
            0x88..=0x8B => {
                let width = if op & 1 == 0 { Width::Byte } else { wv };
                let modrm = c.modrm(p)?;
                if op < 0x8A {
                    Operation::MovRmReg { width, modrm }
                } else {
                    Operation::MovRegRm { width, modrm }
                }
            }
            0x8C => {
                let modrm = c.modrm(p)?;
                Operation::MovRmSreg {
                    modrm,
                    sreg: self.segment_register(modrm.reg, opcode)?,
                }
            }
            0x8D => Operation::Lea {
                width: wv,
                modrm: c.memory_modrm(p, opcode)?,
            },
            0x8E => {
                let modrm = c.modrm(p)?;
                let sreg = self.segment_register(modrm.reg, opcode)?;
                if sreg == SegReg::Cs {
                    return Err(invalid);
                }
                Operation::MovSregRm { modrm, sreg }
            }
            0x8F => {
                let modrm = c.modrm(p)?;
                if modrm.reg != 0 {
                    return Err(Fault::InvalidGroupIndex {
                        opcode,
                        index: modrm.reg,
                    });
                }
                Operation::PopRm { width: wv, modrm }
            }
            0x90 => Operation::Nop,
            0x91..=0x97 => Operation::XchgAccReg {
                width: wv,
                reg: op & 7,
            },
            0x98 => Operation::Cbw { width: wv },
            0x99 => Operation::Cwd { width: wv },
            0x9A => {
                let offset = c.fixed(FieldKind::Offset, wv.bytes() as usize)?;
                let segment = c.fixed(FieldKind::Segment, 2)?;
                Operation::CallFar {
                    width: wv,
                    offset,
                    segment,
                }
            }
            0x9B => Operation::Wait,
            0x9C => Operation::Pushf { width: wv },
            0x9D => Operation::Popf { width: wv },
            0x9E => Operation::Sahf,
            0x9F => Operation::Lahf,
            0xA0..=0xA3 => {
                let width = if op & 1 == 0 { Width::Byte } else { wv };
                let size = if p.address_size_32 { 4 } else { 2 };
                let offset = c.take(FieldKind::Offset, size)?;
                if op < 0xA2 {
                    Operation::MovAccMoffs {
                        width,
                        offset,
                        segment: data_segment,
                    }
                } else {
                    Operation::MovMoffsAcc {
                        width,
                        offset,
                        segment: data_segment,
                    }
                }
            }
            0xA4..=0xA7 | 0xAA..=0xAF => {
                let width = if op & 1 == 0 { Width::Byte } else { wv };
                let string_op = match op & 0xFE {
                    0xA4 => StringOp::Movs,
                    0xA6 => StringOp::Cmps,
                    0xAA => StringOp::Stos,
                    0xAC => StringOp::Lods,
                    _ => StringOp::Scas,
                };
                self.string_op(string_op, width, p)
            }
            0xA8 | 0xA9 => {
                let width = if op == 0xA8 { Width::Byte } else { wv };
                Operation::TestAccImm {
                    width,
                    imm: Imm::plain(c.imm(width)?),
                }
            }
            0xB0..=0xB7 => Operation::MovRegImm {
                width: Width::Byte,
                reg: op & 7,
                imm: Imm::plain(c.imm8()?),
            },
            0xB8..=0xBF => Operation::MovRegImm {
                width: wv,
                reg: op & 7,
                imm: Imm::plain(c.imm(wv)?),
            },
            // Group 2
            0xC0 | 0xC1 | 0xD0..=0xD3 => {
                if op < 0xC2 {
                    self.require_186(opcode)?;
                }
                let width = if op & 1 == 0 { Width::Byte } else { wv };
                let modrm = c.modrm(p)?;
                let count = match op {
                    0xC0 | 0xC1 => ShiftCount::Imm(c.imm8()?),
                    0xD0 | 0xD1 => ShiftCount::One,
                    _ => ShiftCount::Cl,
                };
                Operation::Shift {
                    op: ShiftOp::from_index(modrm.reg),
                    width,
                    modrm,
                    count,
                    masked_count: self.model.supports_80186_instructions(),
                }
            }
            0xC2 => Operation::RetNear {
                width: wv,
                pop: Some(c.imm16()?),
            },
            0xC3 => Operation::RetNear {
                width: wv,
                pop: None,
            },
            0xC4 | 0xC5 => Operation::LoadFarPointer {
                width: wv,
                modrm: c.memory_modrm(p, opcode)?,
                sreg: if op == 0xC4 { SegReg::Es } else { SegReg::Ds },
            },
            0xC6 | 0xC7 => {
                let width = if op == 0xC6 { Width::Byte } else { wv };
                let modrm = c.modrm(p)?;
                if modrm.reg != 0 {
                    return Err(Fault::InvalidGroupIndex {
                        opcode,
                        index: modrm.reg,
                    });
                }
                Operation::MovRmImm {
                    width,
                    modrm,
                    imm: Imm::plain(c.imm(width)?),
                }
            }
            0xC8 => {
                self.require_186(opcode)?;
                let size = c.imm16()?;
                let level = c.imm8()?;
                Operation::Enter {
                    width: wv,
                    size,
                    level,
                }
            }
            0xC9 => {
                self.require_186(opcode)?;
                Operation::Leave { width: wv }
            }
            0xCA => Operation::RetFar {
                width: wv,
                pop: Some(c.imm16()?),
            },
            0xCB => Operation::RetFar {
                width: wv,
                pop: None,
            },
            0xCC => Operation::Int3,
            0xCD => Operation::Int { vector: c.imm8()? },
            0xCE => Operation::Into,
            0xCF => Operation::Iret { width: wv },
            0xD4 => Operation::Aam { base: c.imm8()? },
            0xD5 => Operation::Aad { base: c.imm8()? },
            0xD6 => Operation::Salc,
            0xD7 => Operation::Xlat {
                segment: data_segment,
                address_size_32: p.address_size_32,
            },
            0xD8..=0xDF => Operation::FpuEscape {
                opcode: op,
                modrm: c.modrm(p)?,
            },
            0xE0..=0xE3 => Operation::Loop {
                kind: match op {
                    0xE0 => LoopKind::Loopnz,
                    0xE1 => LoopKind::Loopz,
                    0xE2 => LoopKind::Loop,
                    _ => LoopKind::Jcxz,
                },
                disp: c.fixed(FieldKind::Displacement, 1)?,
                address_size_32: p.address_size_32,
            },
            0xE4 | 0xE5 => Operation::In {
                width: if op == 0xE4 { Width::Byte } else { wv },
                port: Some(c.imm8()?),
            },
            0xE6 | 0xE7 => Operation::Out {
                width: if op == 0xE6 { Width::Byte } else { wv },
                port: Some(c.imm8()?),
            },
            0xE8 => Operation::CallRel {
                width: wv,
                disp: c.fixed(FieldKind::Displacement, wv.bytes() as usize)?,
            },
            0xE9 => Operation::JmpRel {
                disp: c.fixed(FieldKind::Displacement, wv.bytes() as usize)?,
            },
            0xEA => {
                let offset = c.fixed(FieldKind::Offset, wv.bytes() as usize)?;
                let segment = c.fixed(FieldKind::Segment, 2)?;
                Operation::JmpFar { offset, segment }
            }
            0xEB => Operation::JmpRel {
                disp: c.fixed(FieldKind::Displacement, 1)?,
            },
            0xEC | 0xED => Operation::In {
                width: if op == 0xEC { Width::Byte } else { wv },
                port: None,
            },
            0xEE | 0xEF => Operation::Out {
                width: if op == 0xEE { Width::Byte } else { wv },
                port: None,
            },
            0xF4 => Operation::Hlt,
            0xF5 => Operation::Cmc,
            // Group 3
            0xF6 | 0xF7 => {
                let width = if op == 0xF6 { Width::Byte } else { wv };
                let modrm = c.modrm(p)?;
                match modrm.reg {
                    0 => Operation::TestRmImm {
                        width,
                        modrm,
                        imm: Imm::plain(c.imm(width)?),
                    },
                    2 => Operation::Not { width, modrm },
                    3 => Operation::Neg { width, modrm },
                    4 => Operation::Mul { width, modrm },
                    5 => Operation::Imul { width, modrm },
                    6 => Operation::Div { width, modrm },
                    7 => Operation::Idiv { width, modrm },
                    index => return Err(Fault::InvalidGroupIndex { opcode, index }),
                }
            }
            0xF8 => Operation::Clc,
            0xF9 => Operation::Stc,
            0xFA => Operation::Cli,
            0xFB => Operation::Sti,
            0xFC => Operation::Cld,
            0xFD => Operation::Std,
            // Group 4
            0xFE => {
                let modrm_byte = c.peek();
                let modrm = c.modrm(p)?;
                match modrm.reg {
                    0 => Operation::IncRm {
                        width: Width::Byte,
                        modrm,
                    },
                    1 => Operation::DecRm {
                        width: Width::Byte,
                        modrm,
                    },
                    7 if modrm_byte == 0x38 => Operation::Callback {
                        number: c.fixed(FieldKind::Immediate, 2)?,
                    },
                    index => return Err(Fault::InvalidGroupIndex { opcode, index }),
                }
            }
            // Group 5
            0xFF => {
                let modrm = c.modrm(p)?;
                match modrm.reg {
                    0 => Operation::IncRm { width: wv, modrm },
                    1 => Operation::DecRm { width: wv, modrm },
                    2 => Operation::CallNearRm { width: wv, modrm },
                    3 if !modrm.is_register() => Operation::CallFarRm { width: wv, modrm },
                    4 => Operation::JmpNearRm { width: wv, modrm },
                    5 if !modrm.is_register() => Operation::JmpFarRm { width: wv, modrm },
                    6 => Operation::PushRm { width: wv, modrm },
                    3 | 5 => return Err(invalid),
                    index => return Err(Fault::InvalidGroupIndex { opcode, index }),
                }
            }
            // BOUND, ARPL, POP CS, ICEBP, and what the model lacks
            _ => return Err(invalid),
        };
        Ok(operation)
    }

    fn decode_two_byte(
        &self,
        c: &mut Cursor,
        p: &PrefixSummary,
        op: u8,
    ) -> Result<Operation, Fault> {
        let opcode = 0x0F00 | op as u16;
        let wv = Width::word_or_dword(p.operand_size_32);
        let operation = match op {
            0x80..=0x8F => Operation::Jcc {
                cc: op & 0x0F,
                disp: c.fixed(FieldKind::Displacement, wv.bytes() as usize)?,
            },
            0x90..=0x9F => Operation::SetCc {
                cc: op & 0x0F,
                modrm: c.modrm(p)?,
            },
            0xA0 | 0xA8 => Operation::PushSreg {
                width: wv,
                sreg: if op == 0xA0 { SegReg::Fs } else { SegReg::Gs },
            },
            0xA1 | 0xA9 => Operation::PopSreg {
                width: wv,
                sreg: if op == 0xA1 { SegReg::Fs } else { SegReg::Gs },
            },
            0xA3 | 0xAB | 0xB3 | 0xBB => Operation::BitTestReg {
                op: BitOp::from_index((op >> 3) & 3),
                width: wv,
                modrm: c.modrm(p)?,
            },
            0xBA => {
                let modrm = c.modrm(p)?;
                if modrm.reg < 4 {
                    return Err(Fault::InvalidGroupIndex {
                        opcode,
                        index: modrm.reg,
                    });
                }
                Operation::BitTestImm {
                    op: BitOp::from_index(modrm.reg),
                    width: wv,
                    modrm,
                    imm: c.imm8()?,
                }
            }
            0xA4 | 0xA5 | 0xAC | 0xAD => {
                let modrm = c.modrm(p)?;
                let count = if op & 1 == 0 {
                    ShiftCount::Imm(c.imm8()?)
                } else {
                    ShiftCount::Cl
                };
                if op < 0xAC {
                    Operation::Shld {
                        width: wv,
                        modrm,
                        count,
                    }
                } else {
                    Operation::Shrd {
                        width: wv,
                        modrm,
                        count,
                    }
                }
            }
            0xAF => Operation::ImulRegRm {
                width: wv,
                modrm: c.modrm(p)?,
            },
            0xB2 | 0xB4 | 0xB5 => Operation::LoadFarPointer {
                width: wv,
                modrm: c.memory_modrm(p, opcode)?,
                sreg: match op {
                    0xB2 => SegReg::Ss,
                    0xB4 => SegReg::Fs,
                    _ => SegReg::Gs,
                },
            },
            0xB6 | 0xB7 => Operation::Movzx {
                width: wv,
                src_width: if op == 0xB6 { Width::Byte } else { Width::Word },
                modrm: c.modrm(p)?,
            },
            0xBE | 0xBF => Operation::Movsx {
                width: wv,
                src_width: if op == 0xBE { Width::Byte } else { Width::Word },
                modrm: c.modrm(p)?,
            },
            0xBC => Operation::Bsf {
                width: wv,
                modrm: c.modrm(p)?,
            },
            0xBD => Operation::Bsr {
                width: wv,
                modrm: c.modrm(p)?,
            },
            _ => return Err(Fault::InvalidOpcode { opcode }),
        };
        Ok(operation)
    }

    fn string_op(&self, op: StringOp, width: Width, p: &PrefixSummary) -> Operation {
        Operation::StringOp {
            op,
            width,
            rep: p.rep,
            segment: p.segment_or(SegReg::Ds),
            address_size_32: p.address_size_32,
        }
    }

    /// Segment register named by a ModRM `reg` field
    fn segment_register(&self, index: u8, opcode: u16) -> Result<SegReg, Fault> {
        let sreg = SegReg::from_index(index).ok_or(Fault::InvalidOpcode { opcode })?;
        if matches!(sreg, SegReg::Fs | SegReg::Gs) && !self.model.supports_80386_instructions() {
            return Err(Fault::InvalidOpcode { opcode });
        }
        Ok(sreg)
    }
}
