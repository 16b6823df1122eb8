//! Byte spans inside an instruction.

use crate::bus::Memory;
use std::fmt;

/// What a span of instruction bytes encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Prefix,
    Opcode,
    ModRm,
    Sib,
    Displacement,
    Immediate,
    /// Offset half of a far pointer or a `moffs` operand
    Offset,
    /// Segment half of a far pointer
    Segment,
}

impl FieldKind {
    /// Whether fields of this kind are part of the instruction identity unless the decoder says otherwise
    pub fn is_final_by_default(self) -> bool {
        !matches!(
            self,
            FieldKind::Displacement | FieldKind::Immediate | FieldKind::Offset
        )
    }
}

/// Index of a field inside its node's `fields`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef(pub(crate) u8);

impl FieldRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One field of a decoded instruction.
///
/// Final fields select what the instruction is (prefixes, opcode, ModRM, branch targets) and their
/// bytes are compared against memory before the node is reused. Non-final fields are operands such
/// as immediates and displacements: the node stays valid when they change, so they are read from
/// memory each time the instruction runs. The bytes captured at decode time only serve logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InstructionField {
    /// Position of the first byte, relative to the instruction start
    pub offset: u8,
    pub length: u8,
    pub kind: FieldKind,
    pub is_final: bool,
    bytes: [u8; 4],
}

impl InstructionField {
    pub const MAX_LENGTH: usize = 4;

    pub fn new(kind: FieldKind, offset: u8, bytes: &[u8]) -> Self {
        debug_assert!(
            !bytes.is_empty() && bytes.len() <= Self::MAX_LENGTH,
            "Invalid field length: {}",
            bytes.len()
        );
        let mut raw = [0; Self::MAX_LENGTH];
        let length = bytes.len().min(Self::MAX_LENGTH);
        raw[..length].copy_from_slice(&bytes[..length]);
        Self {
            offset,
            length: length as u8,
            kind,
            is_final: kind.is_final_by_default(),
            bytes: raw,
        }
    }

    /// Same field with its finality overridden
    pub fn with_final(mut self, is_final: bool) -> Self {
        self.is_final = is_final;
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    /// Little-endian value, zero-extended
    #[inline]
    pub fn value(&self) -> u32 {
        self.bytes()
            .iter()
            .rev()
            .fold(0u32, |acc, &b| acc << 8 | b as u32)
    }

    /// Little-endian value, sign-extended from the field length
    #[inline]
    pub fn signed_value(&self) -> i32 {
        sign_extend(self.value(), self.length)
    }

    /// Current value: the capture for final fields, memory for the others
    pub fn read(&self, memory: &dyn Memory, instruction_start: u32) -> u32 {
        if self.is_final {
            return self.value();
        }
        let address = instruction_start.wrapping_add(self.offset as u32);
        (0..self.length as u32).rev().fold(0u32, |acc, i| {
            acc << 8 | memory.sneak_read_u8(address.wrapping_add(i)) as u32
        })
    }

    /// [`Self::read`], sign-extended from the field length
    pub fn read_signed(&self, memory: &dyn Memory, instruction_start: u32) -> i32 {
        sign_extend(self.read(memory, instruction_start), self.length)
    }

    /// True when memory at `instruction_start + offset` still holds these bytes
    pub fn matches(&self, memory: &dyn Memory, instruction_start: u32) -> bool {
        memory.slice_matches(
            instruction_start.wrapping_add(self.offset as u32),
            self.bytes(),
        )
    }
}

fn sign_extend(value: u32, length: u8) -> i32 {
    match length {
        1 => value as u8 as i8 as i32,
        2 => value as u16 as i16 as i32,
        _ => value as i32,
    }
}

impl fmt::Debug for InstructionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.is_final { "" } else { "~" };
        write!(f, "{}{:?}@{}[", marker, self.kind, self.offset)?;
        for (i, b) in self.bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, "]")
    }
}
