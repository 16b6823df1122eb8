//! Decoded instruction as stored in the control flow graph.

use super::field::{FieldKind, FieldRef, InstructionField};
use super::operation::Operation;
use super::prefix::Prefix;
use crate::address::SegmentedAddress;
use crate::bus::Memory;
use crate::cfg::NodeId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgInstruction {
    pub address: SegmentedAddress,
    pub prefixes: Vec<Prefix>,
    /// Contiguous and in byte order, starting at offset 0
    pub fields: Vec<InstructionField>,
    pub length: u16,
    pub operation: Operation,
    /// Successor at `address + length`
    pub fallthrough: Option<NodeId>,
    /// Successor anywhere else
    pub branch: Option<NodeId>,
    pub predecessors: Vec<NodeId>,
}

impl CfgInstruction {
    pub fn new(
        address: SegmentedAddress,
        prefixes: Vec<Prefix>,
        fields: Vec<InstructionField>,
        operation: Operation,
    ) -> Self {
        let length = fields.iter().map(|f| f.length as u16).sum();
        Self {
            address,
            prefixes,
            fields,
            length,
            operation,
            fallthrough: None,
            branch: None,
            predecessors: Vec::new(),
        }
    }

    #[inline]
    pub fn field(&self, field: FieldRef) -> &InstructionField {
        &self.fields[field.index()]
    }

    /// Current value of `field`; operand fields come from memory
    #[inline]
    pub fn value(&self, memory: &dyn Memory, field: FieldRef) -> u32 {
        self.field(field).read(memory, self.address.linear())
    }

    #[inline]
    pub fn signed(&self, memory: &dyn Memory, field: FieldRef) -> i32 {
        self.field(field).read_signed(memory, self.address.linear())
    }

    /// Opcode bytes as one number (`0F xx` for the two-byte page)
    pub fn opcode(&self) -> u16 {
        self.fields
            .iter()
            .find(|f| f.kind == FieldKind::Opcode)
            .map(|f| f.bytes().iter().fold(0u16, |acc, &b| acc << 8 | b as u16))
            .unwrap_or(0)
    }

    /// Address right after this instruction
    #[inline]
    pub fn next_in_memory(&self) -> SegmentedAddress {
        self.address.wrapping_add(self.length)
    }

    /// Linear span covered by the instruction bytes
    pub fn linear_range(&self) -> Range<u32> {
        let start = self.address.linear();
        start..start + self.length as u32
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.fields
            .iter()
            .flat_map(|f| f.bytes().iter().copied())
            .collect()
    }

    pub fn final_fields(&self) -> impl Iterator<Item = &InstructionField> + '_ {
        self.fields.iter().filter(|f| f.is_final)
    }

    /// True when memory still holds the final bytes this node was decoded from
    pub fn matches_memory(&self, memory: &dyn Memory) -> bool {
        let start = self.address.linear();
        self.final_fields().all(|f| f.matches(memory, start))
    }

    /// Hash of the address and the final bytes, blind to operand changes
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.address.linear().hash(&mut hasher);
        for field in self.final_fields() {
            field.offset.hash(&mut hasher);
            field.bytes().hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn successors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.fallthrough.iter().chain(self.branch.iter()).copied()
    }

    pub fn successor_count(&self) -> usize {
        self.fallthrough.is_some() as usize + self.branch.is_some() as usize
    }

    pub fn is_join_point(&self) -> bool {
        self.predecessors.len() > 1
    }

    /// Hex bytes and mnemonic, for logs
    pub fn describe(&self) -> String {
        let bytes: Vec<String> = self.bytes().iter().map(|b| format!("{:02X}", b)).collect();
        format!(
            "{} {:<20} {}",
            self.address,
            bytes.join(" "),
            self.operation.mnemonic()
        )
    }
}
