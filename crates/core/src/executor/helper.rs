//! Everything an instruction may touch while it executes.
//!
//! [`ExecutionHelper`] borrows the register file, memory, I/O ports and callbacks for the duration of
//! one instruction (or one compiled block). Instructions never see the graph: they report where
//! control goes through [`ExecutionHelper::move_ip_and_set_next_node`], the jump helpers and the
//! context actions, and the driver applies those to the graph afterwards.

use crate::address::SegmentedAddress;
use crate::alu::Alu;
use crate::bus::{CallbackHandler, IoPortDispatcher, Memory};
use crate::cfg::NodeId;
use crate::error::CpuError;
use crate::instruction::{CfgInstruction, FieldRef, Imm, ModRm, RmOperand};
use crate::logging::{log, LogCategory, LogLevel};
use crate::state::{CpuState, Width};
use std::ops::Range;

/// Context change requested by the instruction that just ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAction {
    /// CALL or INT entered `entry_point`
    Push { entry_point: SegmentedAddress },
    /// RET, RETF or IRET left the current level
    Pop,
}

pub struct ExecutionHelper<'a> {
    pub state: &'a mut CpuState,
    pub memory: &'a mut dyn Memory,
    io: &'a mut dyn IoPortDispatcher,
    callbacks: &'a mut dyn CallbackHandler,
    next_node: Option<NodeId>,
    context_action: Option<ContextAction>,
    halted: bool,
    /// Set by loads of SS: no maskable interrupt before the next instruction
    interrupt_shadow: bool,
    /// Linear range whose writes are reported through `watch_hit`
    code_watch: Option<Range<u32>>,
    watch_hit: bool,
}

/// Calculate physical address from segment:offset
#[inline]
pub fn physical_address(segment: u16, offset: u32) -> u32 {
    ((segment as u32) << 4).wrapping_add(offset)
}

impl<'a> ExecutionHelper<'a> {
    pub fn new(
        state: &'a mut CpuState,
        memory: &'a mut dyn Memory,
        io: &'a mut dyn IoPortDispatcher,
        callbacks: &'a mut dyn CallbackHandler,
    ) -> Self {
        Self {
            state,
            memory,
            io,
            callbacks,
            next_node: None,
            context_action: None,
            halted: false,
            interrupt_shadow: false,
            code_watch: None,
            watch_hit: false,
        }
    }

    /// Forget what the previous instruction reported
    pub fn begin_instruction(&mut self) {
        self.next_node = None;
        self.context_action = None;
        self.interrupt_shadow = false;
        self.watch_hit = false;
    }

    pub fn next_node(&self) -> Option<NodeId> {
        self.next_node
    }

    pub fn take_context_action(&mut self) -> Option<ContextAction> {
        self.context_action.take()
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Hold hardware interrupts until the instruction after this one has run
    pub fn inhibit_interrupts(&mut self) {
        self.interrupt_shadow = true;
    }

    pub fn interrupt_shadow(&self) -> bool {
        self.interrupt_shadow
    }

    pub fn set_code_watch(&mut self, range: Option<Range<u32>>) {
        self.code_watch = range;
        self.watch_hit = false;
    }

    /// True when the last instruction wrote into the watched code range
    pub fn watch_hit(&self) -> bool {
        self.watch_hit
    }

    #[inline]
    pub fn alu(&mut self) -> Alu<'_> {
        Alu::new(&mut self.state.flags)
    }

    // Control flow

    /// Sequential instruction done: IP moves past it and the fallthrough edge is the expected successor
    #[inline]
    pub fn move_ip_and_set_next_node(&mut self, node: &CfgInstruction) {
        self.state.ip = self.state.ip.wrapping_add(node.length);
        self.next_node = node.fallthrough;
    }

    /// IP of the instruction following `node`
    #[inline]
    pub fn next_ip(&self, node: &CfgInstruction) -> u16 {
        node.address.offset.wrapping_add(node.length)
    }

    /// Transfer inside the code segment; the successor is looked up again on the next fetch
    #[inline]
    pub fn jump_near(&mut self, ip: u16) {
        self.state.ip = ip;
        self.next_node = None;
    }

    #[inline]
    pub fn jump_far(&mut self, segment: u16, offset: u16) {
        self.state.set_cs(segment);
        self.jump_near(offset);
    }

    /// Record that a CALL or software interrupt entered the code now at CS:IP
    pub fn enter_context(&mut self) {
        self.context_action = Some(ContextAction::Push {
            entry_point: self.state.cs_ip(),
        });
        self.next_node = None;
    }

    /// Record that a RET or IRET left the current context
    pub fn leave_context(&mut self) {
        self.context_action = Some(ContextAction::Pop);
        self.next_node = None;
    }

    pub fn halt(&mut self, node: &CfgInstruction) {
        self.move_ip_and_set_next_node(node);
        self.halted = true;
    }

    // Memory

    #[inline]
    pub fn read(&self, width: Width, segment: u16, offset: u32) -> u32 {
        let addr = physical_address(segment, offset);
        match width {
            Width::Byte => self.memory.read_u8(addr) as u32,
            Width::Word => self.memory.read_u16(addr) as u32,
            Width::Dword => self.memory.read_u32(addr),
        }
    }

    #[inline]
    pub fn write(&mut self, width: Width, segment: u16, offset: u32, value: u32) {
        let addr = physical_address(segment, offset);
        if let Some(watch) = &self.code_watch {
            let end = addr.wrapping_add(width.bytes() as u32);
            if addr < watch.end && watch.start < end {
                self.watch_hit = true;
            }
        }
        match width {
            Width::Byte => self.memory.write_u8(addr, value as u8),
            Width::Word => self.memory.write_u16(addr, value as u16),
            Width::Dword => self.memory.write_u32(addr, value),
        }
    }

    /// Register or memory operand of `modrm`, address computed once
    #[inline]
    pub fn resolve(&self, node: &CfgInstruction, modrm: &ModRm) -> RmOperand {
        modrm.resolve(node, &*self.memory, &*self.state)
    }

    /// Value of an instruction field as the bytes are now
    #[inline]
    pub fn field(&self, node: &CfgInstruction, field: FieldRef) -> u32 {
        node.value(&*self.memory, field)
    }

    #[inline]
    pub fn field_signed(&self, node: &CfgInstruction, field: FieldRef) -> i32 {
        node.signed(&*self.memory, field)
    }

    /// Immediate operand masked to `width`
    #[inline]
    pub fn imm(&self, node: &CfgInstruction, imm: &Imm, width: Width) -> u32 {
        imm.resolve(node, &*self.memory, width)
    }

    #[inline]
    pub fn read_operand(&self, width: Width, operand: RmOperand) -> u32 {
        match operand {
            RmOperand::Register(reg) => self.state.reg(width, reg),
            RmOperand::Memory { segment, offset } => self.read(width, segment, offset),
        }
    }

    #[inline]
    pub fn write_operand(&mut self, width: Width, operand: RmOperand, value: u32) {
        match operand {
            RmOperand::Register(reg) => self.state.set_reg(width, reg, value),
            RmOperand::Memory { segment, offset } => self.write(width, segment, offset, value),
        }
    }

    pub fn read_rm(&self, node: &CfgInstruction, modrm: &ModRm, width: Width) -> u32 {
        self.read_operand(width, self.resolve(node, modrm))
    }

    pub fn write_rm(&mut self, node: &CfgInstruction, modrm: &ModRm, width: Width, value: u32) {
        let operand = self.resolve(node, modrm);
        self.write_operand(width, operand, value);
    }

    /// Register selected by the ModRM `reg` field
    #[inline]
    pub fn read_reg(&self, modrm: &ModRm, width: Width) -> u32 {
        self.state.reg(width, modrm.reg)
    }

    #[inline]
    pub fn write_reg(&mut self, modrm: &ModRm, width: Width, value: u32) {
        self.state.set_reg(width, modrm.reg, value);
    }

    // Stack

    /// Push onto SS:SP; SP wraps at 64 KiB
    pub fn push(&mut self, width: Width, value: u32) {
        let sp = self.state.sp().wrapping_sub(width.bytes());
        self.state.set_sp(sp);
        let ss = self.state.ss();
        self.write(width, ss, sp as u32, value);
    }

    pub fn pop(&mut self, width: Width) -> u32 {
        let sp = self.state.sp();
        let value = self.read(width, self.state.ss(), sp as u32);
        self.state.set_sp(sp.wrapping_add(width.bytes()));
        value
    }

    // I/O

    pub fn port_in(&mut self, width: Width, port: u16) -> u32 {
        let value = match width {
            Width::Byte => self.io.read_byte(port) as u32,
            Width::Word => self.io.read_word(port) as u32,
            Width::Dword => self.io.read_dword(port),
        };
        log(LogCategory::Io, LogLevel::Trace, || {
            format!("IN {:04X} -> {:X}", port, value)
        });
        value
    }

    pub fn port_out(&mut self, width: Width, port: u16, value: u32) {
        log(LogCategory::Io, LogLevel::Trace, || {
            format!("OUT {:04X} <- {:X}", port, value)
        });
        match width {
            Width::Byte => self.io.write_byte(port, value as u8),
            Width::Word => self.io.write_word(port, value as u16),
            Width::Dword => self.io.write_dword(port, value),
        }
    }

    // Interrupts

    /// Interrupt gate: push FLAGS, CS and `return_ip`, clear IF and TF, jump through the vector table.
    ///
    /// Returns the handler address. The caller decides which context the transfer belongs to.
    pub fn interrupt(&mut self, vector: u8, return_ip: u16) -> Result<SegmentedAddress, CpuError> {
        let entry = vector as u32 * 4;
        let offset = self.memory.read_u16(entry);
        let segment = self.memory.read_u16(entry + 2);
        if segment == 0 && offset == 0 {
            return Err(CpuError::UninitializedInterruptVector {
                vector,
                address: self.state.cs_ip(),
            });
        }
        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!(
                "INT {:02X} from {:04X}:{:04X} to {:04X}:{:04X}",
                vector,
                self.state.cs(),
                return_ip,
                segment,
                offset
            )
        });
        let flags = self.state.flags.bits16() as u32;
        let cs = self.state.cs() as u32;
        self.push(Width::Word, flags);
        self.push(Width::Word, cs);
        self.push(Width::Word, return_ip as u32);
        self.state.flags.interrupt = false;
        self.state.flags.trap = false;
        self.jump_far(segment, offset);
        Ok(SegmentedAddress::new(segment, offset))
    }

    /// INT n, INT3 and INTO: interrupt returning after `node`, entering a new context
    pub fn software_interrupt(&mut self, node: &CfgInstruction, vector: u8) -> Result<(), CpuError> {
        let return_ip = self.next_ip(node);
        self.interrupt(vector, return_ip)?;
        self.enter_context();
        Ok(())
    }

    /// IRET: pop IP, CS and FLAGS
    pub fn interrupt_return(&mut self, width: Width) {
        let ip = self.pop(width);
        let cs = self.pop(width);
        let flags = self.pop(width);
        match width {
            Width::Dword => self.state.flags.set_bits(flags),
            _ => self.state.flags.set_bits(flags & 0xFFFF),
        }
        self.jump_far(cs as u16, ip as u16);
        self.leave_context();
    }

    /// Run host callback `number`; IP then moves past the callback instruction
    pub fn run_callback(&mut self, node: &CfgInstruction, number: u16) -> Result<(), CpuError> {
        let before = self.state.cs_ip();
        log(LogCategory::Interrupts, LogLevel::Trace, || {
            format!("callback {:04X} at {}", number, before)
        });
        self.callbacks
            .run(number, &mut *self.state, &mut *self.memory)?;
        let after = self.state.cs_ip();
        if after.segment == before.segment && after.offset == before.offset {
            self.move_ip_and_set_next_node(node);
        } else {
            self.state.ip = self.state.ip.wrapping_add(node.length);
            self.next_node = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{CallbackRegistry, NullIoPorts, Ram};

    #[test]
    fn test_push_pop_wrap_sp() {
        let mut state = CpuState::new();
        let mut ram = Ram::new();
        let mut io = NullIoPorts;
        let mut callbacks = CallbackRegistry::new();
        let mut helper = ExecutionHelper::new(&mut state, &mut ram, &mut io, &mut callbacks);
        helper.state.set_ss(0x2000);
        helper.state.set_sp(0x0000);
        helper.push(Width::Word, 0xBEEF);
        assert_eq!(helper.state.sp(), 0xFFFE);
        assert_eq!(helper.memory.read_u16(0x2FFFE), 0xBEEF);
        assert_eq!(helper.pop(Width::Word), 0xBEEF);
        assert_eq!(helper.state.sp(), 0x0000);
    }

    #[test]
    fn test_interrupt_frame() {
        let mut state = CpuState::new();
        let mut ram = Ram::new();
        ram.write_u16(0x21 * 4, 0x0100);
        ram.write_u16(0x21 * 4 + 2, 0xF000);
        let mut io = NullIoPorts;
        let mut callbacks = CallbackRegistry::new();
        let mut helper = ExecutionHelper::new(&mut state, &mut ram, &mut io, &mut callbacks);
        helper.state.set_cs_ip(SegmentedAddress::new(0x1000, 0x0010));
        helper.state.set_ss(0x3000);
        helper.state.set_sp(0x0100);
        helper.state.flags.interrupt = true;

        let handler = helper.interrupt(0x21, 0x0012).expect("vector set");
        assert_eq!(handler, SegmentedAddress::new(0xF000, 0x0100));
        assert_eq!(helper.state.cs_ip(), handler);
        assert!(!helper.state.flags.interrupt);
        assert_eq!(helper.pop(Width::Word), 0x0012);
        assert_eq!(helper.pop(Width::Word), 0x1000);
        assert_eq!(helper.pop(Width::Word) & 0x0200, 0x0200);
    }

    #[test]
    fn test_zero_vector_is_fatal() {
        let mut state = CpuState::new();
        let mut ram = Ram::new();
        let mut io = NullIoPorts;
        let mut callbacks = CallbackRegistry::new();
        let mut helper = ExecutionHelper::new(&mut state, &mut ram, &mut io, &mut callbacks);
        let err = helper.interrupt(0x10, 0).unwrap_err();
        assert!(matches!(
            err,
            CpuError::UninitializedInterruptVector { vector: 0x10, .. }
        ));
    }

    #[test]
    fn test_code_watch() {
        let mut state = CpuState::new();
        let mut ram = Ram::new();
        let mut io = NullIoPorts;
        let mut callbacks = CallbackRegistry::new();
        let mut helper = ExecutionHelper::new(&mut state, &mut ram, &mut io, &mut callbacks);
        helper.set_code_watch(Some(0x1000..0x1010));
        helper.write(Width::Word, 0x0000, 0x0FFE, 0x1234);
        assert!(!helper.watch_hit());
        helper.write(Width::Word, 0x0000, 0x0FFF, 0x1234);
        assert!(helper.watch_hit(), "second byte lands in the range");
    }
}
