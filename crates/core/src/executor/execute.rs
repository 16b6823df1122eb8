//! Instruction semantics.
//!
//! [`execute`] is the single dispatch point: one arm per [`Operation`]. Sequential instructions fall
//! through to the common IP advance at the end; control transfers return early after setting CS:IP
//! themselves. A [`Fault`] leaves IP on the faulting instruction.

use super::helper::ExecutionHelper;
use crate::alu::{Alu, SHIFT_COUNT_MASK};
use crate::error::{CpuError, Fault};
use crate::instruction::{
    AluOp, BitOp, CfgInstruction, FieldRef, LoopKind, ModRm, Operation, RepKind, RmOperand, ShiftCount,
    ShiftOp, StringOp,
};
use crate::logging::{log, LogCategory, LogLevel};
use crate::state::{
    SegReg, Width, REG_AX, REG_BP, REG_BX, REG_CX, REG_DI, REG_DX, REG_SI, REG_SP,
};

pub fn execute(node: &CfgInstruction, h: &mut ExecutionHelper) -> Result<(), CpuError> {
    match node.operation {
        // Arithmetic and logic
        Operation::AluRmReg { op, width, modrm } => {
            let operand = h.resolve(node, &modrm);
            let dst = h.read_operand(width, operand);
            let src = h.read_reg(&modrm, width);
            let res = alu_op(&mut h.alu(), op, width, dst, src);
            if op.writes_result() {
                h.write_operand(width, operand, res);
            }
        }
        Operation::AluRegRm { op, width, modrm } => {
            let src = h.read_rm(node, &modrm, width);
            let dst = h.read_reg(&modrm, width);
            let res = alu_op(&mut h.alu(), op, width, dst, src);
            if op.writes_result() {
                h.write_reg(&modrm, width, res);
            }
        }
        Operation::AluAccImm { op, width, imm } => {
            let dst = h.state.reg(width, REG_AX);
            let src = h.imm(node, &imm, width);
            let res = alu_op(&mut h.alu(), op, width, dst, src);
            if op.writes_result() {
                h.state.set_reg(width, REG_AX, res);
            }
        }
        Operation::AluRmImm {
            op,
            width,
            modrm,
            imm,
        } => {
            let operand = h.resolve(node, &modrm);
            let dst = h.read_operand(width, operand);
            let src = h.imm(node, &imm, width);
            let res = alu_op(&mut h.alu(), op, width, dst, src);
            if op.writes_result() {
                h.write_operand(width, operand, res);
            }
        }
        Operation::TestRmReg { width, modrm } => {
            let dst = h.read_rm(node, &modrm, width);
            let src = h.read_reg(&modrm, width);
            h.alu().and(width, dst, src);
        }
        Operation::TestAccImm { width, imm } => {
            let acc = h.state.reg(width, REG_AX);
            let src = h.imm(node, &imm, width);
            h.alu().and(width, acc, src);
        }
        Operation::TestRmImm { width, modrm, imm } => {
            let dst = h.read_rm(node, &modrm, width);
            let src = h.imm(node, &imm, width);
            h.alu().and(width, dst, src);
        }
        Operation::IncReg { width, reg } => {
            let value = h.state.reg(width, reg);
            let res = h.alu().inc(width, value);
            h.state.set_reg(width, reg, res);
        }
        Operation::DecReg { width, reg } => {
            let value = h.state.reg(width, reg);
            let res = h.alu().dec(width, value);
            h.state.set_reg(width, reg, res);
        }
        Operation::IncRm { width, modrm } => {
            let operand = h.resolve(node, &modrm);
            let value = h.read_operand(width, operand);
            let res = h.alu().inc(width, value);
            h.write_operand(width, operand, res);
        }
        Operation::DecRm { width, modrm } => {
            let operand = h.resolve(node, &modrm);
            let value = h.read_operand(width, operand);
            let res = h.alu().dec(width, value);
            h.write_operand(width, operand, res);
        }
        Operation::Not { width, modrm } => {
            let operand = h.resolve(node, &modrm);
            let value = h.read_operand(width, operand);
            h.write_operand(width, operand, !value & width.mask());
        }
        Operation::Neg { width, modrm } => {
            let operand = h.resolve(node, &modrm);
            let value = h.read_operand(width, operand);
            let res = h.alu().sub(width, 0, value);
            h.write_operand(width, operand, res);
        }
        Operation::Mul { width, modrm } => {
            let src = h.read_rm(node, &modrm, width);
            let acc = h.state.reg(width, REG_AX);
            let product = h.alu().mul(width, acc, src);
            store_double(h, width, product);
        }
        Operation::Imul { width, modrm } => {
            let src = h.read_rm(node, &modrm, width);
            let acc = h.state.reg(width, REG_AX);
            let product = h.alu().imul(width, acc, src);
            store_double(h, width, product);
        }
        Operation::Div { width, modrm } => {
            let divisor = h.read_rm(node, &modrm, width);
            let dividend = load_double(h, width);
            let (quotient, remainder) = h.alu().div(width, dividend, divisor)?;
            store_quotient(h, width, quotient, remainder);
        }
        Operation::Idiv { width, modrm } => {
            let divisor = h.read_rm(node, &modrm, width);
            let dividend = load_double(h, width);
            let (quotient, remainder) = h.alu().idiv(width, dividend, divisor)?;
            store_quotient(h, width, quotient, remainder);
        }
        Operation::ImulRegRm { width, modrm } => {
            let src = h.read_rm(node, &modrm, width);
            let dst = h.read_reg(&modrm, width);
            let product = h.alu().imul(width, dst, src);
            h.write_reg(&modrm, width, product as u32 & width.mask());
        }
        Operation::ImulRegRmImm { width, modrm, imm } => {
            let src = h.read_rm(node, &modrm, width);
            let factor = h.imm(node, &imm, width);
            let product = h.alu().imul(width, src, factor);
            h.write_reg(&modrm, width, product as u32 & width.mask());
        }
        Operation::Shift {
            op,
            width,
            modrm,
            count,
            masked_count,
        } => {
            let mut count = shift_count(node, h, count);
            if masked_count {
                count &= SHIFT_COUNT_MASK;
            }
            let operand = h.resolve(node, &modrm);
            let value = h.read_operand(width, operand);
            let res = shift(&mut h.alu(), op, width, value, count);
            h.write_operand(width, operand, res);
        }
        Operation::Shld {
            width,
            modrm,
            count,
        } => {
            let count = shift_count(node, h, count);
            let operand = h.resolve(node, &modrm);
            let dst = h.read_operand(width, operand);
            let src = h.read_reg(&modrm, width);
            let res = h.alu().shld(width, dst, src, count);
            h.write_operand(width, operand, res);
        }
        Operation::Shrd {
            width,
            modrm,
            count,
        } => {
            let count = shift_count(node, h, count);
            let operand = h.resolve(node, &modrm);
            let dst = h.read_operand(width, operand);
            let src = h.read_reg(&modrm, width);
            let res = h.alu().shrd(width, dst, src, count);
            h.write_operand(width, operand, res);
        }
        Operation::BitTestReg { op, width, modrm } => {
            let offset = h.read_reg(&modrm, width);
            bit_test(node, h, op, width, &modrm, offset, true);
        }
        Operation::BitTestImm {
            op,
            width,
            modrm,
            imm,
        } => {
            let offset = h.field(node, imm);
            bit_test(node, h, op, width, &modrm, offset, false);
        }
        Operation::Bsf { width, modrm } => {
            let src = h.read_rm(node, &modrm, width);
            h.state.flags.zero = src == 0;
            if src != 0 {
                h.write_reg(&modrm, width, src.trailing_zeros());
            }
        }
        Operation::Bsr { width, modrm } => {
            let src = h.read_rm(node, &modrm, width);
            h.state.flags.zero = src == 0;
            if src != 0 {
                h.write_reg(&modrm, width, 31 - src.leading_zeros());
            }
        }
        Operation::Daa => {
            let al = h.state.al();
            let res = h.alu().daa(al);
            h.state.set_al(res);
        }
        Operation::Das => {
            let al = h.state.al();
            let res = h.alu().das(al);
            h.state.set_al(res);
        }
        Operation::Aaa => {
            let ax = h.state.ax();
            let res = h.alu().aaa(ax);
            h.state.set_ax(res);
        }
        Operation::Aas => {
            let ax = h.state.ax();
            let res = h.alu().aas(ax);
            h.state.set_ax(res);
        }
        Operation::Aam { base } => {
            let al = h.state.al();
            let base = h.field(node, base) as u8;
            let res = h.alu().aam(al, base)?;
            h.state.set_ax(res);
        }
        Operation::Aad { base } => {
            let ax = h.state.ax();
            let base = h.field(node, base) as u8;
            let res = h.alu().aad(ax, base);
            h.state.set_ax(res);
        }
        Operation::Salc => {
            let al = if h.state.flags.carry { 0xFF } else { 0x00 };
            h.state.set_al(al);
        }
        Operation::Cbw { width } => match width {
            Width::Dword => {
                let ax = h.state.ax() as u32;
                h.state.set_eax(Width::Word.sign_extend(ax));
            }
            _ => {
                let al = h.state.al() as u32;
                h.state.set_ax(Width::Byte.sign_extend(al) as u16);
            }
        },
        Operation::Cwd { width } => match width {
            Width::Dword => {
                let high = if h.state.eax() & 0x8000_0000 != 0 {
                    0xFFFF_FFFF
                } else {
                    0
                };
                h.state.set_edx(high);
            }
            _ => {
                let high = if h.state.ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
                h.state.set_dx(high);
            }
        },

        // Data movement
        Operation::MovRmReg { width, modrm } => {
            let value = h.read_reg(&modrm, width);
            h.write_rm(node, &modrm, width, value);
        }
        Operation::MovRegRm { width, modrm } => {
            let value = h.read_rm(node, &modrm, width);
            h.write_reg(&modrm, width, value);
        }
        Operation::MovRmSreg { modrm, sreg } => {
            let value = h.state.segment(sreg) as u32;
            h.write_rm(node, &modrm, Width::Word, value);
        }
        Operation::MovSregRm { modrm, sreg } => {
            let value = h.read_rm(node, &modrm, Width::Word);
            h.state.set_segment(sreg, value as u16);
            if sreg == SegReg::Ss {
                h.inhibit_interrupts();
            }
        }
        Operation::MovRegImm { width, reg, imm } => {
            let value = h.imm(node, &imm, width);
            h.state.set_reg(width, reg, value);
        }
        Operation::MovRmImm { width, modrm, imm } => {
            let value = h.imm(node, &imm, width);
            h.write_rm(node, &modrm, width, value);
        }
        Operation::MovAccMoffs {
            width,
            offset,
            segment,
        } => {
            let value = h.read(width, h.state.segment(segment), h.field(node, offset));
            h.state.set_reg(width, REG_AX, value);
        }
        Operation::MovMoffsAcc {
            width,
            offset,
            segment,
        } => {
            let value = h.state.reg(width, REG_AX);
            let segment = h.state.segment(segment);
            let offset = h.field(node, offset);
            h.write(width, segment, offset, value);
        }
        Operation::Movzx {
            width,
            src_width,
            modrm,
        } => {
            let value = h.read_rm(node, &modrm, src_width);
            h.write_reg(&modrm, width, value);
        }
        Operation::Movsx {
            width,
            src_width,
            modrm,
        } => {
            let value = h.read_rm(node, &modrm, src_width);
            h.write_reg(&modrm, width, src_width.sign_extend(value) & width.mask());
        }
        Operation::Lea { width, modrm } => {
            let offset = modrm.effective_offset(node, &*h.memory, &*h.state);
            h.write_reg(&modrm, width, offset & width.mask());
        }
        Operation::LoadFarPointer { width, modrm, sreg } => {
            let (segment, offset) = memory_operand(node, h, &modrm)?;
            let pointer = h.read(width, segment, offset);
            let selector = h.read(Width::Word, segment, offset.wrapping_add(width.bytes() as u32));
            h.write_reg(&modrm, width, pointer);
            h.state.set_segment(sreg, selector as u16);
        }
        Operation::XchgRmReg { width, modrm } => {
            let operand = h.resolve(node, &modrm);
            let rm = h.read_operand(width, operand);
            let reg = h.read_reg(&modrm, width);
            h.write_operand(width, operand, reg);
            h.write_reg(&modrm, width, rm);
        }
        Operation::XchgAccReg { width, reg } => {
            let acc = h.state.reg(width, REG_AX);
            let other = h.state.reg(width, reg);
            h.state.set_reg(width, REG_AX, other);
            h.state.set_reg(width, reg, acc);
        }
        Operation::Nop | Operation::Wait => {}
        Operation::Xlat {
            segment,
            address_size_32,
        } => {
            let al = h.state.al() as u32;
            let offset = if address_size_32 {
                h.state.ebx().wrapping_add(al)
            } else {
                h.state.bx().wrapping_add(al as u16) as u32
            };
            let value = h.read(Width::Byte, h.state.segment(segment), offset);
            h.state.set_al(value as u8);
        }
        Operation::Lahf => {
            let flags = h.state.flags.low_byte();
            h.state.set_ah(flags);
        }
        Operation::Sahf => {
            let ah = h.state.ah();
            h.state.flags.set_low_byte(ah);
        }
        Operation::SetCc { cc, modrm } => {
            let value = h.state.flags.condition(cc) as u32;
            h.write_rm(node, &modrm, Width::Byte, value);
        }

        // Stack
        Operation::PushReg { width, reg } => {
            // PUSH SP stores the value before the decrement
            let value = h.state.reg(width, reg);
            h.push(width, value);
        }
        Operation::PopReg { width, reg } => {
            let value = h.pop(width);
            h.state.set_reg(width, reg, value);
        }
        Operation::PushSreg { width, sreg } => {
            let value = h.state.segment(sreg) as u32;
            h.push(width, value);
        }
        Operation::PopSreg { width, sreg } => {
            let value = h.pop(width);
            h.state.set_segment(sreg, value as u16);
            if sreg == SegReg::Ss {
                h.inhibit_interrupts();
            }
        }
        Operation::PushImm { width, imm } => {
            let value = h.imm(node, &imm, width);
            h.push(width, value);
        }
        Operation::PushRm { width, modrm } => {
            let value = h.read_rm(node, &modrm, width);
            h.push(width, value);
        }
        Operation::PopRm { width, modrm } => {
            let value = h.pop(width);
            h.write_rm(node, &modrm, width, value);
        }
        Operation::Pushf { width } => {
            let flags = h.state.flags.bits() & width.mask();
            h.push(width, flags);
        }
        Operation::Popf { width } => {
            let value = h.pop(width);
            h.state.flags.set_bits(value & width.mask());
        }
        Operation::Pusha { width } => {
            let sp = h.state.reg(width, REG_SP);
            for reg in [REG_AX, REG_CX, REG_DX, REG_BX] {
                let value = h.state.reg(width, reg);
                h.push(width, value);
            }
            h.push(width, sp);
            for reg in [REG_BP, REG_SI, REG_DI] {
                let value = h.state.reg(width, reg);
                h.push(width, value);
            }
        }
        Operation::Popa { width } => {
            for reg in [REG_DI, REG_SI, REG_BP] {
                let value = h.pop(width);
                h.state.set_reg(width, reg, value);
            }
            // The saved SP is skipped
            h.pop(width);
            for reg in [REG_BX, REG_DX, REG_CX, REG_AX] {
                let value = h.pop(width);
                h.state.set_reg(width, reg, value);
            }
        }
        Operation::Enter { width, size, level } => {
            let size = h.field(node, size) as u16;
            let level = h.field(node, level) & 0x1F;
            let bp = h.state.reg(width, REG_BP);
            h.push(width, bp);
            let frame = h.state.sp();
            if level > 0 {
                let mut outer_bp = h.state.bp();
                for _ in 1..level {
                    outer_bp = outer_bp.wrapping_sub(width.bytes());
                    let value = h.read(width, h.state.ss(), outer_bp as u32);
                    h.push(width, value);
                }
                h.push(width, frame as u32);
            }
            h.state.set_reg(width, REG_BP, frame as u32);
            let sp = h.state.sp().wrapping_sub(size);
            h.state.set_sp(sp);
        }
        Operation::Leave { width } => {
            let bp = h.state.bp();
            h.state.set_sp(bp);
            let value = h.pop(width);
            h.state.set_reg(width, REG_BP, value);
        }

        // Control transfer
        Operation::Jcc { cc, disp } => {
            if h.state.flags.condition(cc) {
                let target = relative_target(node, h, h.field_signed(node, disp));
                h.jump_near(target);
                return Ok(());
            }
        }
        Operation::JmpRel { disp } => {
            let target = relative_target(node, h, h.field_signed(node, disp));
            h.jump_near(target);
            return Ok(());
        }
        Operation::JmpFar { offset, segment } => {
            let segment = h.field(node, segment) as u16;
            let offset = h.field(node, offset) as u16;
            h.jump_far(segment, offset);
            return Ok(());
        }
        Operation::JmpNearRm { width, modrm } => {
            let target = h.read_rm(node, &modrm, width);
            h.jump_near(target as u16);
            return Ok(());
        }
        Operation::JmpFarRm { width, modrm } => {
            let (segment, offset) = far_pointer(node, h, width, &modrm)?;
            h.jump_far(segment, offset);
            return Ok(());
        }
        Operation::Loop {
            kind,
            disp,
            address_size_32,
        } => {
            let count = if address_size_32 {
                h.state.ecx()
            } else {
                h.state.cx() as u32
            };
            let zero = h.state.flags.zero;
            let decremented = if address_size_32 {
                count.wrapping_sub(1)
            } else {
                count.wrapping_sub(1) & 0xFFFF
            };
            let (count, taken) = match kind {
                LoopKind::Jcxz => (count, count == 0),
                LoopKind::Loop => (decremented, decremented != 0),
                LoopKind::Loopz => (decremented, decremented != 0 && zero),
                LoopKind::Loopnz => (decremented, decremented != 0 && !zero),
            };
            if address_size_32 {
                h.state.set_ecx(count);
            } else {
                h.state.set_cx(count as u16);
            }
            if taken {
                let target = relative_target(node, h, h.field_signed(node, disp));
                h.jump_near(target);
                return Ok(());
            }
        }
        Operation::CallRel { width, disp } => {
            let return_ip = h.next_ip(node);
            let target = relative_target(node, h, h.field_signed(node, disp));
            h.push(width, return_ip as u32);
            h.jump_near(target);
            h.enter_context();
            return Ok(());
        }
        Operation::CallFar {
            width,
            offset,
            segment,
        } => {
            let return_ip = h.next_ip(node);
            let cs = h.state.cs() as u32;
            h.push(width, cs);
            h.push(width, return_ip as u32);
            let segment = h.field(node, segment) as u16;
            let offset = h.field(node, offset) as u16;
            h.jump_far(segment, offset);
            h.enter_context();
            return Ok(());
        }
        Operation::CallNearRm { width, modrm } => {
            let target = h.read_rm(node, &modrm, width);
            let return_ip = h.next_ip(node);
            h.push(width, return_ip as u32);
            h.jump_near(target as u16);
            h.enter_context();
            return Ok(());
        }
        Operation::CallFarRm { width, modrm } => {
            let (segment, offset) = far_pointer(node, h, width, &modrm)?;
            let return_ip = h.next_ip(node);
            let cs = h.state.cs() as u32;
            h.push(width, cs);
            h.push(width, return_ip as u32);
            h.jump_far(segment, offset);
            h.enter_context();
            return Ok(());
        }
        Operation::RetNear { width, pop } => {
            let ip = h.pop(width);
            release_stack(node, h, pop);
            h.jump_near(ip as u16);
            h.leave_context();
            return Ok(());
        }
        Operation::RetFar { width, pop } => {
            let ip = h.pop(width);
            let cs = h.pop(width);
            release_stack(node, h, pop);
            h.jump_far(cs as u16, ip as u16);
            h.leave_context();
            return Ok(());
        }
        Operation::Int { vector } => {
            let vector = h.field(node, vector) as u8;
            return h.software_interrupt(node, vector);
        }
        Operation::Int3 => return h.software_interrupt(node, 3),
        Operation::Into => {
            if h.state.flags.overflow {
                return h.software_interrupt(node, 4);
            }
        }
        Operation::Iret { width } => {
            h.interrupt_return(width);
            return Ok(());
        }
        Operation::Hlt => {
            h.halt(node);
            return Ok(());
        }

        // Flags and misc
        Operation::Cmc => h.state.flags.carry = !h.state.flags.carry,
        Operation::Clc => h.state.flags.carry = false,
        Operation::Stc => h.state.flags.carry = true,
        Operation::Cli => h.state.flags.interrupt = false,
        Operation::Sti => h.state.flags.interrupt = true,
        Operation::Cld => h.state.flags.direction = false,
        Operation::Std => h.state.flags.direction = true,
        Operation::FpuEscape { opcode, .. } => {
            log(LogCategory::Stubs, LogLevel::Debug, || {
                format!("FPU escape {:02X} at {} ignored", opcode, node.address)
            });
        }

        // I/O
        Operation::In { width, port } => {
            let port = port_number(node, h, port);
            let value = h.port_in(width, port);
            h.state.set_reg(width, REG_AX, value);
        }
        Operation::Out { width, port } => {
            let port = port_number(node, h, port);
            let value = h.state.reg(width, REG_AX);
            h.port_out(width, port, value);
        }

        Operation::StringOp {
            op,
            width,
            rep,
            segment,
            address_size_32,
        } => string_operation(h, op, width, rep, segment, address_size_32),

        Operation::Callback { number } => {
            let number = h.field(node, number) as u16;
            return h.run_callback(node, number);
        }

        Operation::Invalid { ref fault } => return Err(fault.clone().into()),
    }
    h.move_ip_and_set_next_node(node);
    Ok(())
}

fn alu_op(alu: &mut Alu, op: AluOp, width: Width, dst: u32, src: u32) -> u32 {
    match op {
        AluOp::Add => alu.add(width, dst, src),
        AluOp::Or => alu.or(width, dst, src),
        AluOp::Adc => alu.adc(width, dst, src),
        AluOp::Sbb => alu.sbb(width, dst, src),
        AluOp::And => alu.and(width, dst, src),
        AluOp::Sub | AluOp::Cmp => alu.sub(width, dst, src),
        AluOp::Xor => alu.xor(width, dst, src),
    }
}

fn shift(alu: &mut Alu, op: ShiftOp, width: Width, value: u32, count: u32) -> u32 {
    match op {
        ShiftOp::Rol => alu.rol(width, value, count),
        ShiftOp::Ror => alu.ror(width, value, count),
        ShiftOp::Rcl => alu.rcl(width, value, count),
        ShiftOp::Rcr => alu.rcr(width, value, count),
        ShiftOp::Shl => alu.shl(width, value, count),
        ShiftOp::Shr => alu.shr(width, value, count),
        ShiftOp::Sar => alu.sar(width, value, count),
    }
}

fn shift_count(node: &CfgInstruction, h: &ExecutionHelper, count: ShiftCount) -> u32 {
    match count {
        ShiftCount::One => 1,
        ShiftCount::Cl => h.state.cl() as u32,
        ShiftCount::Imm(field) => h.field(node, field),
    }
}

/// Double-width accumulator: AX, DX:AX or EDX:EAX
fn load_double(h: &ExecutionHelper, width: Width) -> u64 {
    match width {
        Width::Byte => h.state.ax() as u64,
        Width::Word => (h.state.dx() as u64) << 16 | h.state.ax() as u64,
        Width::Dword => (h.state.edx() as u64) << 32 | h.state.eax() as u64,
    }
}

fn store_double(h: &mut ExecutionHelper, width: Width, value: u64) {
    match width {
        Width::Byte => h.state.set_ax(value as u16),
        Width::Word => {
            h.state.set_ax(value as u16);
            h.state.set_dx((value >> 16) as u16);
        }
        Width::Dword => {
            h.state.set_eax(value as u32);
            h.state.set_edx((value >> 32) as u32);
        }
    }
}

fn store_quotient(h: &mut ExecutionHelper, width: Width, quotient: u32, remainder: u32) {
    match width {
        Width::Byte => {
            h.state.set_al(quotient as u8);
            h.state.set_ah(remainder as u8);
        }
        _ => {
            h.state.set_reg(width, REG_AX, quotient);
            h.state.set_reg(width, REG_DX, remainder);
        }
    }
}

fn bit_test(
    node: &CfgInstruction,
    h: &mut ExecutionHelper,
    op: BitOp,
    width: Width,
    modrm: &ModRm,
    offset: u32,
    from_register: bool,
) {
    let bits = width.bits();
    let mut operand = h.resolve(node, modrm);
    if from_register {
        // A register bit offset reaches outside the addressed word, in both directions
        let signed = width.sign_extend(offset) as i32;
        let words = signed >> bits.trailing_zeros();
        operand = operand.offset_by(words.wrapping_mul(width.bytes() as i32));
    }
    let bit = offset & (bits - 1);
    let value = h.read_operand(width, operand);
    h.state.flags.carry = (value >> bit) & 1 != 0;
    let res = match op {
        BitOp::Bt => return,
        BitOp::Bts => value | 1 << bit,
        BitOp::Btr => value & !(1 << bit),
        BitOp::Btc => value ^ 1 << bit,
    };
    h.write_operand(width, operand, res);
}

/// Segment base value and offset of a ModRM that must address memory
fn memory_operand(
    node: &CfgInstruction,
    h: &ExecutionHelper,
    modrm: &ModRm,
) -> Result<(u16, u32), CpuError> {
    match h.resolve(node, modrm) {
        RmOperand::Memory { segment, offset } => Ok((segment, offset)),
        RmOperand::Register(_) => Err(Fault::InvalidOpcode {
            opcode: node.opcode(),
        }
        .into()),
    }
}

/// `offset:segment` pair stored in memory, as read by far JMP/CALL
fn far_pointer(
    node: &CfgInstruction,
    h: &ExecutionHelper,
    width: Width,
    modrm: &ModRm,
) -> Result<(u16, u16), CpuError> {
    let (segment, offset) = memory_operand(node, h, modrm)?;
    let target = h.read(width, segment, offset);
    let selector = h.read(Width::Word, segment, offset.wrapping_add(width.bytes() as u32));
    Ok((selector as u16, target as u16))
}

/// IP after `node` moved by `disp`, wrapping in the segment
#[inline]
fn relative_target(node: &CfgInstruction, h: &ExecutionHelper, disp: i32) -> u16 {
    h.next_ip(node).wrapping_add(disp as u16)
}

/// RET imm16 releases that many bytes of arguments
fn release_stack(
    node: &CfgInstruction,
    h: &mut ExecutionHelper,
    pop: Option<FieldRef>,
) {
    if let Some(field) = pop {
        let sp = h.state.sp().wrapping_add(h.field(node, field) as u16);
        h.state.set_sp(sp);
    }
}

fn port_number(
    node: &CfgInstruction,
    h: &ExecutionHelper,
    port: Option<FieldRef>,
) -> u16 {
    match port {
        Some(field) => h.field(node, field) as u16,
        None => h.state.dx(),
    }
}

// String instructions

fn string_operation(
    h: &mut ExecutionHelper,
    op: StringOp,
    width: Width,
    rep: Option<RepKind>,
    segment: SegReg,
    address_size_32: bool,
) {
    let Some(rep) = rep else {
        string_step(h, op, width, segment, address_size_32);
        return;
    };
    loop {
        let count = index_register(h, REG_CX, address_size_32);
        if count == 0 {
            break;
        }
        string_step(h, op, width, segment, address_size_32);
        advance_register(h, REG_CX, -1, address_size_32);
        if op.checks_zero_flag() && h.state.flags.zero != rep.continue_while_zero() {
            break;
        }
    }
}

fn string_step(
    h: &mut ExecutionHelper,
    op: StringOp,
    width: Width,
    segment: SegReg,
    address_size_32: bool,
) {
    let step = width.bytes() as i32;
    let delta = if h.state.flags.direction { -step } else { step };
    let source_segment = h.state.segment(segment);
    let es = h.state.es();
    let si = index_register(h, REG_SI, address_size_32);
    let di = index_register(h, REG_DI, address_size_32);
    match op {
        StringOp::Movs => {
            let value = h.read(width, source_segment, si);
            h.write(width, es, di, value);
            advance_register(h, REG_SI, delta, address_size_32);
            advance_register(h, REG_DI, delta, address_size_32);
        }
        StringOp::Cmps => {
            let left = h.read(width, source_segment, si);
            let right = h.read(width, es, di);
            h.alu().sub(width, left, right);
            advance_register(h, REG_SI, delta, address_size_32);
            advance_register(h, REG_DI, delta, address_size_32);
        }
        StringOp::Stos => {
            let value = h.state.reg(width, REG_AX);
            h.write(width, es, di, value);
            advance_register(h, REG_DI, delta, address_size_32);
        }
        StringOp::Lods => {
            let value = h.read(width, source_segment, si);
            h.state.set_reg(width, REG_AX, value);
            advance_register(h, REG_SI, delta, address_size_32);
        }
        StringOp::Scas => {
            let acc = h.state.reg(width, REG_AX);
            let value = h.read(width, es, di);
            h.alu().sub(width, acc, value);
            advance_register(h, REG_DI, delta, address_size_32);
        }
        StringOp::Ins => {
            let port = h.state.dx();
            let value = h.port_in(width, port);
            h.write(width, es, di, value);
            advance_register(h, REG_DI, delta, address_size_32);
        }
        StringOp::Outs => {
            let port = h.state.dx();
            let value = h.read(width, source_segment, si);
            h.port_out(width, port, value);
            advance_register(h, REG_SI, delta, address_size_32);
        }
    }
}

/// SI, DI or CX, or their 32-bit forms under a 32-bit address size
#[inline]
fn index_register(h: &ExecutionHelper, reg: u8, address_size_32: bool) -> u32 {
    if address_size_32 {
        h.state.reg32(reg)
    } else {
        h.state.reg16(reg) as u32
    }
}

#[inline]
fn advance_register(h: &mut ExecutionHelper, reg: u8, delta: i32, address_size_32: bool) {
    if address_size_32 {
        let value = h.state.reg32(reg).wrapping_add(delta as u32);
        h.state.set_reg32(reg, value);
    } else {
        let value = h.state.reg16(reg).wrapping_add(delta as u16);
        h.state.set_reg16(reg, value);
    }
}
