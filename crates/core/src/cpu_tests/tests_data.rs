//! Data movement, stack and addressing

use super::{cpu_with, run_to_halt, STACK_TOP};
use crate::bus::Memory;

#[test]
fn test_mov_through_memory() {
    // MOV AX, 1234; MOV [0200], AX; MOV BX, [0200]
    let mut cpu = cpu_with(&[
        0xB8, 0x34, 0x12, 0xA3, 0x00, 0x02, 0x8B, 0x1E, 0x00, 0x02, 0xF4,
    ]);
    cpu.state.set_ds(0x0000);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.memory.read_u16(0x0200), 0x1234);
    assert_eq!(cpu.state.bx(), 0x1234);
}

#[test]
fn test_segment_override() {
    // MOV AX, ES:[0000]
    let mut cpu = cpu_with(&[0x26, 0xA1, 0x00, 0x00, 0xF4]);
    cpu.state.set_es(0x0300);
    cpu.memory.write_u16(0x3000, 0xBEEF);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0xBEEF);
}

#[test]
fn test_push_pop_roundtrip() {
    // MOV AX, ABCD; PUSH AX; POP BX
    let mut cpu = cpu_with(&[0xB8, 0xCD, 0xAB, 0x50, 0x5B, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.bx(), 0xABCD);
    assert_eq!(cpu.state.sp(), STACK_TOP);
    assert_eq!(cpu.memory.read_u16(STACK_TOP as u32 - 2), 0xABCD);
}

#[test]
fn test_push_sp_pushes_old_value() {
    // PUSH SP; POP AX
    let mut cpu = cpu_with(&[0x54, 0x58, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), STACK_TOP);
}

#[test]
fn test_xchg_accumulator() {
    // MOV AX, 1; MOV BX, 2; XCHG AX, BX
    let mut cpu = cpu_with(&[0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00, 0x93, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 2);
    assert_eq!(cpu.state.bx(), 1);
}

#[test]
fn test_lea_base_index_displacement() {
    // MOV BX, 0100; MOV SI, 0010; LEA AX, [BX+SI+5]
    let mut cpu = cpu_with(&[0xBB, 0x00, 0x01, 0xBE, 0x10, 0x00, 0x8D, 0x40, 0x05, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x0115);
}

#[test]
fn test_bp_addressing_defaults_to_stack_segment() {
    // MOV BP, 0010; MOV AL, [BP+0]
    let mut cpu = cpu_with(&[0xBD, 0x10, 0x00, 0x8A, 0x46, 0x00, 0xF4]);
    cpu.state.set_ss(0x0400);
    cpu.state.set_ds(0x0500);
    cpu.memory.write_u8(0x4010, 0x5A);
    cpu.memory.write_u8(0x5010, 0xA5);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.al(), 0x5A);
}

#[test]
fn test_movzx_and_movsx() {
    // MOV BL, 80; MOVZX AX, BL; MOVSX CX, BL
    let mut cpu = cpu_with(&[0xB3, 0x80, 0x0F, 0xB6, 0xC3, 0x0F, 0xBE, 0xCB, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x0080);
    assert_eq!(cpu.state.cx(), 0xFF80);
}

#[test]
fn test_mov_segment_register() {
    // MOV AX, 1234; MOV ES, AX; MOV BX, ES
    let mut cpu = cpu_with(&[0xB8, 0x34, 0x12, 0x8E, 0xC0, 0x8C, 0xC3, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.es(), 0x1234);
    assert_eq!(cpu.state.bx(), 0x1234);
}

#[test]
fn test_pushf_popf_roundtrip() {
    // STC; PUSHF; CLC; POPF
    let mut cpu = cpu_with(&[0xF9, 0x9C, 0xF8, 0x9D, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert!(cpu.current_flags().carry);
    assert_eq!(cpu.memory.read_u16(STACK_TOP as u32 - 2) & 0x0003, 0x0003);
}
