//! Jumps, loops, calls, returns and software interrupts

use super::{cpu_with, install_handler, run_to_halt, CODE, HANDLER, STACK_TOP};
use crate::bus::Memory;

#[test]
fn test_short_jump_skips_bytes() {
    // JMP +2; INC AX; INC AX; INC AX
    let mut cpu = cpu_with(&[0xEB, 0x02, 0x40, 0x40, 0x40, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 1);
}

#[test]
fn test_conditional_jump_not_taken() {
    // XOR AX, AX; JNZ +1; INC AX
    let mut cpu = cpu_with(&[0x31, 0xC0, 0x75, 0x01, 0x40, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 1);
}

#[test]
fn test_loop_counts_down() {
    // MOV CX, 5; INC AX; LOOP -3
    let mut cpu = cpu_with(&[0xB9, 0x05, 0x00, 0x40, 0xE2, 0xFD, 0xF4]);
    run_to_halt(&mut cpu, 20);
    assert_eq!(cpu.state.ax(), 5);
    assert_eq!(cpu.state.cx(), 0);
    // MOV + 5 x (INC, LOOP) + HLT
    assert_eq!(cpu.state.cycles, 12);
}

#[test]
fn test_jcxz_with_zero_count() {
    // XOR CX, CX; JCXZ +1; INC AX
    let mut cpu = cpu_with(&[0x31, 0xC9, 0xE3, 0x01, 0x40, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0);
}

#[test]
fn test_near_call_opens_and_closes_context() {
    // 0: CALL 4; 3: HLT; 4: INC AX; 5: RET
    let mut cpu = cpu_with(&[0xE8, 0x01, 0x00, 0xF4, 0x40, 0xC3]);
    cpu.run(2).expect("call and inc");
    assert_eq!(cpu.context_depth(), 1);
    assert_eq!(cpu.state.sp(), STACK_TOP - 2);
    assert_eq!(cpu.memory.read_u16(STACK_TOP as u32 - 2), 0x0003);

    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 1);
    assert_eq!(cpu.state.sp(), STACK_TOP);
    assert_eq!(cpu.context_depth(), 0);
}

#[test]
fn test_nested_calls_balance() {
    // 0: CALL 4; 3: HLT; 4: CALL 8; 7: RET; 8: INC AX; 9: RET
    let mut cpu = cpu_with(&[0xE8, 0x01, 0x00, 0xF4, 0xE8, 0x01, 0x00, 0xC3, 0x40, 0xC3]);
    cpu.run(3).expect("two calls and inc");
    assert_eq!(cpu.context_depth(), 2);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 1);
    assert_eq!(cpu.context_depth(), 0);
    assert_eq!(cpu.state.ip, 4);
}

#[test]
fn test_ret_with_immediate_releases_arguments() {
    // 0: PUSH AX; 1: CALL 5; 4: HLT; 5: RET 2
    let mut cpu = cpu_with(&[0x50, 0xE8, 0x01, 0x00, 0xF4, 0xC2, 0x02, 0x00]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.sp(), STACK_TOP);
    assert_eq!(cpu.context_depth(), 0);
}

#[test]
fn test_far_call_and_return() {
    // CALL 0200:0000; HLT
    let mut cpu = cpu_with(&[0x9A, 0x00, 0x00, 0x00, 0x02, 0xF4]);
    cpu.memory.load_program(HANDLER.linear(), &[0x40, 0xCB]); // INC AX; RETF
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 1);
    assert_eq!(cpu.state.cs(), CODE.segment);
    assert_eq!(cpu.state.ip, 6);
    assert_eq!(cpu.context_depth(), 0);
}

#[test]
fn test_indirect_near_jump() {
    // MOV BX, 0007; JMP BX; INC AX; HLT
    let mut cpu = cpu_with(&[0xBB, 0x07, 0x00, 0xFF, 0xE3, 0x40, 0xF4, 0x43, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0);
    assert_eq!(cpu.state.bx(), 0x0008);
}

#[test]
fn test_software_interrupt_roundtrip() {
    // STI; INT 21; HLT
    let mut cpu = cpu_with(&[0xFB, 0xCD, 0x21, 0xF4]);
    install_handler(&mut cpu, 0x21, &[0xB4, 0x4C, 0xCF]); // MOV AH, 4C; IRET
    cpu.run(2).expect("STI and INT");
    assert_eq!(cpu.state.cs_ip(), HANDLER);
    assert!(!cpu.current_flags().interrupt, "INT clears IF");
    assert_eq!(cpu.context_depth(), 1);
    // IP, CS, FLAGS
    assert_eq!(cpu.memory.read_u16(STACK_TOP as u32 - 6), 0x0003);
    assert_eq!(cpu.memory.read_u16(STACK_TOP as u32 - 4), CODE.segment);

    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ah(), 0x4C);
    assert!(cpu.current_flags().interrupt, "IRET restores IF");
    assert_eq!(cpu.context_depth(), 0);
    assert_eq!(cpu.state.sp(), STACK_TOP);
}
