//! Arithmetic, logic, shift and BCD instructions

use super::{cpu_with, cpu_with_config, run_to_halt};
use crate::config::CpuConfig;
use crate::state::CpuModel;

#[test]
fn test_inc_sequence_leaves_carry_alone() {
    let mut cpu = cpu_with(&[0x40, 0x40, 0x40, 0xF4]); // INC AX x3, HLT
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.current_registers().eax, 3);
    assert!(!cpu.current_flags().carry);

    let mut cpu = cpu_with(&[0xF9, 0x40, 0x40, 0x40, 0xF4]); // STC first
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.current_registers().eax, 3);
    assert!(cpu.current_flags().carry, "INC must not touch CF");
}

#[test]
fn test_add_signed_overflow() {
    // MOV AL, 7F; ADD AL, 1
    let mut cpu = cpu_with(&[0xB0, 0x7F, 0x04, 0x01, 0xF4]);
    run_to_halt(&mut cpu, 10);
    let flags = cpu.current_flags();
    assert_eq!(cpu.state.al(), 0x80);
    assert!(flags.overflow);
    assert!(flags.sign);
    assert!(flags.auxiliary);
    assert!(!flags.carry);
    assert!(!flags.zero);
    assert!(!flags.parity);
}

#[test]
fn test_cmp_borrow_keeps_operand() {
    // MOV AX, 5; CMP AX, 6
    let mut cpu = cpu_with(&[0xB8, 0x05, 0x00, 0x3D, 0x06, 0x00, 0xF4]);
    run_to_halt(&mut cpu, 10);
    let flags = cpu.current_flags();
    assert_eq!(cpu.state.ax(), 5);
    assert!(flags.carry);
    assert!(flags.sign);
    assert!(!flags.zero);
    assert!(!flags.overflow);
}

#[test]
fn test_adc_propagates_carry_between_words() {
    // MOV AX, FFFF; MOV DX, 0; ADD AX, 1; ADC DX, 0
    let mut cpu = cpu_with(&[
        0xB8, 0xFF, 0xFF, 0xBA, 0x00, 0x00, 0x05, 0x01, 0x00, 0x83, 0xD2, 0x00, 0xF4,
    ]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0);
    assert_eq!(cpu.state.dx(), 1);
    assert!(!cpu.current_flags().carry);
}

#[test]
fn test_xor_self_clears_carry_and_overflow() {
    // STC; MOV AX, 00FF; XOR AX, AX
    let mut cpu = cpu_with(&[0xF9, 0xB8, 0xFF, 0x00, 0x31, 0xC0, 0xF4]);
    run_to_halt(&mut cpu, 10);
    let flags = cpu.current_flags();
    assert_eq!(cpu.state.ax(), 0);
    assert!(flags.zero);
    assert!(flags.parity);
    assert!(!flags.carry);
    assert!(!flags.overflow);
}

#[test]
fn test_neg_sets_carry_for_nonzero() {
    // MOV AL, 1; NEG AL
    let mut cpu = cpu_with(&[0xB0, 0x01, 0xF6, 0xD8, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.al(), 0xFF);
    assert!(cpu.current_flags().carry);
    assert!(cpu.current_flags().sign);
}

#[test]
fn test_mul_word_spills_into_dx() {
    // MOV AX, 1000; MOV BX, 10; MUL BX
    let mut cpu = cpu_with(&[0xB8, 0x00, 0x10, 0xBB, 0x10, 0x00, 0xF7, 0xE3, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x0000);
    assert_eq!(cpu.state.dx(), 0x0001);
    assert!(cpu.current_flags().carry);
    assert!(cpu.current_flags().overflow);
}

#[test]
fn test_div_word() {
    // MOV DX, 0; MOV AX, 100; MOV CX, 7; DIV CX
    let mut cpu = cpu_with(&[
        0xBA, 0x00, 0x00, 0xB8, 0x64, 0x00, 0xB9, 0x07, 0x00, 0xF7, 0xF1, 0xF4,
    ]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 14);
    assert_eq!(cpu.state.dx(), 2);
}

#[test]
fn test_idiv_rounds_toward_zero() {
    // MOV AX, -7; CWD; MOV CX, 2; IDIV CX
    let mut cpu = cpu_with(&[0xB8, 0xF9, 0xFF, 0x99, 0xB9, 0x02, 0x00, 0xF7, 0xF9, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0xFFFD); // -3
    assert_eq!(cpu.state.dx(), 0xFFFF); // -1
}

#[test]
fn test_imul_three_operand() {
    // MOV BX, 3; IMUL AX, BX, -5
    let mut cpu = cpu_with(&[0xBB, 0x03, 0x00, 0x6B, 0xC3, 0xFB, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0xFFF1);
    assert!(!cpu.current_flags().carry);
    assert!(!cpu.current_flags().overflow);
}

#[test]
fn test_shl_by_one_sets_carry_and_overflow() {
    // MOV AL, 81; SHL AL, 1
    let mut cpu = cpu_with(&[0xB0, 0x81, 0xD0, 0xE0, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.al(), 0x02);
    assert!(cpu.current_flags().carry);
    assert!(cpu.current_flags().overflow);
}

#[test]
fn test_sar_keeps_sign() {
    // MOV AL, F0; SAR AL, 1
    let mut cpu = cpu_with(&[0xB0, 0xF0, 0xD0, 0xF8, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.al(), 0xF8);
    assert!(!cpu.current_flags().carry);
}

#[test]
fn test_rol_by_cl() {
    // MOV AX, 8001; MOV CL, 4; ROL AX, CL
    let mut cpu = cpu_with(&[0xB8, 0x01, 0x80, 0xB1, 0x04, 0xD3, 0xC0, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x0018);
    assert!(!cpu.current_flags().carry);
}

#[test]
fn test_shift_count_masking_depends_on_model() {
    // MOV AX, 1; MOV CL, 21; SHL AX, CL
    let program = [0xB8, 0x01, 0x00, 0xB1, 0x21, 0xD3, 0xE0, 0xF4];
    let mut cpu = cpu_with(&program);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x0002, "the 386 shifts by 21 & 1F");

    let config = CpuConfig {
        model: CpuModel::Intel8086,
        ..CpuConfig::default()
    };
    let mut cpu = cpu_with_config(&program, config);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x0000, "the 8086 shifts 33 times");
    assert!(!cpu.current_flags().carry);
    assert!(cpu.current_flags().zero);
}

#[test]
fn test_daa_after_add() {
    // MOV AL, 09; ADD AL, 08; DAA
    let mut cpu = cpu_with(&[0xB0, 0x09, 0x04, 0x08, 0x27, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.al(), 0x17);
    assert!(!cpu.current_flags().carry);
}

#[test]
fn test_aam_splits_digits() {
    // MOV AL, 47; AAM
    let mut cpu = cpu_with(&[0xB0, 0x2F, 0xD4, 0x0A, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x0407);
}

#[test]
fn test_32bit_inc_wraps_to_zero() {
    // MOV EAX, FFFFFFFF; INC EAX
    let mut cpu = cpu_with(&[0x66, 0xB8, 0xFF, 0xFF, 0xFF, 0xFF, 0x66, 0x40, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.eax(), 0);
    assert!(cpu.current_flags().zero);
    assert!(cpu.current_flags().auxiliary);
    assert!(!cpu.current_flags().carry);
}
