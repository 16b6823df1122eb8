//! Compiled blocks must leave exactly the state the interpreter leaves

use super::{cpu_with, cpu_with_config, install_handler, jit_config, run_to_halt, CODE};
use crate::bus::Ram;
use crate::cpu::CfgCpu;

/// Sum 1..=100 into AX and store every partial sum at 0000:0200.
///
/// ```text
/// 0:  MOV CX, 100
/// 3:  XOR AX, AX
/// 5:  MOV DI, 0200
/// 8:  ADD AX, CX
/// 10: MOV [DI], AX
/// 12: ADD DI, 2
/// 15: DEC CX
/// 16: JNZ 8
/// 18: HLT
/// ```
const SUM_LOOP: [u8; 19] = [
    0xB9, 0x64, 0x00, 0x31, 0xC0, 0xBF, 0x00, 0x02, 0x01, 0xC8, 0x89, 0x05, 0x83, 0xC7, 0x02,
    0x49, 0x75, 0xF6, 0xF4,
];

/// Flips the instruction at offset 8 between INC AX and DEC AX right before running it.
///
/// ```text
/// 0:  MOV CX, 3
/// 3:  XOR byte [0008], 08
/// 8:  INC AX
/// 9:  DEC CX
/// 10: JNZ 3
/// 12: HLT
/// ```
const PATCH_AHEAD: [u8; 13] = [
    0xB9, 0x03, 0x00, 0x80, 0x36, 0x08, 0x00, 0x08, 0x40, 0x49, 0x75, 0xF7, 0xF4,
];

fn run_both(program: &[u8], setup: impl Fn(&mut CfgCpu<Ram>)) -> (CfgCpu<Ram>, CfgCpu<Ram>) {
    let mut interpreted = cpu_with(program);
    let mut compiled = cpu_with_config(program, jit_config());
    setup(&mut interpreted);
    setup(&mut compiled);
    run_to_halt(&mut interpreted, 10_000);
    run_to_halt(&mut compiled, 10_000);
    (interpreted, compiled)
}

fn assert_same_machine(interpreted: &CfgCpu<Ram>, compiled: &CfgCpu<Ram>) {
    assert_eq!(
        interpreted.current_registers(),
        compiled.current_registers()
    );
    assert!(
        interpreted.memory.as_slice() == compiled.memory.as_slice(),
        "memory differs between interpreter and JIT"
    );
}

#[test]
fn test_sum_loop_matches_interpreter() {
    let (interpreted, compiled) = run_both(&SUM_LOOP, |cpu| cpu.state.set_ds(0x0000));
    assert_eq!(interpreted.state.ax(), 5050);
    assert_same_machine(&interpreted, &compiled);

    let jit = compiled.stats().jit;
    assert!(jit.compiled >= 1, "loop body was never compiled");
    assert!(jit.runs >= 1);
    assert!(jit.instructions > 0);
    assert_eq!(interpreted.stats().jit.compiled, 0);
}

#[test]
fn test_jit_counts_every_instruction() {
    let (interpreted, compiled) = run_both(&SUM_LOOP, |cpu| cpu.state.set_ds(0x0000));
    // 3 setup + 100 x 5 body + HLT
    assert_eq!(interpreted.state.cycles, 504);
    assert_eq!(compiled.state.cycles, 504);
}

#[test]
fn test_self_modifying_loop_matches_interpreter() {
    let toggle = [
        0x40, 0x80, 0x36, 0x00, 0x00, 0x08, 0x43, 0x83, 0xFB, 0x04, 0x75, 0xF4, 0xF4,
    ];
    let (interpreted, compiled) = run_both(&toggle, |cpu| cpu.state.set_ds(CODE.segment));
    assert_eq!(interpreted.state.bx(), 4);
    assert_same_machine(&interpreted, &compiled);
}

#[test]
fn test_patched_immediate_inside_block_matches_interpreter() {
    let (interpreted, compiled) =
        run_both(&super::tests_cfg::PATCH_IMMEDIATE, |cpu| cpu.state.set_ds(CODE.segment));
    assert_eq!(compiled.state.bx(), 3);
    assert_same_machine(&interpreted, &compiled);
}

#[test]
fn test_write_into_running_block_stops_it() {
    let (interpreted, compiled) = run_both(&PATCH_AHEAD, |cpu| cpu.state.set_ds(CODE.segment));
    // DEC, INC, DEC
    assert_eq!(interpreted.state.ax(), 0xFFFF);
    assert_eq!(interpreted.state.cx(), 0);
    assert_same_machine(&interpreted, &compiled);
}

#[test]
fn test_calls_and_interrupts_match_interpreter() {
    // 0: MOV CX, 4
    // 3: CALL 13
    // 6: INT 21
    // 8: LOOP 3
    // 10: HLT
    // 11: NOP; NOP
    // 13: ADD BX, CX; SHL BX, 1; RET
    let program = [
        0xB9, 0x04, 0x00, 0xE8, 0x07, 0x00, 0xCD, 0x21, 0xE2, 0xF9, 0xF4, 0x90, 0x90, 0x01,
        0xCB, 0xD1, 0xE3, 0xC3,
    ];
    let (interpreted, compiled) = run_both(&program, |cpu| {
        // INC AX; ADD DX, AX; IRET
        install_handler(cpu, 0x21, &[0x40, 0x01, 0xC2, 0xCF]);
    });
    assert_eq!(interpreted.state.ax(), 4);
    assert_eq!(interpreted.state.dx(), 10);
    assert_eq!(interpreted.context_depth(), 0);
    assert_eq!(compiled.context_depth(), 0);
    assert_same_machine(&interpreted, &compiled);
}

#[test]
fn test_fault_inside_block_is_delivered() {
    // 0: MOV CX, 3
    // 3: MOV AX, 10
    // 6: XOR DX, DX
    // 8: MOV BX, CX
    // 10: DEC BX
    // 11: DIV BX        ; BX is zero on the last pass
    // 13: DEC CX
    // 14: JNZ 3
    // 16: HLT
    let program = [
        0xB9, 0x03, 0x00, 0xB8, 0x0A, 0x00, 0x31, 0xD2, 0x89, 0xCB, 0x4B, 0xF7, 0xF3, 0x49,
        0x75, 0xF3, 0xF4,
    ];
    let (interpreted, compiled) = run_both(&program, |cpu| {
        // MOV BX, 1; IRET back into the DIV
        install_handler(cpu, 0, &[0xBB, 0x01, 0x00, 0xCF]);
    });
    assert_eq!(interpreted.state.cx(), 0);
    assert_eq!(interpreted.state.bx(), 1);
    assert_eq!(interpreted.state.ax(), 10);
    assert_eq!(compiled.context_depth(), 0);
    assert_same_machine(&interpreted, &compiled);
}

#[test]
fn test_hardware_interrupt_between_blocks() {
    let mut compiled = cpu_with_config(&SUM_LOOP, jit_config());
    compiled.state.set_ds(0x0000);
    compiled.state.flags.interrupt = true;
    install_handler(&mut compiled, 8, &[0x43, 0xCF]); // INC BX; IRET
    compiled.run(40).expect("partial run");
    compiled.request_hardware_interrupt(8);
    run_to_halt(&mut compiled, 10_000);
    assert_eq!(compiled.state.bx(), 1);
    assert_eq!(compiled.state.ax(), 5050);
    assert_eq!(compiled.context_depth(), 0);
}
