//! Faults, fatal errors, host callbacks and hardware interrupts

use super::{cpu_with, cpu_with_config, install_handler, run_to_halt, CODE, HANDLER, STACK_TOP};
use crate::bus::{CallbackRegistry, Memory};
use crate::config::CpuConfig;
use crate::error::{CpuError, Fault};
use crate::SegmentedAddress;

#[test]
fn test_divide_by_zero_raises_int0_at_faulting_instruction() {
    // XOR CX, CX; DIV CX
    let mut cpu = cpu_with(&[0x31, 0xC9, 0xF7, 0xF1, 0xF4]);
    install_handler(&mut cpu, 0, &[0xBB, 0x77, 0x00, 0xF4]); // MOV BX, 77; HLT
    cpu.run(2).expect("fault is delivered to the guest");
    assert_eq!(cpu.state.cs_ip(), HANDLER);
    assert_eq!(cpu.context_depth(), 1);
    assert!(!cpu.current_context().has_last_executed);
    // The return address is the DIV itself
    assert_eq!(cpu.memory.read_u16(STACK_TOP as u32 - 6), 0x0002);

    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.bx(), 0x0077);
    assert_eq!(cpu.state.ax(), 0, "DIV left its operands alone");
}

#[test]
fn test_quotient_overflow_is_division_error() {
    // MOV DX, 1; MOV AX, 0; MOV CX, 1; DIV CX
    let mut cpu = cpu_with(&[
        0xBA, 0x01, 0x00, 0xB8, 0x00, 0x00, 0xB9, 0x01, 0x00, 0xF7, 0xF1, 0xF4,
    ]);
    install_handler(&mut cpu, 0, &[0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.cs_ip(), HANDLER.wrapping_add(1));
}

#[test]
fn test_invalid_opcode_raises_int6() {
    let mut cpu = cpu_with(&[0xF1]);
    install_handler(&mut cpu, 6, &[0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.cs(), HANDLER.segment);
    assert_eq!(cpu.memory.read_u16(STACK_TOP as u32 - 6), CODE.offset);
}

#[test]
fn test_invalid_opcode_in_strict_mode_stops() {
    let config = CpuConfig {
        fail_on_invalid_opcode: true,
        ..CpuConfig::default()
    };
    let mut cpu = cpu_with_config(&[0x40, 0xF1], config);
    let err = cpu.run(10).unwrap_err();
    assert_eq!(
        err,
        CpuError::UnhandledFault {
            fault: Fault::InvalidOpcode { opcode: 0xF1 },
            address: CODE.wrapping_add(1),
        }
    );
    assert!(err.is_fatal());
    assert_eq!(cpu.state.ax(), 1);
}

#[test]
fn test_186_opcode_invalid_on_8086() {
    let config = CpuConfig {
        model: crate::CpuModel::Intel8086,
        ..CpuConfig::default()
    };
    // PUSHA only exists from the 80186 on
    let mut cpu = cpu_with_config(&[0x60, 0xF4], config);
    install_handler(&mut cpu, 6, &[0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.cs(), HANDLER.segment);
}

#[test]
fn test_uninitialized_vector_is_fatal() {
    let mut cpu = cpu_with(&[0xCD, 0x21, 0xF4]);
    let err = cpu.run(10).unwrap_err();
    assert!(matches!(
        err,
        CpuError::UninitializedInterruptVector { vector: 0x21, .. }
    ));
}

#[test]
fn test_unmatched_return_is_fatal() {
    let mut cpu = cpu_with(&[0xC3]);
    cpu.memory.write_u16(STACK_TOP as u32, 0x1234);
    let err = cpu.run(10).unwrap_err();
    assert_eq!(
        err,
        CpuError::ContextStackUnderflow {
            address: CODE,
            depth: 0,
        }
    );
}

#[test]
fn test_callback_runs_host_code() {
    let mut callbacks = CallbackRegistry::new();
    callbacks.register(0x21, |state, memory| {
        state.set_ax(0x1234);
        memory.write_u8(0x0500, 0xAB);
        Ok(())
    });
    // FE 38 21 00 = callback 21; HLT
    let mut cpu = cpu_with(&[0xFE, 0x38, 0x21, 0x00, 0xF4]).with_callbacks(callbacks);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0x1234);
    assert_eq!(cpu.memory.read_u8(0x0500), 0xAB);
    assert_eq!(cpu.state.ip, 5);
}

#[test]
fn test_callback_that_moves_cs_ip() {
    let mut callbacks = CallbackRegistry::new();
    callbacks.register(1, |state, _memory| {
        state.set_cs_ip(SegmentedAddress::new(0x0200, 0x0010));
        Ok(())
    });
    let mut cpu = cpu_with(&[0xFE, 0x38, 0x01, 0x00, 0xF4]).with_callbacks(callbacks);
    // Lands right after the callback instruction in the new segment
    cpu.memory.load_program(0x2014, &[0x40, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 1);
    assert_eq!(cpu.state.cs_ip(), SegmentedAddress::new(0x0200, 0x0016));
}

#[test]
fn test_unknown_callback_is_fatal() {
    let mut cpu = cpu_with(&[0xFE, 0x38, 0x07, 0x00]);
    let err = cpu.run(10).unwrap_err();
    assert!(matches!(err, CpuError::UnknownCallback { number: 7, .. }));
}

#[test]
fn test_hardware_interrupt_wakes_hlt() {
    // STI; HLT; INC AX; HLT
    let mut cpu = cpu_with(&[0xFB, 0xF4, 0x40, 0xF4]);
    install_handler(&mut cpu, 8, &[0xBB, 0x01, 0x00, 0xCF]); // MOV BX, 1; IRET
    run_to_halt(&mut cpu, 10);
    assert!(cpu.is_halted());
    assert_eq!(cpu.state.ip, 2);

    cpu.request_hardware_interrupt(8);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.bx(), 1);
    assert_eq!(cpu.state.ax(), 1);
    assert_eq!(cpu.context_depth(), 0);
}

#[test]
fn test_hardware_interrupt_waits_for_if() {
    let mut cpu = cpu_with(&[0xF4]);
    install_handler(&mut cpu, 8, &[0xCF]);
    run_to_halt(&mut cpu, 10);
    let cycles = cpu.state.cycles;

    cpu.request_hardware_interrupt(8);
    let summary = cpu.run(10).expect("halted CPU idles");
    assert!(summary.halted);
    assert_eq!(summary.instructions, 0);
    assert_eq!(cpu.state.cycles, cycles);
    assert_eq!(cpu.context_depth(), 0);
}

/// Run `setup` instructions, raise IRQ 8, and report the BX the handler saw in CX
fn bx_seen_by_irq(program: &[u8], setup: u64) -> u16 {
    let mut cpu = cpu_with(program);
    cpu.state.flags.interrupt = true;
    install_handler(&mut cpu, 8, &[0x89, 0xD9, 0xCF]); // MOV CX, BX; IRET
    cpu.run(setup).expect("setup instructions");
    cpu.request_hardware_interrupt(8);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.bx(), 1);
    cpu.state.cx()
}

#[test]
fn test_loading_ss_holds_interrupts_for_one_instruction() {
    // MOV SS, AX; INC BX; HLT
    assert_eq!(bx_seen_by_irq(&[0x8E, 0xD0, 0x43, 0xF4], 1), 1);
    // PUSH SS; POP SS; INC BX; HLT
    assert_eq!(bx_seen_by_irq(&[0x16, 0x17, 0x43, 0xF4], 2), 1);
    // MOV DS, AX does not
    assert_eq!(bx_seen_by_irq(&[0x8E, 0xD8, 0x43, 0xF4], 1), 0);
}
