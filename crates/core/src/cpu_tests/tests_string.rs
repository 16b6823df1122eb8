//! String instructions

use super::{cpu_with, run_to_halt};
use crate::bus::Memory;

fn with_buffers(program: &[u8], source: &[u8], destination: &[u8]) -> crate::CfgCpu<crate::Ram> {
    let mut cpu = cpu_with(program);
    cpu.state.set_ds(0x0000);
    cpu.state.set_es(0x0000);
    cpu.state.set_si(0x0200);
    cpu.state.set_di(0x0300);
    cpu.memory.load_program(0x0200, source);
    cpu.memory.load_program(0x0300, destination);
    cpu
}

#[test]
fn test_rep_movsb_copies_forward() {
    let mut cpu = with_buffers(&[0xF3, 0xA4, 0xF4], b"ABCD", &[0; 4]);
    cpu.state.set_cx(4);
    run_to_halt(&mut cpu, 10);
    assert_eq!(&cpu.memory.as_slice()[0x300..0x304], b"ABCD");
    assert_eq!(cpu.state.cx(), 0);
    assert_eq!(cpu.state.si(), 0x0204);
    assert_eq!(cpu.state.di(), 0x0304);
}

#[test]
fn test_rep_with_zero_count_does_nothing() {
    let mut cpu = with_buffers(&[0xF3, 0xA4, 0xF4], b"ABCD", &[0; 4]);
    cpu.state.set_cx(0);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.memory.read_u8(0x300), 0);
    assert_eq!(cpu.state.si(), 0x0200);
}

#[test]
fn test_repe_cmpsb_stops_at_mismatch() {
    let mut cpu = with_buffers(&[0xF3, 0xA6, 0xF4], b"ABXD", b"ABYD");
    cpu.state.set_cx(8);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.cx(), 5);
    assert_eq!(cpu.state.si(), 0x0203);
    assert_eq!(cpu.state.di(), 0x0303);
    assert!(!cpu.current_flags().zero);
    assert!(cpu.current_flags().carry, "'X' < 'Y'");
}

#[test]
fn test_repne_scasb_finds_byte() {
    // MOV AL, 'C'; REPNE SCASB
    let mut cpu = with_buffers(&[0xB0, b'C', 0xF2, 0xAE, 0xF4], b"", b"ABCD");
    cpu.state.set_cx(10);
    run_to_halt(&mut cpu, 10);
    assert!(cpu.current_flags().zero);
    assert_eq!(cpu.state.di(), 0x0303);
    assert_eq!(cpu.state.cx(), 7);
}

#[test]
fn test_std_stosw_runs_backward() {
    // STD; MOV AX, 2211; MOV CX, 2; REP STOSW
    let mut cpu = with_buffers(
        &[0xFD, 0xB8, 0x11, 0x22, 0xB9, 0x02, 0x00, 0xF3, 0xAB, 0xF4],
        b"",
        &[0; 8],
    );
    cpu.state.set_di(0x0304);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.memory.read_u16(0x0304), 0x2211);
    assert_eq!(cpu.memory.read_u16(0x0302), 0x2211);
    assert_eq!(cpu.memory.read_u16(0x0300), 0);
    assert_eq!(cpu.state.di(), 0x0300);
}

#[test]
fn test_lodsb_with_segment_override() {
    // ES: LODSB
    let mut cpu = with_buffers(&[0x26, 0xAC, 0xF4], b"", &[]);
    cpu.state.set_es(0x0400);
    cpu.memory.write_u8(0x4200, 0x99);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.al(), 0x99);
    assert_eq!(cpu.state.si(), 0x0201);
}
