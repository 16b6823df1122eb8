//! Graph reuse, self-modifying code and execution contexts

use super::{cpu_with, install_handler, run_to_halt, CODE};
use crate::bus::Memory;
use crate::instruction::Operation;

/// MOV CX, 5; INC AX; LOOP -3; HLT
const COUNT_LOOP: [u8; 7] = [0xB9, 0x05, 0x00, 0x40, 0xE2, 0xFD, 0xF4];

/// Toggles the INC/DEC at offset 0 between runs of it, four times.
///
/// ```text
/// 0:  INC AX              ; flips to DEC AX and back
/// 1:  XOR byte [0000], 08
/// 6:  INC BX
/// 7:  CMP BX, 4
/// 10: JNE 0
/// 12: HLT
/// ```
const TOGGLE: [u8; 13] = [
    0x40, 0x80, 0x36, 0x00, 0x00, 0x08, 0x43, 0x83, 0xFB, 0x04, 0x75, 0xF4, 0xF4,
];

/// Bumps the immediate of its own first instruction on every pass.
///
/// ```text
/// 0:  MOV AX, 0000        ; immediate grows by one each pass
/// 3:  ADD BX, AX
/// 5:  INC byte [0001]
/// 9:  INC CX
/// 10: CMP CX, 3
/// 13: JNE 0
/// 15: HLT
/// ```
pub(crate) const PATCH_IMMEDIATE: [u8; 16] = [
    0xB8, 0x00, 0x00, 0x01, 0xC3, 0xFE, 0x06, 0x01, 0x00, 0x41, 0x83, 0xF9, 0x03, 0x75, 0xF1,
    0xF4,
];

#[test]
fn test_loop_body_is_decoded_once() {
    let mut cpu = cpu_with(&COUNT_LOOP);
    run_to_halt(&mut cpu, 20);
    let stats = cpu.stats();
    assert_eq!(stats.nodes, 4);
    assert_eq!(stats.graph.builds, 4);
    // INC and LOOP were fetched 4 more times each
    assert_eq!(stats.graph.hits, 8);
    assert_eq!(stats.graph.self_modifications, 0);
}

#[test]
fn test_loop_links_back_edge() {
    let mut cpu = cpu_with(&COUNT_LOOP);
    run_to_halt(&mut cpu, 20);
    let graph = cpu.graph();
    let inc = graph
        .current_at(CODE.wrapping_add(3))
        .expect("INC is in the graph");
    let lp = graph
        .current_at(CODE.wrapping_add(4))
        .expect("LOOP is in the graph");
    let lp_node = graph.get(lp).expect("LOOP node");
    assert_eq!(lp_node.branch, Some(inc));
    assert!(lp_node.fallthrough.is_some(), "last iteration fell through to HLT");
    assert!(graph.get(inc).expect("INC node").is_join_point());
}

#[test]
fn test_self_modifying_code_is_redecoded() {
    let mut cpu = cpu_with(&TOGGLE);
    cpu.state.set_ds(CODE.segment);
    run_to_halt(&mut cpu, 50);
    // INC, DEC, INC, DEC
    assert_eq!(cpu.state.ax(), 0);
    assert_eq!(cpu.state.bx(), 4);
    assert_eq!(cpu.memory.read_u8(CODE.linear()), 0x40);

    let stats = cpu.stats().graph;
    assert_eq!(stats.self_modifications, 3);
    // The second INC and the second DEC come back from the version list
    assert_eq!(stats.reuses, 2);
    assert_eq!(stats.builds, 7);
}

#[test]
fn test_patched_immediate_is_read_at_execution() {
    let mut cpu = cpu_with(&PATCH_IMMEDIATE);
    cpu.state.set_ds(CODE.segment);
    run_to_halt(&mut cpu, 50);
    // AX took 0, 1 and 2
    assert_eq!(cpu.state.ax(), 2);
    assert_eq!(cpu.state.bx(), 3);
    assert_eq!(cpu.memory.read_u8(CODE.linear() + 1), 3);

    let stats = cpu.stats().graph;
    assert_eq!(stats.builds, 7, "the MOV node survives its new immediate");
    assert_eq!(stats.self_modifications, 0);
}

#[test]
fn test_invalid_instruction_patched_by_its_handler() {
    // FE /2 does not exist; the INT 6 handler turns it into FE C0 (INC AL) and returns to it
    let mut cpu = cpu_with(&[0xFE, 0xD0, 0xF4]);
    cpu.state.set_ds(CODE.segment);
    // MOV byte [0001], C0; IRET
    install_handler(&mut cpu, 6, &[0xC6, 0x06, 0x01, 0x00, 0xC0, 0xCF]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.al(), 1);
    assert_eq!(cpu.state.cs_ip(), CODE.wrapping_add(3));
    assert_eq!(cpu.context_depth(), 0);

    let id = cpu.graph().current_at(CODE).expect("node at 0");
    let node = cpu.graph().get(id).expect("current node");
    assert!(matches!(node.operation, Operation::IncRm { .. }));
    assert_eq!(cpu.stats().graph.self_modifications, 1);
}

#[test]
fn test_current_node_follows_memory() {
    let mut cpu = cpu_with(&TOGGLE);
    cpu.state.set_ds(CODE.segment);
    cpu.run(3).expect("INC, XOR, INC BX");
    // Memory now holds DEC AX but nothing fetched it yet
    assert_eq!(cpu.memory.read_u8(CODE.linear()), 0x48);
    let id = cpu.graph().current_at(CODE).expect("node at 0");
    let node = cpu.graph().get(id).expect("current node");
    assert!(matches!(node.operation, Operation::IncReg { .. }));

    cpu.run(3).expect("CMP, JNE, DEC");
    let id = cpu.graph().current_at(CODE).expect("node at 0");
    let node = cpu.graph().get(id).expect("current node");
    assert!(matches!(node.operation, Operation::DecReg { .. }));
    assert!(node.matches_memory(&cpu.memory));
}

#[test]
fn test_external_write_needs_invalidate_or_fetch() {
    let mut cpu = cpu_with(&[0x40, 0xF4]);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 1);

    cpu.memory.load_program(CODE.linear(), &[0x48, 0xF4]);
    assert_eq!(cpu.invalidate(CODE.linear()..CODE.linear() + 2), 2);
    assert_eq!(cpu.stats().nodes, 0);

    cpu.set_entry_point(CODE);
    run_to_halt(&mut cpu, 10);
    assert_eq!(cpu.state.ax(), 0);
}

#[test]
fn test_flush_drops_every_node() {
    let mut cpu = cpu_with(&COUNT_LOOP);
    run_to_halt(&mut cpu, 20);
    cpu.flush_cfg();
    assert_eq!(cpu.stats().nodes, 0);

    cpu.state.set_cx(2);
    cpu.set_entry_point(CODE.wrapping_add(3));
    run_to_halt(&mut cpu, 20);
    assert_eq!(cpu.state.ax(), 7);
}

#[test]
fn test_reset_restores_power_on_state() {
    let mut cpu = cpu_with(&COUNT_LOOP);
    run_to_halt(&mut cpu, 20);
    cpu.reset();
    let regs = cpu.current_registers();
    assert_eq!(regs.cs, 0xFFFF);
    assert_eq!(regs.ip, 0);
    assert_eq!(regs.flags, 0x0002);
    assert_eq!(regs.cycles, 0);
    assert_eq!(cpu.context_depth(), 0);
    assert_eq!(cpu.stats().nodes, 0);
    assert!(!cpu.is_halted());
}

#[test]
fn test_context_tracks_entry_and_depth() {
    // 0: CALL 4; 3: HLT; 4: INC AX; 5: RET
    let mut cpu = cpu_with(&[0xE8, 0x01, 0x00, 0xF4, 0x40, 0xC3]);
    cpu.run(1).expect("CALL");
    let context = cpu.current_context();
    assert_eq!(context.depth, 1);
    assert_eq!(context.entry_point, CODE.wrapping_add(4));
    assert!(!context.has_last_executed);

    cpu.run(1).expect("INC");
    assert!(cpu.current_context().has_last_executed);

    run_to_halt(&mut cpu, 10);
    let root = cpu.current_context();
    assert_eq!(root.depth, 0);
    assert_eq!(root.entry_point, CODE);
}

#[test]
fn test_stats_serialize_to_json() {
    let mut cpu = cpu_with(&COUNT_LOOP);
    run_to_halt(&mut cpu, 20);
    let json = serde_json::to_value(cpu.stats()).expect("stats serialize");
    assert_eq!(json["nodes"], 4);
    assert_eq!(json["graph"]["builds"], 4);
    assert_eq!(json["jit"]["compiled"], 0);
}
