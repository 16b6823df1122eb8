//! End-to-end tests of the CFG CPU
//!
//! Programs are loaded at 0100:0000 (linear 0x1000) with the stack at 0000:8000 and interrupt
//! handlers, when a test needs them, at 0200:0000.
//! - `tests_alu`: arithmetic, logic, shifts and BCD through real instructions
//! - `tests_data`: moves, stack, addressing and segment overrides
//! - `tests_control`: jumps, loops, calls, returns and interrupts
//! - `tests_string`: string instructions with and without REP
//! - `tests_faults`: faults, fatal errors, callbacks and hardware interrupts
//! - `tests_cfg`: node reuse, self-modifying code and execution contexts
//! - `tests_jit`: compiled blocks against the interpreter

mod tests_alu;
mod tests_cfg;
mod tests_control;
mod tests_data;
mod tests_faults;
mod tests_jit;
mod tests_string;

use crate::address::SegmentedAddress;
use crate::bus::{Memory, Ram};
use crate::config::CpuConfig;
use crate::cpu::CfgCpu;

pub(crate) const CODE: SegmentedAddress = SegmentedAddress::new(0x0100, 0x0000);
pub(crate) const HANDLER: SegmentedAddress = SegmentedAddress::new(0x0200, 0x0000);
pub(crate) const STACK_TOP: u16 = 0x8000;

pub(crate) fn cpu_with_config(program: &[u8], config: CpuConfig) -> CfgCpu<Ram> {
    let mut ram = Ram::new();
    ram.load_program(CODE.linear(), program);
    let mut cpu = CfgCpu::new(ram, config);
    cpu.state.set_ss(0x0000);
    cpu.state.set_sp(STACK_TOP);
    cpu.set_entry_point(CODE);
    cpu
}

pub(crate) fn cpu_with(program: &[u8]) -> CfgCpu<Ram> {
    cpu_with_config(program, CpuConfig::default())
}

pub(crate) fn jit_config() -> CpuConfig {
    let mut config = CpuConfig::default();
    config.jit.enabled = true;
    config.jit.min_block_size = 2;
    config
}

/// Point `vector` at `handler` (loaded at 0200:0000)
pub(crate) fn install_handler(cpu: &mut CfgCpu<Ram>, vector: u8, handler: &[u8]) {
    let entry = vector as u32 * 4;
    cpu.memory.write_u16(entry, HANDLER.offset);
    cpu.memory.write_u16(entry + 2, HANDLER.segment);
    cpu.memory.load_program(HANDLER.linear(), handler);
}

/// Run to HLT, failing the test if it takes more than `limit` steps
pub(crate) fn run_to_halt(cpu: &mut CfgCpu<Ram>, limit: u64) {
    let summary = cpu.run(limit).expect("program runs without fatal error");
    assert!(summary.halted, "program did not reach HLT in {} steps", limit);
}
