//! Real-mode x86 CPU core built around a control-flow graph of decoded instructions.
//!
//! Instructions are decoded once into graph nodes keyed by their address and bytes, linked to the
//! nodes that ran after them, and re-decoded only when the bytes underneath change. Calls and
//! interrupts open execution contexts so that returns can be matched with their callers. Hot
//! straight-line chains of the graph can optionally be run as compiled blocks.
//!
//! ```no_run
//! use x86_cfgcpu::{CfgCpu, CpuConfig, Ram, SegmentedAddress};
//!
//! let mut ram = Ram::new();
//! ram.load_program(0x1000, &[0x40, 0x40, 0x40, 0xF4]); // INC AX x3, HLT
//! let mut cpu = CfgCpu::new(ram, CpuConfig::default());
//! cpu.set_entry_point(SegmentedAddress::new(0x0100, 0x0000));
//! cpu.run(100).unwrap();
//! assert_eq!(cpu.current_registers().eax, 3);
//! ```

pub mod address;
pub mod alu;
pub mod bus;
pub mod cfg;
pub mod config;
pub mod cpu;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod flags;
pub mod instruction;
pub mod jit;
pub mod logging;
pub mod state;

#[cfg(test)]
mod cpu_tests;

pub use address::SegmentedAddress;
pub use bus::{CallbackHandler, CallbackRegistry, IoPortDispatcher, Memory, NullIoPorts, Ram};
pub use config::{CpuConfig, JitConfig};
pub use cpu::{CfgCpu, CfgStats, RunSummary};
pub use error::{ConfigError, CpuError, Fault};
pub use flags::Flags;
pub use state::{CpuModel, CpuState, RegisterSnapshot};
