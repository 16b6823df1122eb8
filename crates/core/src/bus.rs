//! Collaborators the CPU talks to: memory, I/O ports and host callbacks.
//!
//! The core only needs the narrow traits defined here. [`Ram`], [`NullIoPorts`] and
//! [`CallbackRegistry`] are simple implementations used by tests, benches and the CLI runner.

use crate::error::CpuError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::state::CpuState;
use std::collections::HashMap;
use std::fmt;

/// Highest linear address reachable in real mode (`FFFF:FFFF`)
pub const MAX_LINEAR_ADDRESS: u32 = 0x10FFEF;

/// Byte-addressable memory seen through linear addresses.
pub trait Memory {
    /// Read a byte from memory at the given linear address
    fn read_u8(&self, addr: u32) -> u8;

    /// Write a byte to memory at the given linear address
    fn write_u8(&mut self, addr: u32, val: u8);

    /// Read without triggering watches or breakpoints
    fn sneak_read_u8(&self, addr: u32) -> u8 {
        self.read_u8(addr)
    }

    /// Read a 16-bit word from memory (little-endian)
    fn read_u16(&self, addr: u32) -> u16 {
        let low = self.read_u8(addr);
        let high = self.read_u8(addr.wrapping_add(1));
        (high as u16) << 8 | low as u16
    }

    /// Write a 16-bit word to memory (little-endian)
    fn write_u16(&mut self, addr: u32, val: u16) {
        self.write_u8(addr, (val & 0xFF) as u8);
        self.write_u8(addr.wrapping_add(1), (val >> 8) as u8);
    }

    fn read_u32(&self, addr: u32) -> u32 {
        let low = self.read_u16(addr) as u32;
        let high = self.read_u16(addr.wrapping_add(2)) as u32;
        high << 16 | low
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_u16(addr, val as u16);
        self.write_u16(addr.wrapping_add(2), (val >> 16) as u16);
    }

    /// True when memory at `addr` holds exactly `bytes` (checked with sneak reads)
    fn slice_matches(&self, addr: u32, bytes: &[u8]) -> bool {
        bytes
            .iter()
            .enumerate()
            .all(|(i, &b)| self.sneak_read_u8(addr.wrapping_add(i as u32)) == b)
    }
}

/// Address line 20 gate.
///
/// While disabled, linear addresses wrap at 1 MiB the way they do on an 8086.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct A20Gate {
    enabled: bool,
}

impl A20Gate {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline]
    pub fn transform(&self, addr: u32) -> u32 {
        if self.enabled {
            addr
        } else {
            addr & 0xFFFFF
        }
    }
}

/// 1 MiB of conventional memory plus the 64 KiB high memory area
pub struct Ram {
    data: Vec<u8>,
    pub a20: A20Gate,
}

impl Ram {
    pub const SIZE: usize = 0x110000;

    pub fn new() -> Self {
        Self {
            data: vec![0; Self::SIZE],
            a20: A20Gate::default(),
        }
    }

    /// Load a program at a specific physical address
    pub fn load_program(&mut self, addr: u32, program: &[u8]) {
        let start = addr as usize;
        let end = start + program.len();
        if end <= self.data.len() {
            self.data[start..end].copy_from_slice(program);
        }
    }

    /// Raw view of the backing store, for dumps and comparisons
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Default for Ram {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ram")
            .field("size", &self.data.len())
            .field("a20", &self.a20)
            .finish()
    }
}

impl Memory for Ram {
    fn read_u8(&self, addr: u32) -> u8 {
        self.data
            .get(self.a20.transform(addr) as usize)
            .copied()
            .unwrap_or(0xFF)
    }

    fn write_u8(&mut self, addr: u32, val: u8) {
        let addr = self.a20.transform(addr) as usize;
        if let Some(slot) = self.data.get_mut(addr) {
            *slot = val;
        }
    }
}

/// Routes IN/OUT to devices
pub trait IoPortDispatcher {
    fn read_byte(&mut self, port: u16) -> u8;

    fn write_byte(&mut self, port: u16, val: u8);

    fn read_word(&mut self, port: u16) -> u16 {
        let low = self.read_byte(port);
        let high = self.read_byte(port.wrapping_add(1));
        (high as u16) << 8 | low as u16
    }

    fn write_word(&mut self, port: u16, val: u16) {
        self.write_byte(port, val as u8);
        self.write_byte(port.wrapping_add(1), (val >> 8) as u8);
    }

    fn read_dword(&mut self, port: u16) -> u32 {
        let low = self.read_word(port) as u32;
        let high = self.read_word(port.wrapping_add(2)) as u32;
        high << 16 | low
    }

    fn write_dword(&mut self, port: u16, val: u32) {
        self.write_word(port, val as u16);
        self.write_word(port.wrapping_add(2), (val >> 16) as u16);
    }
}

/// No devices attached: reads float high, writes vanish
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIoPorts;

impl IoPortDispatcher for NullIoPorts {
    fn read_byte(&mut self, port: u16) -> u8 {
        log(LogCategory::Io, LogLevel::Trace, || {
            format!("IN {:04X} -> FF (no device)", port)
        });
        0xFF
    }

    fn write_byte(&mut self, port: u16, val: u8) {
        log(LogCategory::Io, LogLevel::Trace, || {
            format!("OUT {:04X} <- {:02X} (no device)", port, val)
        });
    }
}

/// Host code reachable from the guest through the `FE 38 lo hi` callback instruction
pub trait CallbackHandler {
    fn run(
        &mut self,
        number: u16,
        state: &mut CpuState,
        memory: &mut dyn Memory,
    ) -> Result<(), CpuError>;
}

pub type CallbackFn = Box<dyn FnMut(&mut CpuState, &mut dyn Memory) -> Result<(), CpuError>>;

/// Callback numbers mapped to closures
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<u16, CallbackFn>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `number`, replacing any previous one
    pub fn register<F>(&mut self, number: u16, callback: F)
    where
        F: FnMut(&mut CpuState, &mut dyn Memory) -> Result<(), CpuError> + 'static,
    {
        self.callbacks.insert(number, Box::new(callback));
    }

    pub fn is_registered(&self, number: u16) -> bool {
        self.callbacks.contains_key(&number)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut numbers: Vec<_> = self.callbacks.keys().copied().collect();
        numbers.sort_unstable();
        f.debug_struct("CallbackRegistry")
            .field("numbers", &numbers)
            .finish()
    }
}

impl CallbackHandler for CallbackRegistry {
    fn run(
        &mut self,
        number: u16,
        state: &mut CpuState,
        memory: &mut dyn Memory,
    ) -> Result<(), CpuError> {
        match self.callbacks.get_mut(&number) {
            Some(callback) => callback(state, memory),
            None => Err(CpuError::UnknownCallback {
                number,
                address: state.cs_ip(),
            }),
        }
    }
}
