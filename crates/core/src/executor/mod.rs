//! Instruction execution: the helper façade and the per-operation semantics.

pub mod execute;
pub mod helper;

pub use execute::execute;
pub use helper::{physical_address, ContextAction, ExecutionHelper};
