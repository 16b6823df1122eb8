//! Execution contexts: one per CALL/interrupt nesting level.

use super::arena::NodeId;
use crate::address::SegmentedAddress;
use crate::error::CpuError;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub entry_point: SegmentedAddress,
    pub depth: u32,
    /// Node executed last at this level; the next fetched node is linked after it
    pub last_executed: Option<NodeId>,
    /// Expected next node, cleared by jumps and context switches
    pub node_to_execute_next: Option<NodeId>,
}

impl ExecutionContext {
    fn new(entry_point: SegmentedAddress, depth: u32, last_executed: Option<NodeId>) -> Self {
        Self {
            entry_point,
            depth,
            last_executed,
            node_to_execute_next: None,
        }
    }
}

/// Read-only view for tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextInfo {
    pub entry_point: SegmentedAddress,
    pub depth: u32,
    pub has_last_executed: bool,
    pub has_node_to_execute_next: bool,
}

/// Stack of contexts; the root context is never popped
#[derive(Debug, Clone)]
pub struct ExecutionContextManager {
    stack: Vec<ExecutionContext>,
}

impl ExecutionContextManager {
    pub fn new(entry_point: SegmentedAddress) -> Self {
        Self {
            stack: vec![ExecutionContext::new(entry_point, 0, None)],
        }
    }

    pub fn current(&self) -> &ExecutionContext {
        // The root is never removed
        &self.stack[self.stack.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut ExecutionContext {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    pub fn depth(&self) -> u32 {
        self.current().depth
    }

    /// Enter a new level at `entry_point`; `caller` is linked to the first node fetched there
    pub fn push(&mut self, entry_point: SegmentedAddress, caller: Option<NodeId>) {
        let depth = self.depth() + 1;
        self.stack
            .push(ExecutionContext::new(entry_point, depth, caller));
    }

    /// Leave the current level. `address` is the returning instruction, for the error report.
    pub fn pop(&mut self, address: SegmentedAddress) -> Result<ExecutionContext, CpuError> {
        if self.stack.len() <= 1 {
            return Err(CpuError::ContextStackUnderflow {
                address,
                depth: self.depth(),
            });
        }
        let popped = self.stack.pop().ok_or(CpuError::ContextStackUnderflow {
            address,
            depth: 0,
        })?;
        self.current_mut().node_to_execute_next = None;
        Ok(popped)
    }

    /// Back to a single root context
    pub fn reset(&mut self, entry_point: SegmentedAddress) {
        self.stack.clear();
        self.stack.push(ExecutionContext::new(entry_point, 0, None));
    }

    pub fn info(&self) -> ContextInfo {
        let current = self.current();
        ContextInfo {
            entry_point: current.entry_point,
            depth: current.depth,
            has_last_executed: current.last_executed.is_some(),
            has_node_to_execute_next: current.node_to_execute_next.is_some(),
        }
    }
}
