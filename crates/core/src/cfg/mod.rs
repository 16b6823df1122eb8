//! Control flow graph cache plus the execution context stack walking it.

pub mod arena;
pub mod context;
pub mod graph;

pub use arena::{Arena, NodeId};
pub use context::{ContextInfo, ExecutionContext, ExecutionContextManager};
pub use graph::{FetchOutcome, GraphStats, InstructionGraph};

use crate::address::SegmentedAddress;
use crate::bus::Memory;
use crate::decoder::Decoder;
use crate::error::CpuError;
use crate::instruction::CfgInstruction;
use std::ops::Range;

/// Owns the graph and the contexts; links each fetched node after the one the current context ran last
pub struct CfgManager {
    graph: InstructionGraph,
    contexts: ExecutionContextManager,
}

impl CfgManager {
    pub fn new(decoder: Decoder, max_versions: usize, entry_point: SegmentedAddress) -> Self {
        Self {
            graph: InstructionGraph::new(decoder, max_versions),
            contexts: ExecutionContextManager::new(entry_point),
        }
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&CfgInstruction> {
        self.graph.get(id)
    }

    pub fn graph(&self) -> &InstructionGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut InstructionGraph {
        &mut self.graph
    }

    pub fn contexts(&self) -> &ExecutionContextManager {
        &self.contexts
    }

    pub fn current_context(&self) -> &ExecutionContext {
        self.contexts.current()
    }

    pub fn context_depth(&self) -> u32 {
        self.contexts.depth()
    }

    /// Node to run at `address`, linked as the successor of the node last executed in this context
    pub fn fetch_next(
        &mut self,
        memory: &dyn Memory,
        address: SegmentedAddress,
    ) -> (NodeId, FetchOutcome) {
        let context = self.contexts.current();
        let hint = context.node_to_execute_next;
        let previous = context.last_executed;
        let (id, outcome) = self.graph.fetch_or_build(memory, address, hint);
        if let Some(previous) = previous {
            self.graph.link(previous, id);
        }
        (id, outcome)
    }

    /// `id` ran to completion in the current context; `next` is its expected successor, if known
    pub fn record_executed(&mut self, id: NodeId, next: Option<NodeId>) {
        let context = self.contexts.current_mut();
        context.last_executed = Some(id);
        context.node_to_execute_next = next;
    }

    /// Enter a call or interrupt. `caller` is `None` for faults and hardware interrupts.
    pub fn push_context(&mut self, entry_point: SegmentedAddress, caller: Option<NodeId>) {
        if let Some(caller) = caller {
            let context = self.contexts.current_mut();
            context.last_executed = Some(caller);
            context.node_to_execute_next = None;
        }
        self.contexts.push(entry_point, caller);
    }

    /// Return from a call or interrupt; `address` is the returning instruction
    pub fn pop_context(&mut self, address: SegmentedAddress) -> Result<ExecutionContext, CpuError> {
        self.contexts.pop(address)
    }

    pub fn invalidate(&mut self, range: Range<u32>) -> usize {
        self.graph.invalidate(range)
    }

    pub fn flush(&mut self) {
        self.graph.flush();
    }

    /// Flush the graph and return to a single root context at `entry_point`
    pub fn reset(&mut self, entry_point: SegmentedAddress) {
        self.graph.flush();
        self.contexts.reset(entry_point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Ram;
    use crate::state::CpuModel;

    fn manager() -> CfgManager {
        CfgManager::new(
            Decoder::new(CpuModel::Intel80386),
            4,
            SegmentedAddress::new(0x0100, 0),
        )
    }

    #[test]
    fn test_fetch_links_after_last_executed() {
        let mut ram = Ram::new();
        ram.load_program(0x1000, &[0x40, 0x40]);
        let mut cfg = manager();
        let (first, _) = cfg.fetch_next(&ram, SegmentedAddress::new(0x0100, 0));
        cfg.record_executed(first, None);
        let (second, _) = cfg.fetch_next(&ram, SegmentedAddress::new(0x0100, 1));
        assert_eq!(cfg.get(first).expect("live").fallthrough, Some(second));
        assert_eq!(cfg.get(second).expect("live").predecessors, vec![first]);
    }

    #[test]
    fn test_call_links_into_callee_and_back() {
        let mut ram = Ram::new();
        // CALL +1 ; HLT ; RET
        ram.load_program(0x1000, &[0xE8, 0x01, 0x00, 0xF4, 0xC3]);
        let mut cfg = manager();
        let (call, _) = cfg.fetch_next(&ram, SegmentedAddress::new(0x0100, 0));
        cfg.push_context(SegmentedAddress::new(0x0100, 4), Some(call));
        assert_eq!(cfg.context_depth(), 1);

        let (ret, _) = cfg.fetch_next(&ram, SegmentedAddress::new(0x0100, 4));
        assert_eq!(cfg.get(call).expect("live").branch, Some(ret));
        cfg.record_executed(ret, None);
        cfg.pop_context(SegmentedAddress::new(0x0100, 4)).expect("balanced");

        let (hlt, _) = cfg.fetch_next(&ram, SegmentedAddress::new(0x0100, 3));
        assert_eq!(cfg.get(call).expect("live").fallthrough, Some(hlt));
        assert_eq!(cfg.context_depth(), 0);
    }

    #[test]
    fn test_fault_context_has_no_caller() {
        let mut cfg = manager();
        cfg.push_context(SegmentedAddress::new(0xF000, 0), None);
        assert_eq!(cfg.current_context().last_executed, None);
        cfg.reset(SegmentedAddress::new(0xFFFF, 0));
        assert_eq!(cfg.context_depth(), 0);
        assert_eq!(cfg.graph().node_count(), 0);
    }
}
