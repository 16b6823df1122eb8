//! Block compiler over the instruction graph.
//!
//! A compiled block is a straight-line chain of graph nodes that always ran one after the other.
//! Running it dispatches the same instruction implementations as the interpreter, without going
//! through the fetch and link machinery between nodes, so the observable state is the same by
//! construction. Blocks are keyed by their start node and the hash of its bytes, and are revalidated
//! against memory on every lookup.

use crate::address::SegmentedAddress;
use crate::bus::Memory;
use crate::cfg::{InstructionGraph, NodeId};
use crate::config::JitConfig;
use crate::error::CpuError;
use crate::executor::{execute, ExecutionHelper};
use crate::instruction::FlowKind;
use crate::logging::{log, LogCategory, LogLevel};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub compiled: u64,
    pub rejected: u64,
    pub runs: u64,
    pub instructions: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBlock {
    pub nodes: Vec<NodeId>,
    pub start: SegmentedAddress,
    /// Linear span of every node's bytes, used as the write watch while the block runs
    pub code_range: Range<u32>,
    pub hash: u64,
}

/// What happened while a block ran
#[derive(Debug)]
pub struct BlockRun {
    /// Instructions that completed
    pub executed: usize,
    pub last_executed: Option<NodeId>,
    /// Successor the last completed instruction expects
    pub next_node: Option<NodeId>,
    /// Instruction that failed, with its error; nothing after it ran
    pub failure: Option<(NodeId, CpuError)>,
}

impl CompiledBlock {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    /// True when every node is still current and still matches memory
    pub fn is_valid(&self, graph: &InstructionGraph, memory: &dyn Memory) -> bool {
        self.nodes.iter().all(|&id| {
            graph.is_current(id)
                && graph
                    .get(id)
                    .is_some_and(|node| node.matches_memory(memory))
        })
    }

    /// Execute the chain. Stops early when control leaves the chain, when an instruction writes into
    /// the block's own code, on HLT, or on the first error.
    pub fn run(&self, graph: &InstructionGraph, helper: &mut ExecutionHelper) -> BlockRun {
        helper.set_code_watch(Some(self.code_range.clone()));
        let mut run = BlockRun {
            executed: 0,
            last_executed: None,
            next_node: None,
            failure: None,
        };
        for (index, &id) in self.nodes.iter().enumerate() {
            let Some(node) = graph.get(id) else {
                break;
            };
            let at = helper.state.cs_ip();
            if index > 0 && (at.segment != node.address.segment || at.offset != node.address.offset)
            {
                break;
            }
            helper.begin_instruction();
            if let Err(error) = execute(node, helper) {
                run.failure = Some((id, error));
                break;
            }
            helper.state.cycles += 1;
            run.executed += 1;
            run.last_executed = Some(id);
            run.next_node = helper.next_node();
            if helper.watch_hit() || helper.halted() {
                break;
            }
        }
        helper.set_code_watch(None);
        run
    }
}

/// Compiles and caches blocks for the driver
pub trait JitCompiler {
    /// Cached block starting at `start`, if it is still valid
    fn lookup(
        &mut self,
        graph: &InstructionGraph,
        memory: &dyn Memory,
        start: NodeId,
    ) -> Option<Rc<CompiledBlock>>;

    /// Build a block starting at `start` if the graph around it is eligible
    fn try_compile(
        &mut self,
        graph: &InstructionGraph,
        memory: &dyn Memory,
        start: NodeId,
    ) -> Option<Rc<CompiledBlock>>;

    /// Drop every block containing `node`
    fn invalidate(&mut self, node: NodeId);

    fn clear(&mut self);

    fn record_run(&mut self, _executed: usize) {}

    fn stats(&self) -> JitStats {
        JitStats::default()
    }
}

/// Interpretation only
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJit;

impl JitCompiler for NullJit {
    fn lookup(
        &mut self,
        _graph: &InstructionGraph,
        _memory: &dyn Memory,
        _start: NodeId,
    ) -> Option<Rc<CompiledBlock>> {
        None
    }

    fn try_compile(
        &mut self,
        _graph: &InstructionGraph,
        _memory: &dyn Memory,
        _start: NodeId,
    ) -> Option<Rc<CompiledBlock>> {
        None
    }

    fn invalidate(&mut self, _node: NodeId) {}

    fn clear(&mut self) {}
}

/// Straight-line chain compiler
pub struct BlockJit {
    min_block_size: usize,
    max_block_size: usize,
    blocks: HashMap<(NodeId, u64), Rc<CompiledBlock>>,
    /// Start nodes that could not be compiled, with the graph link count at that time
    rejected: HashMap<NodeId, u64>,
    stats: JitStats,
}

impl BlockJit {
    pub fn new(config: &JitConfig) -> Self {
        Self {
            min_block_size: config.min_block_size.max(1),
            max_block_size: config.max_block_size.max(1),
            blocks: HashMap::new(),
            rejected: HashMap::new(),
            stats: JitStats::default(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn eligible(flow: FlowKind) -> bool {
        matches!(flow, FlowKind::Sequential | FlowKind::Branch)
    }

    /// Straight-line chain from `start`
    fn collect_chain(&self, graph: &InstructionGraph, start: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = start;
        loop {
            let Some(node) = graph.get(current) else {
                break;
            };
            if !graph.is_current(current) || !Self::eligible(node.operation.flow()) {
                break;
            }
            if !chain.is_empty() && node.is_join_point() {
                break;
            }
            chain.push(current);
            if chain.len() >= self.max_block_size || node.successor_count() != 1 {
                break;
            }
            match node.successors().next() {
                Some(next) if !chain.contains(&next) => current = next,
                _ => break,
            }
        }
        chain
    }
}

impl JitCompiler for BlockJit {
    fn lookup(
        &mut self,
        graph: &InstructionGraph,
        memory: &dyn Memory,
        start: NodeId,
    ) -> Option<Rc<CompiledBlock>> {
        let hash = graph.get(start)?.content_hash();
        let key = (start, hash);
        let block = self.blocks.get(&key)?;
        if block.is_valid(graph, memory) {
            return Some(Rc::clone(block));
        }
        self.blocks.remove(&key);
        self.stats.discarded += 1;
        log(LogCategory::Jit, LogLevel::Debug, || {
            format!("discarded stale block at {:?}", start)
        });
        None
    }

    fn try_compile(
        &mut self,
        graph: &InstructionGraph,
        memory: &dyn Memory,
        start: NodeId,
    ) -> Option<Rc<CompiledBlock>> {
        let links = graph.stats().links;
        if self.rejected.get(&start) == Some(&links) {
            return None;
        }
        let chain = self.collect_chain(graph, start);
        if chain.len() < self.min_block_size {
            self.rejected.insert(start, links);
            self.stats.rejected += 1;
            log(LogCategory::Jit, LogLevel::Trace, || {
                format!("no block at {:?}: chain of {}", start, chain.len())
            });
            return None;
        }
        let first = graph.get(start)?;
        let (mut low, mut high) = (u32::MAX, 0);
        for &id in &chain {
            let span = graph.get(id)?.linear_range();
            low = low.min(span.start);
            high = high.max(span.end);
        }
        let block = Rc::new(CompiledBlock {
            start: first.address,
            hash: first.content_hash(),
            code_range: low..high,
            nodes: chain,
        });
        if !block.is_valid(graph, memory) {
            return None;
        }
        self.rejected.remove(&start);
        self.blocks.insert((start, block.hash), Rc::clone(&block));
        self.stats.compiled += 1;
        log(LogCategory::Jit, LogLevel::Debug, || {
            format!(
                "compiled block of {} instruction(s) at {}",
                block.len(),
                block.start
            )
        });
        Some(block)
    }

    fn invalidate(&mut self, node: NodeId) {
        let before = self.blocks.len();
        self.blocks.retain(|_, block| !block.contains(node));
        self.rejected.remove(&node);
        let removed = before - self.blocks.len();
        if removed > 0 {
            self.stats.discarded += removed as u64;
            log(LogCategory::Jit, LogLevel::Debug, || {
                format!("discarded {} block(s) containing {:?}", removed, node)
            });
        }
    }

    fn clear(&mut self) {
        self.stats.discarded += self.blocks.len() as u64;
        self.blocks.clear();
        self.rejected.clear();
    }

    fn record_run(&mut self, executed: usize) {
        self.stats.runs += 1;
        self.stats.instructions += executed as u64;
    }

    fn stats(&self) -> JitStats {
        self.stats
    }
}
