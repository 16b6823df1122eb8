//! The CPU driver loop.
//!
//! Each step delivers a pending hardware interrupt if IF allows it, fetches the node at CS:IP from the
//! graph (decoding it on a miss), then either runs a compiled block starting there or interprets the
//! node. Faults raised by an instruction become interrupts here and nowhere else.

use crate::address::SegmentedAddress;
use crate::bus::{CallbackHandler, CallbackRegistry, IoPortDispatcher, Memory, NullIoPorts};
use crate::cfg::{CfgManager, ContextInfo, GraphStats, InstructionGraph, NodeId};
use crate::config::CpuConfig;
use crate::decoder::Decoder;
use crate::error::CpuError;
use crate::executor::{execute, ContextAction, ExecutionHelper};
use crate::flags::Flags;
use crate::jit::{BlockJit, CompiledBlock, JitCompiler, JitStats, NullJit};
use crate::logging::{log, LogCategory, LogConfig, LogLevel};
use crate::state::{CpuState, RegisterSnapshot};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;
use std::rc::Rc;

/// Counters of the graph, the contexts and the JIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CfgStats {
    pub nodes: usize,
    pub context_depth: u32,
    pub graph: GraphStats,
    pub jit: JitStats,
}

/// Outcome of [`CfgCpu::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Instructions retired during the run
    pub instructions: u64,
    pub halted: bool,
}

pub struct CfgCpu<M: Memory> {
    pub state: CpuState,
    pub memory: M,
    io: Box<dyn IoPortDispatcher>,
    callbacks: Box<dyn CallbackHandler>,
    cfg: CfgManager,
    jit: Box<dyn JitCompiler>,
    config: CpuConfig,
    pending_interrupts: VecDeque<u8>,
    /// The last instruction loaded SS
    interrupt_shadow: bool,
    halted: bool,
}

impl<M: Memory> CfgCpu<M> {
    pub fn new(memory: M, config: CpuConfig) -> Self {
        let state = CpuState::new();
        let cfg = CfgManager::new(
            Decoder::new(config.model),
            config.max_versions_per_address,
            state.cs_ip(),
        );
        let jit: Box<dyn JitCompiler> = if config.jit.enabled {
            Box::new(BlockJit::new(&config.jit))
        } else {
            Box::new(NullJit)
        };
        log(LogCategory::Cpu, LogLevel::Info, || {
            format!(
                "{} core, JIT {}",
                config.model.name(),
                if config.jit.enabled { "on" } else { "off" }
            )
        });
        Self {
            state,
            memory,
            io: Box::new(NullIoPorts),
            callbacks: Box::new(CallbackRegistry::new()),
            cfg,
            jit,
            config,
            pending_interrupts: VecDeque::new(),
            interrupt_shadow: false,
            halted: false,
        }
    }

    pub fn with_io(mut self, io: impl IoPortDispatcher + 'static) -> Self {
        self.io = Box::new(io);
        self
    }

    pub fn with_callbacks(mut self, callbacks: impl CallbackHandler + 'static) -> Self {
        self.callbacks = Box::new(callbacks);
        self
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn graph(&self) -> &InstructionGraph {
        self.cfg.graph()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Move execution to `address`; the root context starts over there
    pub fn set_entry_point(&mut self, address: SegmentedAddress) {
        self.state.set_cs_ip(address);
        self.cfg.reset(address);
        self.jit.clear();
        self.interrupt_shadow = false;
        self.halted = false;
    }

    /// Power-on state: CS:IP = FFFF:0000, FLAGS = 0x0002, empty graph
    pub fn reset(&mut self) {
        self.state = CpuState::new();
        self.cfg.reset(self.state.cs_ip());
        self.cfg.graph_mut().take_discarded();
        self.jit.clear();
        self.pending_interrupts.clear();
        self.interrupt_shadow = false;
        self.halted = false;
    }

    /// Queue a maskable interrupt, delivered before the next fetch once IF is set
    pub fn request_hardware_interrupt(&mut self, vector: u8) {
        self.pending_interrupts.push_back(vector);
    }

    pub fn current_registers(&self) -> RegisterSnapshot {
        self.state.snapshot()
    }

    pub fn current_flags(&self) -> Flags {
        self.state.flags
    }

    pub fn context_depth(&self) -> u32 {
        self.cfg.context_depth()
    }

    pub fn current_context(&self) -> ContextInfo {
        self.cfg.contexts().info()
    }

    pub fn stats(&self) -> CfgStats {
        CfgStats {
            nodes: self.cfg.graph().node_count(),
            context_depth: self.cfg.context_depth(),
            graph: self.cfg.graph().stats(),
            jit: self.jit.stats(),
        }
    }

    /// Memory changed behind the CPU's back (program load, DMA): drop nodes over `range`
    pub fn invalidate(&mut self, range: Range<u32>) -> usize {
        let count = self.cfg.invalidate(range);
        self.drop_discarded_blocks();
        count
    }

    pub fn flush_cfg(&mut self) {
        self.cfg.flush();
        self.cfg.graph_mut().take_discarded();
        self.jit.clear();
    }

    /// Run until HLT or `max_instructions` steps
    pub fn run(&mut self, max_instructions: u64) -> Result<RunSummary, CpuError> {
        let start = self.state.cycles;
        let mut halted = self.halted;
        let mut steps = 0;
        while steps < max_instructions {
            halted = self.decode_and_execute_one()?;
            if halted {
                break;
            }
            steps += 1;
        }
        Ok(RunSummary {
            instructions: self.state.cycles - start,
            halted,
        })
    }

    /// Advance by one instruction or one compiled block; returns true while halted
    pub fn decode_and_execute_one(&mut self) -> Result<bool, CpuError> {
        self.deliver_hardware_interrupt()?;
        if self.halted {
            return Ok(true);
        }

        let address = self.state.cs_ip();
        let (id, _) = self.cfg.fetch_next(&self.memory, address);
        self.drop_discarded_blocks();

        if self.config.jit.enabled {
            if let Some(block) = self.compiled_block(id) {
                return self.run_block(&block);
            }
        }
        self.interpret(id)
    }

    fn compiled_block(&mut self, id: NodeId) -> Option<Rc<CompiledBlock>> {
        if let Some(block) = self.jit.lookup(self.cfg.graph(), &self.memory, id) {
            return Some(block);
        }
        self.jit.try_compile(self.cfg.graph(), &self.memory, id)
    }

    fn interpret(&mut self, id: NodeId) -> Result<bool, CpuError> {
        let node = self.cfg.get(id).ok_or(CpuError::NodeNotFound)?;
        let address = node.address;
        if LogConfig::global().should_log(LogCategory::Cpu, LogLevel::Trace) {
            log(LogCategory::Cpu, LogLevel::Trace, || node.describe());
        }

        let mut helper = ExecutionHelper::new(
            &mut self.state,
            &mut self.memory,
            self.io.as_mut(),
            self.callbacks.as_mut(),
        );
        let result = execute(node, &mut helper);
        let next = helper.next_node();
        let action = helper.take_context_action();
        let halted = helper.halted();
        self.interrupt_shadow = result.is_ok() && helper.interrupt_shadow();

        match result {
            Ok(()) => {
                self.state.cycles += 1;
                self.cfg.record_executed(id, next);
                self.apply_context_action(id, address, action)?;
                self.halted = halted;
                Ok(halted)
            }
            Err(error) => {
                self.handle_error(address, error)?;
                Ok(false)
            }
        }
    }

    fn run_block(&mut self, block: &CompiledBlock) -> Result<bool, CpuError> {
        let mut helper = ExecutionHelper::new(
            &mut self.state,
            &mut self.memory,
            self.io.as_mut(),
            self.callbacks.as_mut(),
        );
        let run = block.run(self.cfg.graph(), &mut helper);
        let halted = helper.halted();
        self.interrupt_shadow = run.failure.is_none() && helper.interrupt_shadow();

        self.jit.record_run(run.executed);
        log(LogCategory::Jit, LogLevel::Trace, || {
            format!(
                "ran {} of {} instruction(s) from {}",
                run.executed,
                block.len(),
                block.start
            )
        });
        if let Some(last) = run.last_executed {
            self.cfg.record_executed(last, run.next_node);
        }
        self.halted = halted;
        if let Some((id, error)) = run.failure {
            let address = self.cfg.get(id).ok_or(CpuError::NodeNotFound)?.address;
            self.handle_error(address, error)?;
            return Ok(false);
        }
        Ok(halted)
    }

    fn apply_context_action(
        &mut self,
        id: NodeId,
        address: SegmentedAddress,
        action: Option<ContextAction>,
    ) -> Result<(), CpuError> {
        match action {
            Some(ContextAction::Push { entry_point }) => {
                self.cfg.push_context(entry_point, Some(id));
            }
            Some(ContextAction::Pop) => {
                self.cfg.pop_context(address)?;
            }
            None => {}
        }
        Ok(())
    }

    /// A fault becomes an interrupt returning to the faulting instruction; anything else stops the loop
    fn handle_error(&mut self, address: SegmentedAddress, error: CpuError) -> Result<(), CpuError> {
        let fault = match error {
            CpuError::Fault(fault) => fault,
            other => {
                log(LogCategory::Cpu, LogLevel::Error, || {
                    format!("fatal at {}: {}", address, other)
                });
                return Err(other);
            }
        };
        if self.config.fail_on_invalid_opcode && fault.is_invalid_opcode() {
            return Err(CpuError::UnhandledFault { fault, address });
        }
        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!("{} at {}, raising INT {:02X}", fault, address, fault.vector())
        });
        self.state.set_cs_ip(address);
        self.dispatch_interrupt(fault.vector(), address.offset)
    }

    /// Interrupt gate plus a context with no calling node
    fn dispatch_interrupt(&mut self, vector: u8, return_ip: u16) -> Result<(), CpuError> {
        let mut helper = ExecutionHelper::new(
            &mut self.state,
            &mut self.memory,
            self.io.as_mut(),
            self.callbacks.as_mut(),
        );
        let entry_point = helper.interrupt(vector, return_ip)?;
        self.cfg.push_context(entry_point, None);
        Ok(())
    }

    /// Only MOV SS and POP SS hold interrupts back for one instruction. TF single-stepping is
    /// not modeled: INT 1 is never raised after an instruction.
    fn deliver_hardware_interrupt(&mut self) -> Result<(), CpuError> {
        let shadowed = std::mem::take(&mut self.interrupt_shadow);
        if shadowed || !self.state.flags.interrupt {
            return Ok(());
        }
        let Some(vector) = self.pending_interrupts.pop_front() else {
            return Ok(());
        };
        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!("hardware interrupt {:02X} at {}", vector, self.state.cs_ip())
        });
        self.halted = false;
        let return_ip = self.state.ip;
        self.dispatch_interrupt(vector, return_ip)
    }

    /// Compiled blocks never outlive the nodes they were built from
    fn drop_discarded_blocks(&mut self) {
        for id in self.cfg.graph_mut().take_discarded() {
            self.jit.invalidate(id);
        }
    }
}
