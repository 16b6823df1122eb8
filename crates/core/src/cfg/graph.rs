//! Decoded-instruction cache and successor edges.
//!
//! Each linear address has at most one *current* node, the one whose bytes were last seen in memory.
//! When the bytes under a current node change, the node is unlinked and kept as an older version so
//! that code flipping between a few variants does not decode again every time. Versions beyond the
//! configured limit are evicted from the arena.

use super::arena::{Arena, NodeId};
use crate::address::SegmentedAddress;
use crate::bus::Memory;
use crate::decoder::Decoder;
use crate::instruction::CfgInstruction;
use crate::logging::{log, LogCategory, LogLevel};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;

/// How a fetch was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The current node still matches memory
    Hit,
    /// An older version matched memory again and became current
    Reused,
    /// Nothing matched, the bytes were decoded
    Built,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub hits: u64,
    pub reuses: u64,
    pub builds: u64,
    /// Current nodes found stale on fetch
    pub self_modifications: u64,
    pub evictions: u64,
    pub links: u64,
}

pub struct InstructionGraph {
    nodes: Arena<CfgInstruction>,
    current: HashMap<u32, NodeId>,
    /// Previous versions per linear address, oldest first
    versions: HashMap<u32, VecDeque<NodeId>>,
    decoder: Decoder,
    max_versions: usize,
    /// Nodes that stopped being current since the last drain
    discarded: Vec<NodeId>,
    stats: GraphStats,
}

impl InstructionGraph {
    pub fn new(decoder: Decoder, max_versions: usize) -> Self {
        Self {
            nodes: Arena::new(),
            current: HashMap::new(),
            versions: HashMap::new(),
            decoder,
            max_versions,
            discarded: Vec::new(),
            stats: GraphStats::default(),
        }
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&CfgInstruction> {
        self.nodes.get(id)
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn stats(&self) -> GraphStats {
        self.stats
    }

    /// Live nodes, current or kept as versions
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn current_at(&self, address: SegmentedAddress) -> Option<NodeId> {
        self.current.get(&address.linear()).copied()
    }

    pub fn is_current(&self, id: NodeId) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|node| self.current.get(&node.address.linear()) == Some(&id))
    }

    /// Ids that stopped being current (stale, evicted or flushed) since the last call
    pub fn take_discarded(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.discarded)
    }

    /// Node for `address` whose bytes match memory, decoding it if needed.
    ///
    /// `hint` is the linked successor the caller expected to find at `address`. The map stays
    /// authoritative; a hint that lost its place is only reported.
    pub fn fetch_or_build(
        &mut self,
        memory: &dyn Memory,
        address: SegmentedAddress,
        hint: Option<NodeId>,
    ) -> (NodeId, FetchOutcome) {
        let linear = address.linear();
        let current = self.current.get(&linear).copied();
        if let Some(hint) = hint.filter(|&hint| current != Some(hint)) {
            log(LogCategory::Cfg, LogLevel::Trace, || {
                format!("successor {:?} at {} is no longer current", hint, address)
            });
        }
        if let Some(id) = current {
            if self
                .nodes
                .get(id)
                .is_some_and(|node| node.matches_memory(memory))
            {
                self.stats.hits += 1;
                return (id, FetchOutcome::Hit);
            }
            self.stats.self_modifications += 1;
            log(LogCategory::Cfg, LogLevel::Debug, || {
                format!("bytes changed under node {:?} at {}", id, address)
            });
            self.demote(id);
        }

        if let Some(id) = self.take_matching_version(memory, linear) {
            self.current.insert(linear, id);
            self.stats.reuses += 1;
            log(LogCategory::Cfg, LogLevel::Debug, || {
                format!("reusing earlier version {:?} at {}", id, address)
            });
            return (id, FetchOutcome::Reused);
        }

        let node = self.decoder.decode(memory, address);
        let id = self.nodes.insert(node);
        self.current.insert(linear, id);
        self.stats.builds += 1;
        (id, FetchOutcome::Built)
    }

    fn take_matching_version(&mut self, memory: &dyn Memory, linear: u32) -> Option<NodeId> {
        let versions = self.versions.get_mut(&linear)?;
        let position = versions.iter().position(|&id| {
            self.nodes
                .get(id)
                .is_some_and(|node| node.matches_memory(memory))
        })?;
        versions.remove(position)
    }

    /// Unlink a current node and keep it as an older version
    fn demote(&mut self, id: NodeId) {
        self.unlink(id);
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let linear = node.address.linear();
        if self.current.get(&linear) == Some(&id) {
            self.current.remove(&linear);
        }
        self.discarded.push(id);
        let versions = self.versions.entry(linear).or_default();
        versions.push_back(id);
        let mut evicted = Vec::new();
        while versions.len() > self.max_versions {
            if let Some(old) = versions.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.evict(old);
        }
    }

    /// Remove a node from the arena; its handle goes stale everywhere
    fn evict(&mut self, id: NodeId) {
        self.unlink(id);
        if let Some(node) = self.nodes.remove(id) {
            let linear = node.address.linear();
            if self.current.get(&linear) == Some(&id) {
                self.current.remove(&linear);
            }
            if let Some(versions) = self.versions.get_mut(&linear) {
                versions.retain(|&v| v != id);
                if versions.is_empty() {
                    self.versions.remove(&linear);
                }
            }
            self.stats.evictions += 1;
            self.discarded.push(id);
            log(LogCategory::Cfg, LogLevel::Trace, || {
                format!("evicted {:?} at {}", id, node.address)
            });
        }
    }

    /// Drop every edge into and out of `id`
    fn unlink(&mut self, id: NodeId) {
        let (successors, predecessors) = match self.nodes.get_mut(id) {
            Some(node) => {
                let successors: Vec<NodeId> = node.successors().collect();
                node.fallthrough = None;
                node.branch = None;
                (successors, std::mem::take(&mut node.predecessors))
            }
            None => return,
        };
        for successor in successors {
            if let Some(node) = self.nodes.get_mut(successor) {
                if let Some(pos) = node.predecessors.iter().position(|&p| p == id) {
                    node.predecessors.swap_remove(pos);
                }
            }
        }
        for predecessor in predecessors {
            if let Some(node) = self.nodes.get_mut(predecessor) {
                if node.fallthrough == Some(id) {
                    node.fallthrough = None;
                }
                if node.branch == Some(id) {
                    node.branch = None;
                }
            }
        }
    }

    /// Record that `to` ran right after `from`.
    ///
    /// The edge goes into the fallthrough slot when `to` starts where `from` ends, otherwise into
    /// the branch slot, replacing an older branch target. Stale handles are ignored.
    pub fn link(&mut self, from: NodeId, to: NodeId) -> bool {
        let Some(to_address) = self.nodes.get(to).map(|node| node.address) else {
            return false;
        };
        let Some(from_node) = self.nodes.get_mut(from) else {
            return false;
        };
        let is_fallthrough = from_node.next_in_memory() == to_address;
        let slot = if is_fallthrough {
            &mut from_node.fallthrough
        } else {
            &mut from_node.branch
        };
        if *slot == Some(to) {
            return false;
        }
        let replaced = slot.replace(to);
        if let Some(old) = replaced {
            if let Some(old_node) = self.nodes.get_mut(old) {
                if let Some(pos) = old_node.predecessors.iter().position(|&p| p == from) {
                    old_node.predecessors.swap_remove(pos);
                }
            }
        }
        if let Some(to_node) = self.nodes.get_mut(to) {
            if !to_node.predecessors.contains(&from) {
                to_node.predecessors.push(from);
            }
        }
        self.stats.links += 1;
        log(LogCategory::Cfg, LogLevel::Trace, || {
            format!(
                "link {:?} -> {:?} ({})",
                from,
                to,
                if is_fallthrough { "fallthrough" } else { "branch" }
            )
        });
        true
    }

    /// Evict every node, current or old, overlapping `range` (linear, end exclusive)
    pub fn invalidate(&mut self, range: Range<u32>) -> usize {
        let doomed: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                let span = node.linear_range();
                span.start < range.end && range.start < span.end
            })
            .map(|(id, _)| id)
            .collect();
        for &id in &doomed {
            self.evict(id);
        }
        if !doomed.is_empty() {
            log(LogCategory::Cfg, LogLevel::Debug, || {
                format!(
                    "invalidated {} node(s) in {:05X}..{:05X}",
                    doomed.len(),
                    range.start,
                    range.end
                )
            });
        }
        doomed.len()
    }

    /// Drop the whole graph
    pub fn flush(&mut self) {
        self.discarded.extend(self.nodes.iter().map(|(id, _)| id));
        self.stats.evictions += self.nodes.len() as u64;
        self.nodes.clear();
        self.current.clear();
        self.versions.clear();
        log(LogCategory::Cfg, LogLevel::Debug, || "CFG flushed".to_string());
    }
}
