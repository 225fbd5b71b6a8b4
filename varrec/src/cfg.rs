//! The function's control-flow graph, and the seam through which its blocks are obtained.

use crate::block::Block;
use crate::containers::unordered::UnorderedMap;
use crate::error::RecoveryError;
use crate::log::*;
use std::collections::{BTreeMap, BTreeSet};

/// What is known about a callee's calling convention
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CallingConvention {
    /// Net change to the stack pointer across the call, as seen by the caller after the return
    pub sp_delta: Option<i64>,
}

/// A block that ends in a call
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CallSite {
    pub callee: Option<u64>,
    /// `None` when the callee's calling convention has not been recovered
    pub convention: Option<CallingConvention>,
}

/// Provides the contents of a block, given its address and size
pub trait BlockLifter {
    fn lift(&self, addr: u64, size: usize) -> Result<Block, RecoveryError>;
}

impl BlockLifter for UnorderedMap<u64, Block> {
    fn lift(&self, addr: u64, _size: usize) -> Result<Block, RecoveryError> {
        self.get(&addr)
            .cloned()
            .ok_or(RecoveryError::MissingBlock { addr })
    }
}

/// Control flow of a single function. Nodes are block addresses, each with the size of its
/// machine code.
#[derive(Clone, Debug)]
pub struct FunctionGraph {
    pub func_addr: u64,
    nodes: BTreeMap<u64, usize>,
    succs: BTreeMap<u64, BTreeSet<u64>>,
    preds: BTreeMap<u64, BTreeSet<u64>>,
    entry: Option<u64>,
    dominance_frontiers: UnorderedMap<u64, BTreeSet<u64>>,
    call_sites: UnorderedMap<u64, CallSite>,
}

impl FunctionGraph {
    pub fn new(func_addr: u64) -> Self {
        Self {
            func_addr,
            nodes: Default::default(),
            succs: Default::default(),
            preds: Default::default(),
            entry: None,
            dominance_frontiers: Default::default(),
            call_sites: Default::default(),
        }
    }

    /// Add a block. The block at the function's address becomes the entry unless one was set.
    pub fn add_node(&mut self, addr: u64, size: usize) {
        self.nodes.insert(addr, size);
        if self.entry.is_none() && addr == self.func_addr {
            self.entry = Some(addr);
        }
    }

    pub fn add_edge(&mut self, from: u64, to: u64) {
        self.succs.entry(from).or_default().insert(to);
        self.preds.entry(to).or_default().insert(from);
    }

    pub fn set_entry(&mut self, addr: u64) {
        self.entry = Some(addr);
    }

    pub fn add_call_site(&mut self, block: u64, site: CallSite) {
        self.call_sites.insert(block, site);
    }

    /// Use externally computed dominance frontiers instead of
    /// [`Self::compute_dominance_frontiers`]
    pub fn set_dominance_frontiers(&mut self, frontiers: UnorderedMap<u64, BTreeSet<u64>>) {
        self.dominance_frontiers = frontiers;
    }

    pub fn entry(&self) -> Option<u64> {
        self.entry
    }

    /// All blocks with their sizes, in address order
    pub fn nodes(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.nodes.iter().map(|(&a, &s)| (a, s))
    }

    pub fn block_size(&self, addr: u64) -> Option<usize> {
        self.nodes.get(&addr).copied()
    }

    pub fn successors(&self, addr: u64) -> impl Iterator<Item = u64> + '_ {
        self.succs.get(&addr).into_iter().flatten().copied()
    }

    pub fn predecessors(&self, addr: u64) -> impl Iterator<Item = u64> + '_ {
        self.preds.get(&addr).into_iter().flatten().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.succs
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
    }

    pub fn call_site(&self, block: u64) -> Option<&CallSite> {
        self.call_sites.get(&block)
    }

    pub fn dominance_frontier(&self, addr: u64) -> Option<&BTreeSet<u64>> {
        self.dominance_frontiers.get(&addr)
    }

    /// Whether `addr` is in the dominance frontier of some block, i.e., whether definitions may
    /// need to be reconciled on entry to it.
    pub fn in_any_dominance_frontier(&self, addr: u64) -> bool {
        self.dominance_frontiers
            .values()
            .any(|frontier| frontier.contains(&addr))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Blocks reachable from the entry, in reverse post-order
    pub fn reverse_post_order(&self) -> Vec<u64> {
        let entry = match self.entry {
            Some(e) => e,
            None => return vec![],
        };
        let mut visited: BTreeSet<u64> = Default::default();
        let mut post_order = vec![];
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);
        while let Some(top) = stack.last_mut() {
            let (node, i) = *top;
            top.1 += 1;
            match self.successors(node).nth(i) {
                Some(s) => {
                    if visited.insert(s) {
                        stack.push((s, 0));
                    }
                }
                None => {
                    post_order.push(node);
                    stack.pop();
                }
            }
        }
        post_order.reverse();
        post_order
    }

    /// Compute (and store) dominance frontiers of the blocks reachable from the entry.
    ///
    /// Uses the iterative algorithm from Cooper, Harvey and Kennedy, "A Simple, Fast Dominance
    /// Algorithm".
    pub fn compute_dominance_frontiers(&mut self) {
        let rpo = self.reverse_post_order();
        let rpo_idx: BTreeMap<u64, usize> = rpo.iter().enumerate().map(|(i, &a)| (a, i)).collect();
        let entry = match rpo.first() {
            Some(&e) => e,
            None => return,
        };

        let mut idom: BTreeMap<u64, u64> = Default::default();
        idom.insert(entry, entry);

        let intersect = |idom: &BTreeMap<u64, u64>, mut a: u64, mut b: u64| -> u64 {
            while a != b {
                while rpo_idx[&a] > rpo_idx[&b] {
                    a = idom[&a];
                }
                while rpo_idx[&b] > rpo_idx[&a] {
                    b = idom[&b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom = None;
                for p in self.predecessors(b) {
                    if !idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, p, cur),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&b) != Some(&new_idom) {
                        idom.insert(b, new_idom);
                        changed = true;
                    }
                }
            }
        }

        let mut frontiers: UnorderedMap<u64, BTreeSet<u64>> = Default::default();
        for &b in &rpo {
            let preds: Vec<u64> = self
                .predecessors(b)
                .filter(|p| idom.contains_key(p))
                .collect();
            // The entry has an implicit predecessor: the caller
            if preds.len() < 2 && !(b == entry && !preds.is_empty()) {
                continue;
            }
            let stop = if b == entry { None } else { Some(idom[&b]) };
            for p in preds {
                let mut runner = p;
                while Some(runner) != stop {
                    frontiers.entry(runner).or_default().insert(b);
                    if runner == entry {
                        break;
                    }
                    runner = idom[&runner];
                }
            }
        }
        trace!("Computed dominance frontiers";
               "func" => format_args!("{:#x}", self.func_addr),
               "frontiers" => ?frontiers);
        self.dominance_frontiers = frontiers;
    }
}
