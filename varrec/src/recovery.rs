//! The fixed-point driver: runs the engine over a function's blocks until the stores stop
//! changing (or the per-block iteration cap is hit), then publishes names and live variables to
//! the catalog.

use crate::arch::Arch;
use crate::catalog::{AccessSort, VariableCatalog};
use crate::cfg::{BlockLifter, FunctionGraph};
use crate::containers::unordered::UnorderedMap;
use crate::engine::{BlockOutcome, VariableRecoveryEngine};
use crate::error::{Diagnostic, RecoveryError};
use crate::log::*;
use crate::recovery_config::CONFIG;
use crate::state::AbstractState;
use crate::typevars::ConstraintSet;
use crate::value::signed_hex;
use crate::variable::{Variable, VariableKind};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};

/// How often (in processed jobs) a low-priority analysis yields the thread
const LOW_PRIORITY_YIELD_EVERY: usize = 5;

/// Per-analysis knobs
#[derive(Clone, Copy, Debug)]
pub struct RecoveryOptions {
    /// Number of times a single block may be processed
    pub max_iterations: usize,
    /// Periodically yield to other threads
    pub low_priority: bool,
    /// Adjust the stack pointer after call sites, according to the callee's convention
    pub track_sp: bool,
    /// Abort on the first evaluation error instead of continuing with unbound results
    pub fail_fast: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1,
            low_priority: false,
            track_sp: true,
            fail_fast: false,
        }
    }
}

/// The result of recovering variables of a single function
#[derive(Debug)]
pub struct VariableRecoveryFast {
    pub arch: Arch,
    pub graph: FunctionGraph,
    pub options: RecoveryOptions,
    pub catalog: VariableCatalog,
    /// The (merged) state each block was last processed with
    pub input_states: BTreeMap<u64, AbstractState>,
    pub output_states: BTreeMap<u64, AbstractState>,
    pub node_iterations: BTreeMap<u64, usize>,
    pub outcomes: BTreeMap<u64, BlockOutcome>,
    pub diagnostics: Vec<Diagnostic>,
    /// Union of every constraint emitted over the function
    pub type_constraints: ConstraintSet,
}

impl VariableRecoveryFast {
    /// Recover the variables of the function described by `graph`, obtaining its blocks from
    /// `lifter`.
    pub fn analyze(
        arch: &Arch,
        graph: &FunctionGraph,
        lifter: &impl BlockLifter,
        options: RecoveryOptions,
    ) -> Result<Self, RecoveryError> {
        let entry = match graph.entry() {
            Some(entry) if !graph.is_empty() => entry,
            _ => {
                return Err(RecoveryError::EmptyFunction {
                    func_addr: graph.func_addr,
                })
            }
        };
        info!("Recovering variables";
              "func" => format_args!("{:#x}", graph.func_addr),
              "arch" => arch.name,
              "blocks" => graph.nodes().count());

        let mut catalog = VariableCatalog::new(graph.func_addr);
        let initial = AbstractState::initial(arch, entry, &mut catalog);

        let mut r = Self {
            arch: arch.clone(),
            graph: graph.clone(),
            options,
            catalog,
            input_states: Default::default(),
            output_states: Default::default(),
            node_iterations: Default::default(),
            outcomes: Default::default(),
            diagnostics: vec![],
            type_constraints: Default::default(),
        };

        let order: UnorderedMap<u64, usize> = graph
            .reverse_post_order()
            .into_iter()
            .enumerate()
            .map(|(i, addr)| (addr, i))
            .collect();
        let priority = |addr: u64| order.get(&addr).copied().unwrap_or(usize::MAX);

        // Incoming states not yet consumed, merged as predecessors deliver them
        let mut pending: UnorderedMap<u64, AbstractState> = Default::default();
        pending.insert(entry, initial);
        let mut worklist: BTreeSet<(usize, u64)> = Default::default();
        worklist.insert((priority(entry), entry));

        let mut job_ctr = 0;
        while let Some((_, node)) = worklist.pop_first() {
            job_ctr += 1;
            if r.options.low_priority && job_ctr % LOW_PRIORITY_YIELD_EVERY == 0 {
                std::thread::yield_now();
            }
            let proposed = match pending.remove(&node) {
                Some(s) => s,
                None => continue,
            };
            let out = match r.run_on_node(node, proposed, lifter)? {
                Some(out) => out,
                None => continue,
            };
            let succs: Vec<u64> = r.graph.successors(node).collect();
            for succ in succs {
                let synthesize_phi = r.graph.in_any_dominance_frontier(succ);
                let incoming = match pending.remove(&succ) {
                    Some(prev) => {
                        let (merged, diags) =
                            prev.merge(&out, succ, synthesize_phi, &mut r.catalog);
                        r.diagnostics.extend(diags);
                        merged
                    }
                    None => {
                        let mut s = out.clone();
                        s.block_addr = succ;
                        s
                    }
                };
                pending.insert(succ, incoming);
                worklist.insert((priority(succ), succ));
            }
        }

        r.post_analysis();
        info!("Recovered variables";
              "func" => format_args!("{:#x}", r.graph.func_addr),
              "variables" => r.catalog.variables().count(),
              "constraints" => r.type_constraints.len(),
              "jobs" => job_ctr);
        Ok(r)
    }

    /// Process `node` on `proposed` (joined with whatever it was last processed with). Returns
    /// the output state if the block was processed, or `None` if it was skipped.
    fn run_on_node(
        &mut self,
        node: u64,
        proposed: AbstractState,
        lifter: &impl BlockLifter,
    ) -> Result<Option<AbstractState>, RecoveryError> {
        let input = match self.input_states.get(&node) {
            Some(prev) if *prev == proposed => {
                debug!("Skipping block, reached a fixed point"; "block" => format_args!("{:#x}", node));
                return Ok(None);
            }
            Some(prev) => {
                debug!("Merging input state with the previous one"; "block" => format_args!("{:#x}", node));
                let (merged, diags) = prev.merge(
                    &proposed,
                    node,
                    self.graph.in_any_dominance_frontier(node),
                    &mut self.catalog,
                );
                self.diagnostics.extend(diags);
                if merged == *prev {
                    debug!("Skipping block, join changed nothing"; "block" => format_args!("{:#x}", node));
                    return Ok(None);
                }
                merged
            }
            None => proposed,
        };
        self.input_states.insert(node, input.clone());

        let iterations = self.node_iterations.get(&node).copied().unwrap_or(0);
        if iterations >= self.options.max_iterations {
            debug!("Skipping block, iteration cap reached";
                   "block" => format_args!("{:#x}", node),
                   "iterations" => iterations);
            let diag = Diagnostic::IterationCapReached {
                block: node,
                iterations,
            };
            if !self.diagnostics.contains(&diag) {
                self.diagnostics.push(diag);
            }
            return Ok(None);
        }

        let size = self
            .graph
            .block_size(node)
            .ok_or(RecoveryError::MissingBlock { addr: node })?;
        let block = lifter.lift(node, size)?;

        let mut state = input;
        state.block_addr = node;
        debug!("Processing block"; "block" => format_args!("{:#x}", node), "statements" => block.len());
        let outcome = {
            let mut engine =
                VariableRecoveryEngine::new(&self.arch, &mut self.catalog, self.options.fail_fast);
            let outcome = engine.process(&mut state, &block)?;
            self.diagnostics.extend(engine.take_diagnostics());
            outcome
        };
        self.adjust_sp_after_call(node, &mut state);

        if CONFIG.trace_states_after_each_block {
            trace!("State after block"; "block" => format_args!("{:#x}", node), "state" => ?state);
        }

        self.outcomes.insert(node, outcome);
        self.output_states.insert(node, state.clone());
        self.node_iterations.insert(node, iterations + 1);
        Ok(Some(state))
    }

    /// Account for the callee's stack effect at the end of a block that ends in a call
    fn adjust_sp_after_call(&mut self, node: u64, state: &mut AbstractState) {
        if !self.options.track_sp {
            return;
        }
        let site = match self.graph.call_site(node) {
            Some(site) => *site,
            None => return,
        };
        let ps = &mut state.processor_state;
        ps.sp_adjusted = false;
        match site.convention.and_then(|cc| cc.sp_delta) {
            Some(delta) => {
                ps.sp_adjustment += delta;
                ps.sp_adjusted = true;
                debug!("Adjusting stack pointer after call";
                       "block" => format_args!("{:#x}", node),
                       "delta" => delta,
                       "adjustment" => ps.sp_adjustment);
            }
            None => {
                if site.convention.is_none() {
                    warn!("Unknown calling convention";
                          "call_site" => format_args!("{:#x}", node),
                          OptionalKV("callee", site.callee.map(|c| format!("{:#x}", c))));
                    let diag = Diagnostic::UnknownCallingConvention {
                        call_site: node,
                        callee: site.callee,
                    };
                    if !self.diagnostics.contains(&diag) {
                        self.diagnostics.push(diag);
                    }
                }
                // A guess; wrong for callee-cleanup conventions
                if CONFIG.guess_stack_delta_for_unknown_calls && self.arch.call_pushes_ret {
                    ps.sp_adjustment += self.arch.bytes() as i64;
                    ps.sp_adjusted = true;
                }
            }
        }
    }

    fn post_analysis(&mut self) {
        self.catalog.assign_variable_names(&self.arch);
        for (&addr, state) in self.output_states.iter() {
            self.catalog.set_live_variables(
                addr,
                state.stack_region.clone(),
                state.register_region.clone(),
            );
            self.type_constraints
                .extend(state.type_constraints.iter().cloned());
        }
    }

    /// Display name of `var`, falling back to its identity
    pub fn name_of(&self, var: &Variable) -> String {
        match self.catalog.name_of(var.ident) {
            Some(name) => name.to_owned(),
            None => format!("{}", var.ident),
        }
    }

    /// Human-readable listing of the recovered variables, their accesses, the emitted
    /// constraints and any diagnostics.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "function {:#x}: {} blocks, {} variables, {} accesses, {} constraints",
            self.graph.func_addr,
            self.output_states.len(),
            self.catalog.variables().count(),
            self.catalog.accesses().count(),
            self.type_constraints.len(),
        )];

        lines.push("variables:".into());
        for v in self.catalog.variables() {
            let place = match v.kind() {
                VariableKind::Stack => format!("stack {}", signed_hex(v.offset)),
                VariableKind::Register => format!(
                    "reg {}",
                    self.arch
                        .register_name(v.offset as usize)
                        .map(|s| s.to_owned())
                        .unwrap_or_else(|| v.offset.to_string())
                ),
            };
            let phi = match self.catalog.phi_sources(v.ident) {
                Some(sources) => format!(" phi({})", sources.iter().join(", ")),
                None => String::new(),
            };
            lines.push(format!(
                "  {} ({}): {} size {}{}",
                self.name_of(v),
                v.ident,
                place,
                v.size,
                phi
            ));
        }

        lines.push("accesses:".into());
        for a in self.catalog.accesses() {
            let name = self
                .catalog
                .get_variable(a.variable)
                .map(|v| self.name_of(v))
                .unwrap_or_else(|| format!("{}", a.variable));
            let sort = match a.sort {
                AccessSort::Write => "write",
                AccessSort::Read => "read",
                AccessSort::Reference => "ref",
            };
            let offset = match &a.offset {
                Some(o) => format!(" + {:?}", o),
                None => String::new(),
            };
            lines.push(format!("  {} {}{} at {:?}", sort, name, offset, a.location));
        }

        lines.push("constraints:".into());
        lines.extend(
            self.type_constraints
                .iter()
                .map(|c| format!("  {}", c))
                .sorted(),
        );

        if !self.diagnostics.is_empty() {
            lines.push("diagnostics:".into());
            lines.extend(self.diagnostics.iter().map(|d| format!("  {}", d)));
        }

        lines.into_iter().join("\n")
    }

    /// Write a GraphViz rendering of the function's blocks, each labeled with the variables
    /// live on exit from it.
    pub fn write_dot(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        type Node = u64;
        type Edge = (u64, u64);

        struct Graph<'a> {
            recovery: &'a VariableRecoveryFast,
        }

        let g = Graph { recovery: self };

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("VariableRecovery").unwrap()
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                dot::Id::new(format!("b{:x}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                let r = self.recovery;
                let mut label = format!("{:#x}", n);
                if let Some(live) = r.catalog.live_variables(*n) {
                    let vars = live
                        .stack
                        .iter()
                        .chain(live.register.iter())
                        .map(|(_, v)| r.name_of(v))
                        .join("\\l");
                    if !vars.is_empty() {
                        label = format!("{}\n\n{}\\l", label, vars);
                    }
                }
                dot::LabelText::escaped(label.replace('\n', "\\l"))
            }
            fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
                if self.recovery.graph.call_site(*n).is_some() {
                    Some(dot::LabelText::label("box3d"))
                } else {
                    Some(dot::LabelText::label("box"))
                }
            }
            fn edge_label<'b>(&'b self, _e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label("")
            }
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                self.recovery
                    .graph
                    .nodes()
                    .map(|(a, _)| a)
                    .collect::<Vec<_>>()
                    .into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.recovery.graph.edges().collect::<Vec<_>>().into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        dot::render(&g, w)
    }

    /// Generate a `.dot` file of the function graph annotated with live variables
    pub fn generate_dot(&self) -> String {
        let mut s: Vec<u8> = vec![];
        if let Err(e) = self.write_dot(&mut s) {
            error!("Could not render graph"; "error" => %e);
        }
        String::from_utf8_lossy(&s).into_owned()
    }
}
