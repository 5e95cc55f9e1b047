//! The composition compiler: lowers a composition graph into an executable
//! module.
//!
//! Public API: `generate_composition(composition, types, is_top_level)`.
//! Submodules each own one emission concern; this module holds the generator
//! state, the global node ordering, and the lock-set computations every
//! emission site shares.

pub mod builder;
pub mod constants;
mod chain;
mod entrypoints;
mod metadata;
mod node;
mod transmission;
mod trigger;
pub mod utilities;

use std::collections::{HashMap, HashSet};

use crate::datatype::adapter::TypeAdapter;
use crate::datatype::{DataType, TypeRegistry};
use crate::error::{Issue, IssueList};
use crate::graph::{Composition, GraphAnalysis};
use crate::ir::types::{BinOp, Module, Operand, RtOp, NO_EVENT_ID};
use builder::FunctionBuilder;
use constants::ConstantsCache;

/// A trigger scheduler to be installed into a port context by `setup()`.
pub(crate) struct SchedulerInstall {
    pub composition_identifier: String,
    pub node_index: u64,
    pub port_context_index: u64,
    pub scheduler: String,
}

pub struct Generator<'a> {
    pub(crate) composition: &'a Composition,
    pub(crate) graph: &'a GraphAnalysis,
    pub(crate) types: &'a TypeRegistry,
    pub(crate) module_key: String,
    pub(crate) is_top_level: bool,
    pub(crate) module: Module,
    pub(crate) constants: ConstantsCache,
    pub(crate) issues: IssueList,
    /// Global node order; every multi-node lock acquisition follows it.
    pub(crate) ordered_nodes: Vec<usize>,
    pub(crate) node_order_index: Vec<u64>,
    /// Per trigger: the trigger's node followed by its downstream nodes in
    /// sorted-chain order.
    pub(crate) downstream_for_trigger: Vec<Vec<usize>>,
    /// Data types in first-use order; a port's type index points here.
    pub(crate) ordered_types: Vec<String>,
    pub(crate) helper_symbols: HashSet<String>,
    pub(crate) execute_fns: HashMap<usize, String>,
    pub(crate) transmit_fns: HashMap<usize, String>,
    pub(crate) scheduler_installs: Vec<SchedulerInstall>,
}

/// Compile a finished composition against the given type registry.
pub fn generate_composition(
    composition: &Composition,
    types: &TypeRegistry,
    is_top_level: bool,
) -> Result<Module, IssueList> {
    let graph = GraphAnalysis::new(composition);
    generate_with_graph(composition, &graph, types, is_top_level)
}

pub fn generate_with_graph(
    composition: &Composition,
    graph: &GraphAnalysis,
    types: &TypeRegistry,
    is_top_level: bool,
) -> Result<Module, IssueList> {
    let mut generator = Generator::new(composition, graph, types, is_top_level);
    generator.run();
    if generator.issues.is_empty() {
        Ok(generator.module)
    } else {
        Err(generator.issues)
    }
}

impl<'a> Generator<'a> {
    fn new(
        composition: &'a Composition,
        graph: &'a GraphAnalysis,
        types: &'a TypeRegistry,
        is_top_level: bool,
    ) -> Self {
        let module_key = composition.module_key.clone();
        Generator {
            composition,
            graph,
            types,
            module: Module::new(&module_key),
            constants: ConstantsCache::new(&module_key),
            module_key,
            is_top_level,
            issues: IssueList::new(),
            ordered_nodes: Vec::new(),
            node_order_index: vec![0; composition.nodes.len()],
            downstream_for_trigger: Vec::new(),
            ordered_types: Vec::new(),
            helper_symbols: HashSet::new(),
            execute_fns: HashMap::new(),
            transmit_fns: HashMap::new(),
            scheduler_installs: Vec::new(),
        }
    }

    fn run(&mut self) {
        self.make_ordered_nodes();
        self.make_ordered_types();
        self.ensure_type_helpers();

        self.emit_module_metadata();
        self.emit_composition_wait_for_node();
        self.emit_published_inputs_event();

        self.emit_trigger_functions();

        if !self.is_top_level {
            self.emit_node_event_function();
        }
        if self.composition.is_stateful() {
            self.emit_node_instance_init_function();
            self.emit_node_instance_fini_function();
            self.emit_node_instance_trigger_start_function();
            if !self.is_top_level {
                self.emit_node_instance_trigger_update_function();
            }
        }
        self.emit_node_instance_trigger_stop_function();

        self.emit_composition_release_port_data_function();
        self.emit_composition_get_port_value_function();
        self.emit_composition_set_port_value_function();
        self.emit_composition_fire_trigger_port_event_function();
        self.emit_composition_set_published_input_port_value_function();
        self.emit_composition_create_context_for_node_function();
        self.emit_composition_add_node_metadata_function();
        self.emit_composition_perform_data_only_transmissions_function();

        if self.is_top_level {
            self.emit_top_level_identifier_global();
            self.emit_setup_function();
            self.emit_cleanup_function();
            self.emit_instance_init_function();
            self.emit_instance_fini_function();
            self.emit_instance_trigger_start_function();
            self.emit_instance_trigger_stop_function();
            self.emit_set_input_port_value_function();
            self.emit_get_port_value_functions();
            self.emit_fire_trigger_port_event_function();
            self.emit_published_port_info_functions();
            self.emit_get_published_port_value_functions();
            self.emit_set_published_input_port_value_function();
            self.emit_fire_published_input_port_event_function();
        }
    }

    // --- Shared lookups ---

    pub(crate) fn intern(&mut self, value: &str) -> Operand {
        self.constants.string(&mut self.module, value)
    }

    pub(crate) fn intern_indices(&mut self, values: &[u64]) -> Operand {
        self.constants.uint_array(&mut self.module, values)
    }

    pub(crate) fn qualified(&self, suffix: &str) -> String {
        format!("{}__{}", self.module_key, suffix)
    }

    pub(crate) fn data_type(&self, name: &str) -> Result<&'a DataType, Issue> {
        self.types.get(name).ok_or_else(|| {
            Issue::error(
                "Unsupported composition layout",
                format!("port data type '{name}' is not registered"),
            )
        })
    }

    pub(crate) fn adapter(&self, name: &str) -> Result<TypeAdapter<'a>, Issue> {
        Ok(TypeAdapter::new(self.data_type(name)?))
    }

    pub(crate) fn type_index(&self, name: &str) -> u64 {
        self.ordered_types
            .iter()
            .position(|t| t == name)
            .map(|p| p as u64)
            .unwrap_or(u64::MAX)
    }

    /// Bytes of a port's data slot; zero for event-only ports.
    pub(crate) fn port_data_size(&self, type_name: Option<&str>) -> u64 {
        type_name
            .and_then(|name| self.types.get(name))
            .map(|ty| ty.storage_size)
            .unwrap_or(0)
    }

    pub(crate) fn order_index(&self, node: usize) -> u64 {
        self.node_order_index[node]
    }

    pub(crate) fn record_issue(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    // --- Global node ordering ---

    /// For each trigger, sort its chains into a serial order; then merge all
    /// per-trigger orders into one global order that embeds each of them as
    /// a subsequence.
    fn make_ordered_nodes(&mut self) {
        for trigger in 0..self.graph.trigger_count() {
            let chains = self.graph.chains(trigger);
            let mut loop_heads: HashSet<usize> = HashSet::new();
            let mut chain_lists: Vec<Vec<usize>> = Vec::new();
            for chain in chains {
                if chain.is_last_in_loop {
                    loop_heads.insert(chain.nodes[0]);
                } else {
                    chain_lists.push(chain.nodes.clone());
                }
            }

            chain_lists.sort_by(|a, b| self.compare_chains(trigger, a, b, &loop_heads));

            let trigger_node = self.graph.trigger(trigger).node;
            let mut ordered = vec![trigger_node];
            for list in &chain_lists {
                for &node in list {
                    if node != trigger_node {
                        ordered.push(node);
                    }
                }
            }
            self.downstream_for_trigger.push(ordered);
        }

        let mut per_trigger: Vec<Vec<usize>> = self.downstream_for_trigger.clone();

        // Nodes that transmit without events claim downstream nodes too;
        // their runs participate in the ordering like a trigger's would.
        for &node in self.graph.data_only_sources() {
            let mut run = vec![node];
            run.extend_from_slice(self.graph.data_only_downstream(node));
            per_trigger.push(run);
        }

        // Ascending by size; visited in reverse so triggers with more
        // downstream nodes shape the order first and are more likely to
        // wait on nodes one at a time.
        per_trigger.sort_by(|a, b| {
            a.len().cmp(&b.len()).then_with(|| {
                let name = |nodes: &Vec<usize>| {
                    nodes
                        .iter()
                        .map(|n| self.composition.node_identifier(*n))
                        .collect::<Vec<_>>()
                        .join(" ")
                };
                name(a).cmp(&name(b))
            })
        });

        let mut ordered: Vec<usize> = Vec::new();
        let mut previous_trigger_index: i64 = -1;
        for list in per_trigger.iter().rev() {
            let mut previous_index = previous_trigger_index;
            let mut first = true;
            for &node in list {
                let position = match ordered.iter().position(|&n| n == node) {
                    Some(p) => p,
                    None => {
                        let insert_at = (previous_index + 1) as usize;
                        ordered.insert(insert_at, node);
                        insert_at
                    }
                };
                previous_index = previous_index.max(position as i64);
                if first {
                    previous_trigger_index = previous_index;
                    first = false;
                }
            }
        }

        for node in 0..self.composition.nodes.len() {
            if !ordered.contains(&node) {
                ordered.push(node);
            }
        }

        for (index, &node) in ordered.iter().enumerate() {
            self.node_order_index[node] = index as u64;
        }
        self.ordered_nodes = ordered;
    }

    fn compare_chains(
        &self,
        trigger: usize,
        a: &[usize],
        b: &[usize],
        loop_heads: &HashSet<usize>,
    ) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        let downstream_of_a = self.graph.nodes_downstream_of_node(trigger, *a.last().unwrap());
        let downstream_of_b = self.graph.nodes_downstream_of_node(trigger, *b.last().unwrap());
        let b_downstream_of_a = downstream_of_a.contains(&b[0]);
        let a_downstream_of_b = downstream_of_b.contains(&a[0]);

        if b_downstream_of_a && a_downstream_of_b {
            // A cycle: the chain whose head feeds the loop goes first.
            return match (loop_heads.contains(&a[0]), loop_heads.contains(&b[0])) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            };
        } else if b_downstream_of_a {
            return Ordering::Less;
        } else if a_downstream_of_b {
            return Ordering::Greater;
        }

        // Chains containing trigger ports with more downstream nodes first.
        let max_downstream = |nodes: &[usize]| -> usize {
            nodes
                .iter()
                .flat_map(|n| self.graph.triggers_on_node(*n))
                .map(|t| self.graph.downstream_nodes(*t).len())
                .max()
                .unwrap_or(0)
        };
        let a_max = max_downstream(a);
        let b_max = max_downstream(b);
        if a_max != b_max {
            return b_max.cmp(&a_max);
        }

        self.composition
            .node_identifier(a[0])
            .cmp(self.composition.node_identifier(b[0]))
    }

    pub(crate) fn sort_by_global_order(&self, nodes: &mut Vec<usize>) {
        nodes.sort_by_key(|n| self.node_order_index[*n]);
        nodes.dedup();
    }

    fn make_ordered_types(&mut self) {
        for node in 0..self.composition.nodes.len() {
            for port in self.composition.node_ports(node) {
                if let Some(type_name) = &port.data_type
                    && !self.ordered_types.contains(type_name)
                {
                    self.ordered_types.push(type_name.clone());
                }
            }
        }
    }

    fn ensure_type_helpers(&mut self) {
        for type_name in self.ordered_types.clone() {
            let adapter = match self.adapter(&type_name) {
                Ok(adapter) => adapter,
                Err(issue) => {
                    self.issues.push(issue);
                    continue;
                }
            };
            if let Err(issue) = adapter.ensure_helpers(&mut self.module, &mut self.helper_symbols)
            {
                self.issues.push(issue);
            }
        }
    }

    // --- Wait sets ---

    /// The wait set claimed before a trigger's event may proceed: either the
    /// nodes directly downstream plus the trigger's own node, or the full
    /// downstream set when a narrower claim could deadlock.
    pub(crate) fn nodes_to_wait_on_before_transmission(&self, trigger: usize) -> Vec<usize> {
        let scatter = self.graph.has_scatter_partially_overlapped_by_another_trigger(trigger);
        let spin_off = self.graph.has_overlap_with_spin_off(trigger);

        let downstream = &self.downstream_for_trigger[trigger];
        let mut sorted = downstream.clone();
        self.sort_by_global_order(&mut sorted);
        let out_of_order = *downstream != sorted;

        if scatter || spin_off || out_of_order {
            downstream.clone()
        } else {
            let mut nodes = self.graph.immediate_downstream(trigger).to_vec();
            let trigger_node = self.graph.trigger(trigger).node;
            if !nodes.contains(&trigger_node) {
                nodes.push(trigger_node);
            }
            nodes
        }
    }

    /// The wait set claimed before transmitting out of one node.
    pub(crate) fn nodes_to_wait_on_after_node(&self, trigger: usize, node: usize) -> Vec<usize> {
        if self
            .graph
            .has_scatter_at_node_partially_overlapped_by_another_trigger(trigger, node)
        {
            self.graph.nodes_downstream_of_node(trigger, node)
        } else {
            self.graph.nodes_immediately_downstream_of_node(trigger, node)
        }
    }

    // --- Locking emission ---

    /// Claim the given nodes' semaphores in global order. With
    /// `should_block`, waits indefinitely and returns nothing; otherwise
    /// emits the try-claim cascade that unwinds already-claimed nodes on
    /// failure and returns the keep-trying flag.
    pub(crate) fn emit_wait_for_nodes(
        &mut self,
        b: &mut FunctionBuilder,
        state: Operand,
        nodes: &[usize],
        event_id: Option<Operand>,
        should_block: bool,
    ) -> Option<Operand> {
        let mut sorted = nodes.to_vec();
        self.sort_by_global_order(&mut sorted);

        let event_id =
            event_id.unwrap_or_else(|| b.rt(RtOp::GetNextEventId, vec![state.clone()]));
        let wait_fn = self.qualified("compositionWaitForNode");

        if should_block {
            for node in sorted {
                b.call_void(
                    &wait_fn,
                    vec![
                        state.clone(),
                        Operand::uint(self.order_index(node)),
                        event_id.clone(),
                        Operand::boolean(true),
                    ],
                );
            }
            return None;
        }

        let result = b.fresh();
        b.set_into(result, Operand::boolean(true));
        self.emit_try_claim_cascade(b, &state, &sorted, 0, &event_id, result, &wait_fn);
        Some(Operand::reg(result))
    }

    fn emit_try_claim_cascade(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        nodes: &[usize],
        index: usize,
        event_id: &Operand,
        result: u32,
        wait_fn: &str,
    ) {
        if index >= nodes.len() {
            return;
        }
        let claimed = b.call(
            wait_fn,
            vec![
                state.clone(),
                Operand::uint(self.order_index(nodes[index])),
                event_id.clone(),
                Operand::boolean(false),
            ],
        );
        b.begin_nested();
        self.emit_try_claim_cascade(b, state, nodes, index + 1, event_id, result, wait_fn);
        let then_body = b.end_nested();
        b.begin_nested();
        b.set_into(result, Operand::boolean(false));
        for &node in nodes[..index].iter().rev() {
            self.emit_signal_for_nodes(b, state.clone(), &[node]);
        }
        let else_body = b.end_nested();
        b.push_if(claimed, then_body, else_body);
    }

    /// Release the claim on each node: clear the claiming event and signal.
    pub(crate) fn emit_signal_for_nodes(
        &mut self,
        b: &mut FunctionBuilder,
        state: Operand,
        nodes: &[usize],
    ) {
        for &node in nodes {
            let ctx = b.rt(
                RtOp::GetNodeContext,
                vec![state.clone(), Operand::uint(self.order_index(node))],
            );
            b.rt_void(
                RtOp::SetClaimingEventId,
                vec![ctx.clone(), Operand::uint(NO_EVENT_ID)],
            );
            b.rt_void(RtOp::NodeSemaphoreSignal, vec![ctx]);
        }
    }

    // --- The per-node lock protocol ---

    /// `compositionWaitForNode(state, indexInOrderedNodes, eventId,
    /// shouldBlock) -> bool`. Claims are keyed by event ID so that multiple
    /// edges of the same event treat the lock as reentrant: each iteration
    /// re-checks the claiming event before waiting again.
    fn emit_composition_wait_for_node(&mut self) {
        let name = self.qualified("compositionWaitForNode");
        let mut b = FunctionBuilder::new(&name, 4);
        let state = b.param(0);
        let index = b.param(1);
        let event_id = b.param(2);
        let should_block = b.param(3);

        let keep_trying = b.fresh();
        b.set_into(keep_trying, Operand::boolean(true));

        let timeout_ms = b.fresh();
        b.begin_nested();
        b.set_into(timeout_ms, Operand::uint(1));
        let then_body = b.end_nested();
        b.begin_nested();
        b.set_into(timeout_ms, Operand::uint(0));
        let else_body = b.end_nested();
        b.push_if(should_block.clone(), then_body, else_body);

        let ctx = b.rt(RtOp::GetNodeContext, vec![state, index]);

        // while (claimingEventId != eventId && keepTrying)
        b.begin_nested();
        let claiming = b.rt(RtOp::GetClaimingEventId, vec![ctx.clone()]);
        let not_ours = b.bin(BinOp::Ne, claiming, event_id.clone());
        let cond = b.bin(BinOp::And, not_ours, Operand::reg(keep_trying));
        let header = b.end_nested();

        b.begin_nested();
        let claimed = b.rt(
            RtOp::NodeSemaphoreTryWaitMs,
            vec![ctx.clone(), Operand::reg(timeout_ms)],
        );
        b.begin_nested();
        b.rt_void(RtOp::SetClaimingEventId, vec![ctx.clone(), event_id.clone()]);
        let claimed_body = b.end_nested();
        b.begin_nested();
        {
            let give_up = b.not(should_block.clone());
            b.if_(give_up, |b| b.set_into(keep_trying, Operand::boolean(false)));
        }
        let missed_body = b.end_nested();
        b.push_if(claimed, claimed_body, missed_body);
        let body = b.end_nested();

        b.push_while(header, cond, body);

        b.ret(Some(Operand::reg(keep_trying)));
        self.module.add_function(b.finish());
    }

    fn emit_top_level_identifier_global(&mut self) {
        use crate::graph::TOP_LEVEL_COMPOSITION_IDENTIFIER;
        use crate::ir::types::{GlobalValue, TOP_LEVEL_IDENTIFIER_GLOBAL};
        self.module.set_global(
            TOP_LEVEL_IDENTIFIER_GLOBAL,
            GlobalValue::Str { value: TOP_LEVEL_COMPOSITION_IDENTIFIER.to_string() },
        );
    }
}
