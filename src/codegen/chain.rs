//! Chain emission: one worker per chain, sequencing node executions,
//! downstream locks, transmission, and the scheduling of downstream chains.

use std::collections::{HashMap, HashSet};

use crate::codegen::builder::FunctionBuilder;
use crate::codegen::Generator;
use crate::ir::types::{Operand, RtOp};

/// Which chains feed which, computed once per trigger. A chain feeds
/// another when its last node can transmit (including across a feedback
/// back edge) to the other's first node.
pub(crate) struct ChainMaps {
    pub upstream: HashMap<usize, Vec<usize>>,
    pub downstream: HashMap<usize, Vec<usize>>,
}

impl<'a> Generator<'a> {
    pub(crate) fn chain_worker_symbol(&self, trigger: usize, chain: usize) -> String {
        self.qualified(&format!(
            "{}__chain{chain}",
            self.trigger_port_identifier(trigger)
        ))
    }

    pub(crate) fn compute_chain_maps(&self, trigger: usize) -> ChainMaps {
        let chains = self.graph.chains(trigger);
        let mut maps = ChainMaps { upstream: HashMap::new(), downstream: HashMap::new() };
        for index in 0..chains.len() {
            let first = chains[index].nodes[0];
            for other in 0..index {
                let last = *chains[other].nodes.last().unwrap();
                if self.graph.may_transmit_including_feedback(trigger, last, first) {
                    maps.upstream.entry(index).or_default().push(other);
                    maps.downstream.entry(other).or_default().push(index);
                }
            }
        }
        maps
    }

    /// Schedule each not-yet-scheduled chain and emit its worker function.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn emit_schedule_chain_workers(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        context: &Operand,
        chains_to_schedule: &[usize],
        trigger: usize,
        maps: &ChainMaps,
        scheduled: &mut HashSet<usize>,
        event_id: &Operand,
    ) {
        for &chain in chains_to_schedule {
            if !scheduled.insert(chain) {
                continue;
            }
            self.emit_chain_worker_function(trigger, chain, maps, scheduled);

            let (min_threads, max_threads) = self.graph.worker_threads_for_chain(trigger, chain);
            let upstream: Vec<u64> = maps
                .upstream
                .get(&chain)
                .map(|u| u.iter().map(|c| *c as u64).collect())
                .unwrap_or_default();
            let upstream_op = self.intern_indices(&upstream);
            b.rt_void(
                RtOp::ScheduleChainWorker,
                vec![
                    state.clone(),
                    Operand::func(self.chain_worker_symbol(trigger, chain)),
                    context.clone(),
                    event_id.clone(),
                    Operand::uint(chain as u64),
                    upstream_op,
                    Operand::uint(min_threads.max(0) as u64),
                    Operand::uint(max_threads.max(0) as u64),
                ],
            );
        }
    }

    fn emit_chain_worker_function(
        &mut self,
        trigger: usize,
        chain: usize,
        maps: &ChainMaps,
        scheduled: &mut HashSet<usize>,
    ) {
        let symbol = self.chain_worker_symbol(trigger, chain);
        if self.module.functions.contains_key(&symbol) {
            return;
        }
        // Reserve the name before emitting the body: downstream chains may
        // refer back while this worker is being built.
        self.module.add_function(crate::ir::types::Function {
            name: symbol.clone(),
            param_count: 1,
            reg_count: 1,
            annotations: vec![Vec::new()],
            body: crate::ir::types::FunctionBody::Ir { instrs: Vec::new() },
        });

        let mut b = FunctionBuilder::new(&symbol, 1);
        let context = b.param(0);
        let state = b.rt(RtOp::TupleGet, vec![context.clone(), Operand::uint(0)]);
        let event_id = b.rt(RtOp::TupleGet, vec![context.clone(), Operand::uint(1)]);
        self.emit_chain_execution(
            &mut b, &state, &context, &event_id, trigger, chain, maps, scheduled,
        );
        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// Execute each node of the chain in order, claim its downstream wait
    /// set, transmit, and release; then schedule the chains downstream of
    /// the last node and hand the chain's threads back.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn emit_chain_execution(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        context: &Operand,
        event_id: &Operand,
        trigger: usize,
        chain: usize,
        maps: &ChainMaps,
        scheduled: &mut HashSet<usize>,
    ) {
        let chain_nodes = self.graph.chains(trigger)[chain].nodes.clone();
        let is_last_in_loop = self.graph.chains(trigger)[chain].is_last_in_loop;
        let published_output = self.graph.published_output_node();

        for node in chain_nodes {
            let execute_fn = self.node_execute_fn(node);
            let transmit_fn = self.node_transmit_fn(node);
            let repeated = self.graph.is_repeated_in_feedback_loop(trigger, node);

            let is_hit = b.call(
                &execute_fn,
                vec![state.clone(), event_id.clone(), Operand::uint(chain as u64)],
            );

            // Whether or not the event hit the node, claim whatever it
            // could transmit to — unless this chain closes a feedback loop
            // and the downstream claims were already made on the way in.
            if !(repeated && is_last_in_loop) {
                let wait_set = self.nodes_to_wait_on_after_node(trigger, node);
                self.emit_wait_for_nodes(
                    b,
                    state.clone(),
                    &wait_set,
                    Some(event_id.clone()),
                    true,
                );
            }

            b.call_void(&transmit_fn, vec![state.clone(), is_hit]);

            // Signal once this was the last time the event could reach the
            // node. The published-output gather of a subcomposition stays
            // claimed until nodeEvent() has copied the outputs out.
            if !(repeated && !is_last_in_loop)
                && !(!self.is_top_level && node == published_output)
            {
                self.emit_signal_for_nodes(b, state.clone(), &[node]);
            }
        }

        let downstream = maps.downstream.get(&chain).cloned().unwrap_or_default();
        if !downstream.is_empty() {
            self.emit_schedule_chain_workers(
                b, state, context, &downstream, trigger, maps, scheduled, event_id,
            );
        }

        b.rt_void(
            RtOp::ReturnThreadsForChainWorker,
            vec![state.clone(), event_id.clone(), Operand::uint(chain as u64)],
        );
    }
}
