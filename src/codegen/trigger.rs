//! Trigger emission: the scheduler called in-process when a node fires, and
//! the worker that runs the event through the graph on the trigger's queue.

use crate::codegen::builder::FunctionBuilder;
use crate::codegen::{Generator, SchedulerInstall};
use crate::graph::TOP_LEVEL_COMPOSITION_IDENTIFIER;
use crate::ir::types::{Operand, RtOp};
use crate::nodeclass::EventThrottling;

/// Everything needed to emit one trigger scheduler, whether the trigger is
/// at this level of the composition or buried in a subcomposition node.
pub(crate) struct TriggerSchedulerSpec {
    pub composition_identifier: String,
    pub node_index: u64,
    pub port_identifier: String,
    pub port_context_index: u64,
    pub can_drop: bool,
    pub is_published: bool,
    pub is_spin_off: bool,
    pub data_type: Option<String>,
    pub min_threads: i64,
    pub max_threads: i64,
    pub chain_count: u64,
    pub worker_symbol: String,
}

fn threads_operand(threads: i64) -> Operand {
    Operand::uint(threads.max(0) as u64)
}

impl<'a> Generator<'a> {
    pub(crate) fn trigger_port_identifier(&self, trigger: usize) -> String {
        let t = self.graph.trigger(trigger);
        self.composition.port_identifier(t.node, &t.port_name)
    }

    pub(crate) fn trigger_worker_symbol(&self, trigger: usize) -> String {
        self.qualified(&self.trigger_port_identifier(trigger))
    }

    fn trigger_can_drop(&self, trigger: usize) -> bool {
        let t = self.graph.trigger(trigger);
        self.node_class(t.node)
            .output_port(&t.port_name)
            .is_some_and(|p| p.throttling == EventThrottling::Drop)
    }

    fn trigger_data_type(&self, trigger: usize) -> Option<String> {
        let t = self.graph.trigger(trigger);
        self.node_class(t.node)
            .output_port(&t.port_name)
            .and_then(|p| p.data_type.clone())
    }

    /// Emit a worker per trigger at this level and, for the top-level
    /// composition, a scheduler for every trigger at every level.
    pub(crate) fn emit_trigger_functions(&mut self) {
        for trigger in 0..self.graph.trigger_count() {
            self.emit_trigger_worker(trigger);
        }

        if !self.is_top_level {
            return;
        }

        for trigger in 0..self.graph.trigger_count() {
            let t = self.graph.trigger(trigger);
            let (min_threads, max_threads) = self.graph.worker_threads_for_trigger(trigger);
            let spec = TriggerSchedulerSpec {
                composition_identifier: TOP_LEVEL_COMPOSITION_IDENTIFIER.to_string(),
                node_index: self.order_index(t.node),
                port_identifier: self.trigger_port_identifier(trigger),
                port_context_index: self
                    .composition
                    .port_context_index(t.node, &t.port_name)
                    .unwrap_or(0) as u64,
                can_drop: self.trigger_can_drop(trigger),
                is_published: self.graph.published_input_trigger() == Some(trigger),
                is_spin_off: self.node_class(t.node).is_spin_off(),
                data_type: self.trigger_data_type(trigger),
                min_threads,
                max_threads,
                chain_count: self.graph.chains(trigger).len() as u64,
                worker_symbol: self.trigger_worker_symbol(trigger),
            };
            let install = SchedulerInstall {
                composition_identifier: spec.composition_identifier.clone(),
                node_index: spec.node_index,
                port_context_index: spec.port_context_index,
                scheduler: self.emit_trigger_scheduler(&spec),
            };
            self.scheduler_installs.push(install);
        }

        // Triggers declared inside subcomposition nodes, walked by their
        // positions recorded in the child's metadata.
        for node in 0..self.composition.nodes.len() {
            let class = self.node_class(node);
            if !class.is_subcomposition {
                continue;
            }
            let node_id = self.composition.node_identifier(node).to_string();
            for description in class.trigger_descriptions.clone() {
                let (scope_suffix, trigger_node_id) =
                    match description.node_identifier.rsplit_once('/') {
                        Some((prefix, last)) => (format!("/{prefix}"), last.to_string()),
                        None => (String::new(), description.node_identifier.clone()),
                    };
                let composition_identifier = format!(
                    "{TOP_LEVEL_COMPOSITION_IDENTIFIER}/{node_id}{scope_suffix}"
                );
                let spec = TriggerSchedulerSpec {
                    composition_identifier,
                    node_index: description.node_index,
                    port_identifier: format!(
                        "{trigger_node_id}__{}",
                        description.port_name
                    ),
                    port_context_index: description.port_context_index,
                    can_drop: description.throttling == EventThrottling::Drop,
                    is_published: trigger_node_id == "PublishedInputs",
                    is_spin_off: crate::nodeclass::SPIN_OFF_CLASS_PREFIXES
                        .iter()
                        .any(|p| description.node_class_name.starts_with(p)),
                    data_type: description.data_type.clone(),
                    min_threads: description.min_threads,
                    max_threads: description.max_threads,
                    chain_count: description.chain_count,
                    worker_symbol: description.worker_symbol.clone(),
                };
                let install = SchedulerInstall {
                    composition_identifier: spec.composition_identifier.clone(),
                    node_index: spec.node_index,
                    port_context_index: spec.port_context_index,
                    scheduler: self.emit_trigger_scheduler(&spec),
                };
                self.scheduler_installs.push(install);
            }
        }
    }

    /// The scheduler: called by node code each time the trigger fires;
    /// claims the throttle semaphore (or drops), assigns the event its ID,
    /// copies the fired data, and hands the worker to the trigger's queue.
    pub(crate) fn emit_trigger_scheduler(&mut self, spec: &TriggerSchedulerSpec) -> String {
        let name = format!(
            "{}__{}",
            spec.composition_identifier.replace('/', "__"),
            spec.worker_symbol
        );
        if self.module.functions.contains_key(&name) {
            return name;
        }

        let adapter = match spec.data_type.as_deref() {
            Some(type_name) => match self.data_type(type_name) {
                Ok(ty) => Some(crate::datatype::adapter::TypeAdapter::new(ty)),
                Err(issue) => {
                    self.record_issue(issue);
                    return name;
                }
            },
            None => None,
        };
        let param_count = adapter.as_ref().map(|a| a.lowered_param_count(false)).unwrap_or(0);

        let mut b = FunctionBuilder::new(&name, param_count);
        let identifier_op = self.intern(&spec.composition_identifier);
        let state = b.rt(RtOp::CreateCompositionState, vec![identifier_op]);
        let ctx = b.rt(
            RtOp::GetNodeContext,
            vec![state.clone(), Operand::uint(spec.node_index)],
        );
        let port_index = Operand::uint(spec.port_context_index);

        b.begin_nested();
        {
            let group = b.rt(RtOp::GetTriggerWorkersScheduled, vec![state.clone()]);
            b.rt_void(RtOp::EnterGroup, vec![group]);

            let event_id = if spec.is_published {
                let composition_ctx = b.rt(RtOp::GetCompositionContext, vec![state.clone()]);
                b.rt(RtOp::GetOneExecutingEvent, vec![composition_ctx])
            } else {
                let event_id = b.rt(RtOp::GetNextEventId, vec![state.clone()]);
                if spec.is_spin_off {
                    let composition_ctx =
                        b.rt(RtOp::GetCompositionContext, vec![state.clone()]);
                    b.rt_void(
                        RtOp::SpunOffExecutingEvent,
                        vec![composition_ctx, event_id.clone()],
                    );
                }
                event_id
            };

            let data_operand = match &adapter {
                Some(adapter) => {
                    let copy =
                        b.rt(RtOp::Alloc, vec![Operand::uint(adapter.storage_size())]);
                    let args: Vec<Operand> = (0..param_count).map(Operand::reg).collect();
                    if let Err(issue) =
                        adapter.convert_call_args_to_port_data(&mut b, &args, false, copy.clone())
                    {
                        self.record_issue(issue);
                    }
                    if let Err(issue) = adapter.emit_retain(&mut b, copy.clone()) {
                        self.record_issue(issue);
                    }
                    copy
                }
                None => Operand::null(),
            };

            let context = b.rt(
                RtOp::MakeTuple,
                vec![state.clone(), data_operand, event_id.clone()],
            );
            b.rt_void(
                RtOp::ScheduleTriggerWorker,
                vec![
                    state.clone(),
                    ctx.clone(),
                    port_index.clone(),
                    Operand::func(spec.worker_symbol.clone()),
                    context,
                    threads_operand(spec.min_threads),
                    threads_operand(spec.max_threads),
                    event_id,
                    Operand::uint(spec.chain_count),
                ],
            );
        }
        let schedule_body = b.end_nested();

        if spec.can_drop {
            let available = b.rt(
                RtOp::TriggerTryClaimSemaphore,
                vec![ctx.clone(), port_index.clone()],
            );
            b.begin_nested();
            {
                // Retain then release the fired value so the drop leaks
                // nothing, and tell listeners the event was dropped.
                if let Some(adapter) = &adapter {
                    let scratch =
                        b.rt(RtOp::Alloc, vec![Operand::uint(adapter.storage_size())]);
                    let args: Vec<Operand> = (0..param_count).map(Operand::reg).collect();
                    if let Err(issue) = adapter.convert_call_args_to_port_data(
                        &mut b,
                        &args,
                        false,
                        scratch.clone(),
                    ) {
                        self.record_issue(issue);
                    }
                    if let Err(issue) = adapter.emit_retain(&mut b, scratch.clone()) {
                        self.record_issue(issue);
                    }
                    if let Err(issue) = adapter.emit_release(&mut b, scratch.clone()) {
                        self.record_issue(issue);
                    }
                    b.rt_void(RtOp::Free, vec![scratch]);
                }
                let port_id_op = self.intern(&spec.port_identifier);
                b.rt_void(RtOp::SendEventDropped, vec![state.clone(), port_id_op]);
            }
            let drop_body = b.end_nested();
            b.push_if(available, schedule_body, drop_body);
        } else {
            for instr in schedule_body {
                b.push(instr);
            }
        }

        b.ret(None);
        self.module.add_function(b.finish());
        name
    }

    /// The worker: runs on the trigger's serial queue; claims the wait set,
    /// swaps in the fired data, transmits, and launches the chains.
    pub(crate) fn emit_trigger_worker(&mut self, trigger: usize) -> String {
        let name = self.trigger_worker_symbol(trigger);
        let t = self.graph.trigger(trigger).clone();
        let trigger_node = t.node;
        let port_context_index = self
            .composition
            .port_context_index(trigger_node, &t.port_name)
            .unwrap_or(0) as u64;
        let can_drop = self.trigger_can_drop(trigger);
        let is_published = self.graph.published_input_trigger() == Some(trigger);
        let is_node_event_for_sub = !self.is_top_level && is_published;
        let data_type = self.trigger_data_type(trigger);
        let published_output = self.graph.published_output_node();
        let wait_nodes = self.nodes_to_wait_on_before_transmission(trigger);

        let mut b = FunctionBuilder::new(&name, 1);
        let context = b.param(0);
        let state = b.rt(RtOp::TupleGet, vec![context.clone(), Operand::uint(0)]);
        let data_ptr = b.rt(RtOp::TupleGet, vec![context.clone(), Operand::uint(1)]);
        let event_id = b.rt(RtOp::TupleGet, vec![context.clone(), Operand::uint(2)]);
        let composition_ctx = b.rt(RtOp::GetCompositionContext, vec![state.clone()]);
        let trigger_ctx = self.emit_node_get_context(&mut b, &state, trigger_node);
        let group = b.rt(RtOp::GetTriggerWorkersScheduled, vec![state.clone()]);

        if !is_node_event_for_sub {
            let paused = b.rt(RtOp::IsPaused, vec![state.clone()]);
            b.begin_nested();
            {
                if let Some(type_name) = &data_type {
                    match self.adapter(type_name) {
                        Ok(adapter) => {
                            if let Err(issue) = adapter.emit_release(&mut b, data_ptr.clone()) {
                                self.record_issue(issue);
                            }
                        }
                        Err(issue) => self.record_issue(issue),
                    }
                    b.rt_void(RtOp::Free, vec![data_ptr.clone()]);
                }
                if !is_published {
                    self.emit_wait_for_nodes(
                        &mut b,
                        state.clone(),
                        &[published_output],
                        None,
                        true,
                    );
                }
                b.rt_void(
                    RtOp::SendEventFinished,
                    vec![state.clone(), event_id.clone()],
                );
                if is_published {
                    self.emit_signal_for_nodes(&mut b, state.clone(), &wait_nodes);
                }
                if !wait_nodes.contains(&published_output) || !is_published {
                    self.emit_signal_for_nodes(&mut b, state.clone(), &[published_output]);
                }
                if can_drop {
                    b.rt_void(
                        RtOp::TriggerSignalSemaphore,
                        vec![trigger_ctx.clone(), Operand::uint(port_context_index)],
                    );
                }
                b.rt_void(RtOp::LeaveGroup, vec![group.clone()]);
                b.rt_void(
                    RtOp::ReturnThreadsForTriggerWorker,
                    vec![state.clone(), event_id.clone()],
                );
                b.ret(None);
            }
            let paused_body = b.end_nested();
            b.push_if(paused, paused_body, Vec::new());
        }

        if is_published {
            if !is_node_event_for_sub && !wait_nodes.contains(&published_output) {
                // Claimed by firePublishedInputPortEvent just to track the
                // event; hand it back so the chains can claim it normally.
                self.emit_signal_for_nodes(&mut b, state.clone(), &[published_output]);
            }
        } else {
            self.emit_wait_for_nodes(
                &mut b,
                state.clone(),
                &wait_nodes,
                Some(event_id.clone()),
                true,
            );

            // Swap the fired data into the trigger's port slot; the
            // scheduler's retain moves with it.
            let port_data = match &data_type {
                Some(type_name) => match self.adapter(type_name) {
                    Ok(adapter) => {
                        let size = adapter.storage_size();
                        let port_ptr = b.rt(
                            RtOp::GetPortDataPtr,
                            vec![trigger_ctx.clone(), Operand::uint(port_context_index)],
                        );
                        let old = b.rt(RtOp::Alloc, vec![Operand::uint(size)]);
                        b.rt_void(
                            RtOp::CopyBytes,
                            vec![old.clone(), port_ptr.clone(), Operand::uint(size)],
                        );
                        b.rt_void(
                            RtOp::CopyBytes,
                            vec![port_ptr.clone(), data_ptr.clone(), Operand::uint(size)],
                        );
                        if let Err(issue) = adapter.emit_release(&mut b, old.clone()) {
                            self.record_issue(issue);
                        }
                        b.rt_void(RtOp::Free, vec![old]);
                        Some(port_ptr)
                    }
                    Err(issue) => {
                        self.record_issue(issue);
                        None
                    }
                },
                None => None,
            };

            self.emit_transmission_from_output_port(
                &mut b,
                &state,
                trigger_node,
                &t.port_name,
                port_data,
                true,
                true,
            );

            if self.graph.may_transmit_data_only(trigger_node) {
                self.emit_data_only_transmission_from_node(
                    &mut b, &state, trigger_node, false, false, true,
                );
            }
        }

        if !self.graph.downstream_nodes(trigger).contains(&trigger_node) {
            self.emit_signal_for_nodes(&mut b, state.clone(), &[trigger_node]);
        }
        if can_drop {
            b.rt_void(
                RtOp::TriggerSignalSemaphore,
                vec![trigger_ctx.clone(), Operand::uint(port_context_index)],
            );
        }
        b.rt_void(RtOp::LeaveGroup, vec![group]);

        let chain_count = self.graph.chains(trigger).len();
        if chain_count == 0 {
            b.rt_void(
                RtOp::ReturnThreadsForTriggerWorker,
                vec![state.clone(), event_id.clone()],
            );
            if is_node_event_for_sub {
                let executing = b.rt(RtOp::GetExecutingGroup, vec![composition_ctx]);
                b.rt_void(RtOp::LeaveGroup, vec![executing]);
            }
        } else {
            let maps = self.compute_chain_maps(trigger);
            let chain_context = b.rt(
                RtOp::MakeTuple,
                vec![state.clone(), event_id.clone()],
            );

            let mut first_chains: Vec<usize> = (0..chain_count)
                .filter(|c| maps.upstream.get(c).map(|u| u.is_empty()).unwrap_or(true))
                .collect();
            // One chain runs in this worker to save a thread handoff.
            let chosen = first_chains.pop().expect("at least one chain with no upstream");
            let mut scheduled: std::collections::HashSet<usize> =
                std::collections::HashSet::new();
            scheduled.insert(chosen);

            let (min_threads, max_threads) =
                self.graph.worker_threads_for_chain(trigger, chosen);
            b.rt_void(
                RtOp::GrantThreadsToChain,
                vec![
                    state.clone(),
                    event_id.clone(),
                    Operand::uint(chosen as u64),
                    threads_operand(min_threads),
                    threads_operand(max_threads),
                ],
            );

            self.emit_schedule_chain_workers(
                &mut b,
                &state,
                &chain_context,
                &first_chains,
                trigger,
                &maps,
                &mut scheduled,
                &event_id,
            );
            self.emit_chain_execution(
                &mut b,
                &state,
                &chain_context,
                &event_id,
                trigger,
                chosen,
                &maps,
                &mut scheduled,
            );
        }

        if data_type.is_some() {
            b.rt_void(RtOp::Free, vec![data_ptr]);
        }
        b.ret(None);
        self.module.add_function(b.finish());
        name
    }
}
