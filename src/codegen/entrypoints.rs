//! Top-level assembly: the control entry points, lifecycle functions, the
//! published-port plumbing, and the subcomposition `nodeEvent` wrapper.

use crate::codegen::builder::FunctionBuilder;
use crate::codegen::utilities::{emit_index_ladder, emit_string_ladder};
use crate::codegen::Generator;
use crate::graph::model::TOP_LEVEL_COMPOSITION_IDENTIFIER;
use crate::ir::parse::{annotate_role, ANNOTATION_UNLOWERED_STRUCT_POINTER};
use crate::ir::types::{BinOp, GlobalValue, Operand, RtOp};
use crate::nodeclass::ParamRole;

use super::node::CallKind;

/// One data-carrying port, collected for the dispatch ladders.
#[derive(Clone)]
struct PortCase {
    node: usize,
    context_index: u64,
    identifier: String,
    type_name: String,
}

#[derive(Clone)]
struct TriggerCase {
    node: usize,
    context_index: u64,
    identifier: String,
    type_name: Option<String>,
}

impl<'a> Generator<'a> {
    fn data_port_cases(&self, inputs_only: bool) -> Vec<PortCase> {
        let mut cases = Vec::new();
        for node in 0..self.composition.nodes.len() {
            let class = self.node_class(node);
            let input_count = class.input_ports.len();
            for (index, port) in self.composition.node_ports(node).iter().enumerate() {
                if inputs_only && index >= input_count {
                    continue;
                }
                if let Some(type_name) = &port.data_type {
                    cases.push(PortCase {
                        node,
                        context_index: index as u64,
                        identifier: self.composition.port_identifier(node, &port.name),
                        type_name: type_name.clone(),
                    });
                }
            }
        }
        cases
    }

    fn trigger_cases(&self) -> Vec<TriggerCase> {
        (0..self.graph.trigger_count())
            .map(|trigger| {
                let t = self.graph.trigger(trigger);
                TriggerCase {
                    node: t.node,
                    context_index: self
                        .composition
                        .port_context_index(t.node, &t.port_name)
                        .unwrap_or(0) as u64,
                    identifier: self.composition.port_identifier(t.node, &t.port_name),
                    type_name: self
                        .node_class(t.node)
                        .output_port(&t.port_name)
                        .and_then(|p| p.data_type.clone()),
                }
            })
            .collect()
    }

    fn initial_value_for_published_input(&self, index: usize) -> String {
        let port = &self.composition.published_inputs[index];
        match (&port.initial_value, &port.type_name) {
            (Some(value), _) => value.clone(),
            (None, Some(type_name)) => self
                .types
                .get(type_name)
                .map(|t| t.default_json.clone())
                .unwrap_or_else(|| "null".to_string()),
            (None, None) => String::new(),
        }
    }

    fn published_trigger_context_index(&self) -> u64 {
        let node = self.graph.published_input_node();
        self.composition
            .port_context_index(node, crate::graph::PUBLISHED_INPUT_TRIGGER_NAME)
            .unwrap_or(0) as u64
    }

    // --- Per-composition functions (module-key prefixed) ---

    /// `compositionReleasePortData(portData, typeIndex)`.
    pub(crate) fn emit_composition_release_port_data_function(&mut self) {
        let name = self.qualified("compositionReleasePortData");
        let mut b = FunctionBuilder::new(&name, 2);
        let ptr = b.param(0);
        let type_index = b.param(1);
        let types = self.ordered_types.clone();
        let indexed: Vec<(u64, String)> = types
            .into_iter()
            .enumerate()
            .map(|(i, t)| (i as u64, t))
            .collect();
        emit_index_ladder(
            self,
            &mut b,
            &type_index,
            &indexed,
            &|case| case.0,
            &mut |gen_, b, case| match gen_.adapter(&case.1) {
                Ok(adapter) => {
                    if let Err(issue) = adapter.emit_release(b, ptr.clone()) {
                        gen_.record_issue(issue);
                    }
                }
                Err(issue) => gen_.record_issue(issue),
            },
        );
        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `compositionGetPortValue(state, portIdentifier, serializationType,
    /// isThreadSafe) -> string` — 0 summary, 1 serialization, 2 interprocess.
    pub(crate) fn emit_composition_get_port_value_function(&mut self) {
        let name = self.qualified("compositionGetPortValue");
        let mut b = FunctionBuilder::new(&name, 4);
        let state = b.param(0);
        let port_identifier = b.param(1);
        let serialization_type = b.param(2);
        let is_thread_safe = b.param(3);

        let result = b.fresh();
        b.set_into(result, Operand::null());

        let cases = self.data_port_cases(false);
        emit_string_ladder(
            self,
            &mut b,
            &port_identifier,
            &cases,
            &|case| case.identifier.clone(),
            &mut |gen_, b, case| {
                let ctx = gen_.emit_node_get_context(b, &state, case.node);
                {
                    let ctx = ctx.clone();
                    b.if_(is_thread_safe.clone(), move |b| {
                        b.rt_void(RtOp::NodeSemaphoreWait, vec![ctx]);
                    });
                }
                let ptr = b.rt(
                    RtOp::GetPortDataPtr,
                    vec![ctx.clone(), Operand::uint(case.context_index)],
                );
                let adapter = match gen_.adapter(&case.type_name) {
                    Ok(adapter) => adapter,
                    Err(issue) => return gen_.record_issue(issue),
                };

                let is_summary =
                    b.bin(BinOp::Eq, serialization_type.clone(), Operand::uint(0));
                b.begin_nested();
                match adapter.emit_summary(b, ptr.clone()) {
                    Ok(text) => b.set_into(result, text),
                    Err(issue) => gen_.record_issue(issue),
                }
                let summary_body = b.end_nested();
                b.begin_nested();
                {
                    let is_interprocess =
                        b.bin(BinOp::Eq, serialization_type.clone(), Operand::uint(2));
                    b.begin_nested();
                    match adapter.emit_interprocess_serialize(b, ptr.clone()) {
                        Ok(text) => b.set_into(result, text),
                        Err(issue) => gen_.record_issue(issue),
                    }
                    let interprocess_body = b.end_nested();
                    b.begin_nested();
                    match adapter.emit_serialize(b, ptr.clone()) {
                        Ok(text) => b.set_into(result, text),
                        Err(issue) => gen_.record_issue(issue),
                    }
                    let serialize_body = b.end_nested();
                    b.push_if(is_interprocess, interprocess_body, serialize_body);
                }
                let other_body = b.end_nested();
                b.push_if(is_summary, summary_body, other_body);

                b.if_(is_thread_safe.clone(), move |b| {
                    b.rt_void(RtOp::NodeSemaphoreSignal, vec![ctx]);
                });
            },
        );

        b.ret(Some(Operand::reg(result)));
        self.module.add_function(b.finish());
    }

    /// `compositionSetPortValue(state, portIdentifier, value, isThreadSafe)`.
    pub(crate) fn emit_composition_set_port_value_function(&mut self) {
        let name = self.qualified("compositionSetPortValue");
        let mut b = FunctionBuilder::new(&name, 4);
        let state = b.param(0);
        let port_identifier = b.param(1);
        let value = b.param(2);
        let is_thread_safe = b.param(3);

        let cases = self.data_port_cases(true);
        emit_string_ladder(
            self,
            &mut b,
            &port_identifier,
            &cases,
            &|case| case.identifier.clone(),
            &mut |gen_, b, case| {
                let ctx = gen_.emit_node_get_context(b, &state, case.node);
                {
                    let ctx = ctx.clone();
                    b.if_(is_thread_safe.clone(), move |b| {
                        b.rt_void(RtOp::NodeSemaphoreWait, vec![ctx]);
                    });
                }
                let ptr = b.rt(
                    RtOp::GetPortDataPtr,
                    vec![ctx.clone(), Operand::uint(case.context_index)],
                );
                let adapter = match gen_.adapter(&case.type_name) {
                    Ok(adapter) => adapter,
                    Err(issue) => return gen_.record_issue(issue),
                };
                if let Err(issue) = adapter.emit_release(b, ptr.clone()) {
                    gen_.record_issue(issue);
                }
                if let Err(issue) =
                    adapter.emit_deserialize_and_retain(b, value.clone(), ptr.clone())
                {
                    gen_.record_issue(issue);
                }

                let identifier_op = gen_.intern(&case.identifier);
                let should = b.rt(
                    RtOp::ShouldSendPortDataTelemetry,
                    vec![state.clone(), identifier_op.clone()],
                );
                let summary = b.fresh();
                b.set_into(summary, Operand::null());
                b.begin_nested();
                match adapter.emit_summary(b, ptr.clone()) {
                    Ok(text) => b.set_into(summary, text),
                    Err(issue) => gen_.record_issue(issue),
                }
                let summary_body = b.end_nested();
                b.push_if(should, summary_body, Vec::new());
                b.rt_void(
                    RtOp::SendInputPortsUpdated,
                    vec![
                        state.clone(),
                        identifier_op,
                        Operand::boolean(false),
                        Operand::boolean(true),
                        Operand::reg(summary),
                    ],
                );

                b.if_(is_thread_safe.clone(), move |b| {
                    b.rt_void(RtOp::NodeSemaphoreSignal, vec![ctx]);
                });
            },
        );

        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `compositionFireTriggerPortEvent(state, portIdentifier)` — fires the
    /// trigger with its current port value.
    pub(crate) fn emit_composition_fire_trigger_port_event_function(&mut self) {
        let name = self.qualified("compositionFireTriggerPortEvent");
        let mut b = FunctionBuilder::new(&name, 2);
        let state = b.param(0);
        let port_identifier = b.param(1);

        let cases = self.trigger_cases();
        emit_string_ladder(
            self,
            &mut b,
            &port_identifier,
            &cases,
            &|case| case.identifier.clone(),
            &mut |gen_, b, case| {
                let ctx = gen_.emit_node_get_context(b, &state, case.node);
                let function = b.rt(
                    RtOp::GetPortTriggerFunction,
                    vec![ctx.clone(), Operand::uint(case.context_index)],
                );
                let args = match &case.type_name {
                    Some(type_name) => match gen_.adapter(type_name) {
                        Ok(adapter) => {
                            let ptr = b.rt(
                                RtOp::GetPortDataPtr,
                                vec![ctx, Operand::uint(case.context_index)],
                            );
                            match adapter.convert_port_data_to_args(b, ptr, false) {
                                Ok(args) => args,
                                Err(issue) => {
                                    gen_.record_issue(issue);
                                    return;
                                }
                            }
                        }
                        Err(issue) => {
                            gen_.record_issue(issue);
                            return;
                        }
                    },
                    None => Vec::new(),
                };
                b.call_indirect_void(function, args);
            },
        );

        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `compositionSetPublishedInputPortValue(state, name, value,
    /// isCompositionRunning)` — stores the value on the published-input
    /// carrier and, while running, pushes it along the no-event cables.
    pub(crate) fn emit_composition_set_published_input_port_value_function(&mut self) {
        let name = self.qualified("compositionSetPublishedInputPortValue");
        let mut b = FunctionBuilder::new(&name, 4);
        let state = b.param(0);
        let port_name = b.param(1);
        let value = b.param(2);
        let is_running = b.param(3);

        let published_input_node = self.graph.published_input_node();
        let mut claim_set = vec![published_input_node];
        claim_set.extend_from_slice(self.graph.data_only_downstream(published_input_node));

        let cases: Vec<(usize, String, Option<String>)> = self
            .composition
            .published_inputs
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.name.clone(), p.type_name.clone()))
            .collect();

        emit_string_ladder(
            self,
            &mut b,
            &port_name,
            &cases,
            &|case| case.1.clone(),
            &mut |gen_, b, case| {
                let Some(type_name) = &case.2 else { return };
                let Some(context_index) = gen_
                    .composition
                    .port_context_index(published_input_node, &case.1)
                else {
                    return;
                };

                b.begin_nested();
                gen_.emit_wait_for_nodes(b, state.clone(), &claim_set, None, true);
                let claim_body = b.end_nested();
                b.push_if(is_running.clone(), claim_body, Vec::new());

                let ctx = gen_.emit_node_get_context(b, &state, published_input_node);
                let ptr = b.rt(
                    RtOp::GetPortDataPtr,
                    vec![ctx, Operand::uint(context_index as u64)],
                );
                match gen_.adapter(type_name) {
                    Ok(adapter) => {
                        if let Err(issue) = adapter.emit_release(b, ptr.clone()) {
                            gen_.record_issue(issue);
                        }
                        if let Err(issue) =
                            adapter.emit_deserialize_and_retain(b, value.clone(), ptr)
                        {
                            gen_.record_issue(issue);
                        }
                    }
                    Err(issue) => gen_.record_issue(issue),
                }

                b.begin_nested();
                gen_.emit_data_only_transmission_from_node(
                    b,
                    &state,
                    published_input_node,
                    false,
                    true,
                    true,
                );
                gen_.emit_signal_for_nodes(b, state.clone(), &claim_set);
                let propagate_body = b.end_nested();
                b.push_if(is_running.clone(), propagate_body, Vec::new());
            },
        );

        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `compositionCreateContextForNode(nodeIndex) -> NodeContext`.
    pub(crate) fn emit_composition_create_context_for_node_function(&mut self) {
        let name = self.qualified("compositionCreateContextForNode");
        let mut b = FunctionBuilder::new(&name, 1);
        let node_index = b.param(0);
        let result = b.fresh();
        b.set_into(result, Operand::null());

        let cases: Vec<(u64, usize)> = self
            .ordered_nodes
            .iter()
            .enumerate()
            .map(|(order, node)| (order as u64, *node))
            .collect();
        emit_index_ladder(
            self,
            &mut b,
            &node_index,
            &cases,
            &|case| case.0,
            &mut |gen_, b, case| {
                let ctx = gen_.emit_node_create_context(b, case.1);
                b.set_into(result, ctx);
            },
        );

        b.ret(Some(Operand::reg(result)));
        self.module.add_function(b.finish());
    }

    /// `compositionAddNodeMetadata(state)`.
    pub(crate) fn emit_composition_add_node_metadata_function(&mut self) {
        let name = self.qualified("compositionAddNodeMetadata");
        let mut b = FunctionBuilder::new(&name, 1);
        let state = b.param(0);
        for node in self.ordered_nodes.clone() {
            self.emit_node_add_metadata(&mut b, &state, node);
        }
        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `compositionPerformDataOnlyTransmissions(state)` — initial push of
    /// data along no-event cables, recursing into subcompositions.
    pub(crate) fn emit_composition_perform_data_only_transmissions_function(&mut self) {
        let name = self.qualified("compositionPerformDataOnlyTransmissions");
        let mut b = FunctionBuilder::new(&name, 1);
        let state = b.param(0);

        for source in self.graph.data_only_sources().to_vec() {
            self.emit_data_only_transmission_from_node(&mut b, &state, source, false, false, false);
        }

        for node in self.ordered_nodes.clone() {
            let class = self.node_class(node);
            if !class.is_subcomposition {
                continue;
            }
            let child_key = class.class_name.clone();
            let inputs: Vec<(String, String)> = class
                .input_ports
                .iter()
                .filter(|p| p.carries_data())
                .map(|p| {
                    let initial = match (&p.initial_value, &p.data_type) {
                        (Some(value), _) => value.clone(),
                        (None, Some(type_name)) => self
                            .types
                            .get(type_name)
                            .map(|t| t.default_json.clone())
                            .unwrap_or_else(|| "null".to_string()),
                        (None, None) => String::new(),
                    };
                    (p.name.clone(), initial)
                })
                .collect();

            let identifier = self.emit_subcomposition_identifier(&mut b, &state, node);
            let child_state = b.rt(RtOp::CreateCompositionState, vec![identifier]);
            for (port, initial) in inputs {
                let port_op = self.intern(&port);
                let initial_op = self.intern(&initial);
                b.call_void(
                    &format!("{child_key}__compositionSetPublishedInputPortValue"),
                    vec![
                        child_state.clone(),
                        port_op,
                        initial_op,
                        Operand::boolean(false),
                    ],
                );
            }
            b.call_void(
                &format!("{child_key}__compositionPerformDataOnlyTransmissions"),
                vec![child_state],
            );
        }

        b.ret(None);
        self.module.add_function(b.finish());
    }

    // --- Subcomposition wrapper ---

    /// `nodeEvent` / `nodeInstanceEvent`: claims the wait set, copies inputs
    /// onto the published-input carrier, fires the published trigger, waits
    /// for the event to drain, and copies the outputs back out.
    pub(crate) fn emit_node_event_function(&mut self) {
        let stateful = self.composition.is_stateful();
        let symbol = if stateful {
            self.qualified("nodeInstanceEvent")
        } else {
            self.qualified("nodeEvent")
        };

        // Parameter layout: state, instance data (stateful only), then per
        // published input data+event, per published output data+event.
        struct InputParam {
            published: usize,
            data_reg: Option<u32>,
            event_reg: u32,
            unlowered: bool,
        }
        struct OutputParam {
            published: usize,
            data_reg: Option<u32>,
            event_reg: u32,
        }

        let mut annotations: Vec<Vec<String>> = Vec::new();
        let mut next: u32 = 0;
        annotations.push(annotate_role(&ParamRole::CompositionState, None));
        next += 1;
        if stateful {
            annotations.push(annotate_role(&ParamRole::InstanceData, None));
            next += 1;
        }

        let mut input_params: Vec<InputParam> = Vec::new();
        for (index, port) in self.composition.published_inputs.iter().enumerate() {
            let mut data_reg = None;
            let mut unlowered = false;
            if let Some(type_name) = &port.type_name {
                unlowered = self
                    .types
                    .get(type_name)
                    .is_some_and(|t| t.lowering == crate::datatype::Lowering::SplitPair);
                let mut annotation =
                    annotate_role(&ParamRole::InputData(port.name.clone()), Some(type_name));
                if unlowered {
                    annotation.push(ANNOTATION_UNLOWERED_STRUCT_POINTER.to_string());
                }
                if let Some(initial) = &port.initial_value {
                    annotation.push(format!("details:{{\"default\":{initial}}}"));
                }
                annotations.push(annotation);
                data_reg = Some(next);
                next += 1;
            }
            annotations.push(annotate_role(&ParamRole::InputEvent(port.name.clone()), None));
            let event_reg = next;
            next += 1;
            input_params.push(InputParam { published: index, data_reg, event_reg, unlowered });
        }

        let mut output_params: Vec<OutputParam> = Vec::new();
        for (index, port) in self.composition.published_outputs.iter().enumerate() {
            let mut data_reg = None;
            if let Some(type_name) = &port.type_name {
                annotations.push(annotate_role(
                    &ParamRole::OutputData(port.name.clone()),
                    Some(type_name),
                ));
                data_reg = Some(next);
                next += 1;
            }
            annotations.push(annotate_role(&ParamRole::OutputEvent(port.name.clone()), None));
            let event_reg = next;
            next += 1;
            output_params.push(OutputParam { published: index, data_reg, event_reg });
        }

        let mut b = FunctionBuilder::new(&symbol, next);
        b.set_annotations(annotations);
        let state = b.param(0);

        let Some(published_trigger) = self.graph.published_input_trigger() else {
            b.ret(None);
            self.module.add_function(b.finish());
            return;
        };

        let composition_ctx = b.rt(RtOp::GetCompositionContext, vec![state.clone()]);
        let event_id = b.rt(RtOp::GetOneExecutingEvent, vec![composition_ctx.clone()]);

        let wait_nodes = self.nodes_to_wait_on_before_transmission(published_trigger);
        self.emit_wait_for_nodes(
            &mut b,
            state.clone(),
            &wait_nodes,
            Some(event_id.clone()),
            true,
        );

        let published_input_node = self.graph.published_input_node();
        let input_ctx = self.emit_node_get_context(&mut b, &state, published_input_node);

        // Copy input data from the arguments onto the carrier's ports.
        for param in &input_params {
            let (Some(data_reg), Some(type_name)) = (
                param.data_reg,
                self.composition.published_inputs[param.published].type_name.clone(),
            ) else {
                continue;
            };
            let port_name =
                self.composition.published_inputs[param.published].name.clone();
            let Some(context_index) = self
                .composition
                .port_context_index(published_input_node, &port_name)
            else {
                continue;
            };
            match self.adapter(&type_name) {
                Ok(adapter) => {
                    let size = adapter.storage_size();
                    let ptr = b.rt(
                        RtOp::GetPortDataPtr,
                        vec![input_ctx.clone(), Operand::uint(context_index as u64)],
                    );
                    let old = b.rt(RtOp::Alloc, vec![Operand::uint(size)]);
                    b.rt_void(
                        RtOp::CopyBytes,
                        vec![old.clone(), ptr.clone(), Operand::uint(size)],
                    );
                    if let Err(issue) = adapter.convert_call_args_to_port_data(
                        &mut b,
                        &[Operand::reg(data_reg)],
                        param.unlowered,
                        ptr.clone(),
                    ) {
                        self.record_issue(issue);
                    }
                    if let Err(issue) = adapter.emit_retain(&mut b, ptr) {
                        self.record_issue(issue);
                    }
                    if let Err(issue) = adapter.emit_release(&mut b, old.clone()) {
                        self.record_issue(issue);
                    }
                    b.rt_void(RtOp::Free, vec![old]);
                }
                Err(issue) => self.record_issue(issue),
            }
        }

        // Push the new values through the no-event cables, then mark the
        // events the caller sent.
        let has_claimed_downstream = wait_nodes.len() > 2;
        self.emit_data_only_transmission_from_node(
            &mut b,
            &state,
            published_input_node,
            !has_claimed_downstream,
            true,
            true,
        );
        for param in &input_params {
            let port_name =
                self.composition.published_inputs[param.published].name.clone();
            if let Some(context_index) = self
                .composition
                .port_context_index(published_input_node, &port_name)
            {
                b.rt_void(
                    RtOp::SetPortEvent,
                    vec![
                        input_ctx.clone(),
                        Operand::uint(context_index as u64),
                        Operand::reg(param.event_reg),
                    ],
                );
            }
        }

        // Record one executing event, fire, and wait for it to drain.
        let executing_group = b.rt(RtOp::GetExecutingGroup, vec![composition_ctx.clone()]);
        b.rt_void(RtOp::EnterGroup, vec![executing_group.clone()]);
        let trigger_fn = b.rt(
            RtOp::GetPortTriggerFunction,
            vec![
                input_ctx.clone(),
                Operand::uint(self.published_trigger_context_index()),
            ],
        );
        b.call_indirect_void(trigger_fn, vec![]);
        b.rt_void(RtOp::WaitGroup, vec![executing_group]);

        // Copy the published outputs out.
        let published_output_node = self.graph.published_output_node();
        let output_ctx = self.emit_node_get_context(&mut b, &state, published_output_node);
        for param in &output_params {
            let port = &self.composition.published_outputs[param.published];
            if let (Some(data_reg), Some(type_name)) = (param.data_reg, port.type_name.clone()) {
                let size = self.port_data_size(Some(&type_name));
                let ptr = b.rt(
                    RtOp::GetPortDataPtr,
                    vec![output_ctx.clone(), Operand::uint(param.published as u64)],
                );
                b.rt_void(
                    RtOp::CopyBytes,
                    vec![Operand::reg(data_reg), ptr, Operand::uint(size)],
                );
            }
            let event = b.rt(
                RtOp::GetOutputEvent,
                vec![composition_ctx.clone(), Operand::uint(param.published as u64)],
            );
            let event_reg = param.event_reg;
            b.rt_void(
                RtOp::StoreWord,
                vec![Operand::reg(event_reg), Operand::uint(0), Operand::uint(0)],
            );
            b.if_(event, move |b| {
                b.rt_void(
                    RtOp::StoreWord,
                    vec![Operand::reg(event_reg), Operand::uint(0), Operand::uint(1)],
                );
            });
        }

        self.emit_signal_for_nodes(&mut b, state.clone(), &[published_output_node]);

        b.ret(None);
        self.module.add_function(b.finish());
    }

    // --- Stateful lifecycle ---

    /// `nodeInstanceInit(state)`: init every stateful node, skipping nodes
    /// the runtime reports as being added or replaced by a live edit.
    pub(crate) fn emit_node_instance_init_function(&mut self) {
        let name = self.qualified("nodeInstanceInit");
        let mut b = FunctionBuilder::new(&name, 1);
        b.set_annotations(vec![annotate_role(&ParamRole::CompositionState, None)]);
        let state = b.param(0);
        for node in 0..self.composition.nodes.len() {
            if !self.node_class(node).is_stateful {
                continue;
            }
            let identifier = self.composition.node_identifier(node).to_string();
            let identifier_op = self.intern(&identifier);
            let gated = b.rt(
                RtOp::IsNodeBeingAddedOrReplaced,
                vec![state.clone(), identifier_op],
            );
            let proceed = b.not(gated);
            b.begin_nested();
            self.emit_node_function_call(&mut b, &state, node, CallKind::Init);
            let body = b.end_nested();
            b.push_if(proceed, body, Vec::new());
        }
        b.ret(Some(Operand::uint(0)));
        self.module.add_function(b.finish());
    }

    /// `nodeInstanceFini(state)`: fini every stateful node not being
    /// carried across a live edit.
    pub(crate) fn emit_node_instance_fini_function(&mut self) {
        let name = self.qualified("nodeInstanceFini");
        let mut b = FunctionBuilder::new(&name, 1);
        b.set_annotations(vec![annotate_role(&ParamRole::CompositionState, None)]);
        let state = b.param(0);
        for node in 0..self.composition.nodes.len() {
            if !self.node_class(node).is_stateful {
                continue;
            }
            let identifier = self.composition.node_identifier(node).to_string();
            let identifier_op = self.intern(&identifier);
            let gated = b.rt(
                RtOp::IsNodeBeingRemovedOrReplaced,
                vec![state.clone(), identifier_op],
            );
            let proceed = b.not(gated);
            b.begin_nested();
            self.emit_node_function_call(&mut b, &state, node, CallKind::Fini);
            let body = b.end_nested();
            b.push_if(proceed, body, Vec::new());
        }
        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `nodeInstanceTriggerStart(state)`: callbacks can fire events, so all
    /// nodes stay claimed until every start callback has run.
    pub(crate) fn emit_node_instance_trigger_start_function(&mut self) {
        let name = self.qualified("nodeInstanceTriggerStart");
        let mut b = FunctionBuilder::new(&name, 1);
        b.set_annotations(vec![annotate_role(&ParamRole::CompositionState, None)]);
        let state = b.param(0);
        let all_nodes = self.ordered_nodes.clone();
        self.emit_wait_for_nodes(&mut b, state.clone(), &all_nodes, None, true);
        for node in 0..self.composition.nodes.len() {
            if self.node_class(node).is_stateful {
                self.emit_node_function_call(&mut b, &state, node, CallKind::CallbackStart);
            }
        }
        self.emit_signal_for_nodes(&mut b, state.clone(), &all_nodes);
        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `nodeInstanceTriggerStop(state)`; at top level additionally drains
    /// scheduled trigger workers and in-flight events.
    pub(crate) fn emit_node_instance_trigger_stop_function(&mut self) {
        let name = self.qualified("nodeInstanceTriggerStop");
        let mut b = FunctionBuilder::new(&name, 1);
        b.set_annotations(vec![annotate_role(&ParamRole::CompositionState, None)]);
        let state = b.param(0);
        let all_nodes = self.ordered_nodes.clone();
        self.emit_wait_for_nodes(&mut b, state.clone(), &all_nodes, None, true);
        for node in 0..self.composition.nodes.len() {
            if self.node_class(node).is_stateful {
                self.emit_node_function_call(&mut b, &state, node, CallKind::CallbackStop);
            }
        }
        self.emit_signal_for_nodes(&mut b, state.clone(), &all_nodes);

        if self.is_top_level {
            let group = b.rt(RtOp::GetTriggerWorkersScheduled, vec![state.clone()]);
            b.rt_void(RtOp::WaitGroup, vec![group]);
            self.emit_wait_for_nodes(&mut b, state.clone(), &all_nodes, None, true);
            self.emit_signal_for_nodes(&mut b, state.clone(), &all_nodes);
        }

        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `nodeInstanceTriggerUpdate(state)`: re-push published input data and
    /// let stateful nodes observe the change.
    pub(crate) fn emit_node_instance_trigger_update_function(&mut self) {
        let name = self.qualified("nodeInstanceTriggerUpdate");
        let mut b = FunctionBuilder::new(&name, 1);
        b.set_annotations(vec![annotate_role(&ParamRole::CompositionState, None)]);
        let state = b.param(0);
        if let Some(published_trigger) = self.graph.published_input_trigger() {
            let wait_nodes = self.nodes_to_wait_on_before_transmission(published_trigger);
            self.emit_wait_for_nodes(&mut b, state.clone(), &wait_nodes, None, true);
            let has_claimed_downstream = wait_nodes.len() > 2;
            let published_input_node = self.graph.published_input_node();
            self.emit_data_only_transmission_from_node(
                &mut b,
                &state,
                published_input_node,
                !has_claimed_downstream,
                true,
                false,
            );
            self.emit_signal_for_nodes(&mut b, state.clone(), &wait_nodes);
        }
        b.ret(None);
        self.module.add_function(b.finish());
    }

    // --- Top-level entry points ---

    fn top_level_state(&mut self, b: &mut FunctionBuilder) -> Operand {
        let identifier = self.intern(TOP_LEVEL_COMPOSITION_IDENTIFIER);
        b.rt(RtOp::CreateCompositionState, vec![identifier])
    }

    /// `setup()`: register metadata, build contexts, initialize published
    /// inputs, perform initial data-only transmissions, and install every
    /// trigger scheduler pointer.
    pub(crate) fn emit_setup_function(&mut self) {
        let mut b = FunctionBuilder::new("setup", 0);
        let state = self.top_level_state(&mut b);

        b.call_void(&self.qualified("compositionAddNodeMetadata"), vec![state.clone()]);
        b.rt_void(
            RtOp::InitContextForTopLevelComposition,
            vec![
                state.clone(),
                Operand::boolean(self.composition.is_stateful()),
                Operand::uint(self.composition.published_outputs.len() as u64),
            ],
        );

        for index in 0..self.composition.published_inputs.len() {
            let name = self.composition.published_inputs[index].name.clone();
            let initial = self.initial_value_for_published_input(index);
            let name_op = self.intern(&name);
            let initial_op = self.intern(&initial);
            b.call_void(
                &self.qualified("compositionSetPublishedInputPortValue"),
                vec![state.clone(), name_op, initial_op, Operand::boolean(false)],
            );
        }

        b.call_void(
            &self.qualified("compositionPerformDataOnlyTransmissions"),
            vec![state.clone()],
        );

        for install in std::mem::take(&mut self.scheduler_installs) {
            let install_state =
                if install.composition_identifier == TOP_LEVEL_COMPOSITION_IDENTIFIER {
                    state.clone()
                } else {
                    let identifier = self.intern(&install.composition_identifier);
                    b.rt(RtOp::CreateCompositionState, vec![identifier])
                };
            let ctx = b.rt(
                RtOp::GetNodeContext,
                vec![install_state, Operand::uint(install.node_index)],
            );
            b.rt_void(
                RtOp::SetPortTriggerFunction,
                vec![
                    ctx,
                    Operand::uint(install.port_context_index),
                    Operand::func(install.scheduler.clone()),
                ],
            );
        }

        b.ret(None);
        self.module.add_function(b.finish());
    }

    pub(crate) fn emit_cleanup_function(&mut self) {
        let mut b = FunctionBuilder::new("cleanup", 0);
        let state = self.top_level_state(&mut b);
        b.rt_void(RtOp::FiniContextForTopLevelComposition, vec![state]);
        b.ret(None);
        self.module.add_function(b.finish());
    }

    pub(crate) fn emit_instance_init_function(&mut self) {
        let mut b = FunctionBuilder::new("init", 0);
        if self.composition.is_stateful() {
            let state = self.top_level_state(&mut b);
            b.call_void(&self.qualified("nodeInstanceInit"), vec![state]);
        }
        b.ret(None);
        self.module.add_function(b.finish());
    }

    pub(crate) fn emit_instance_fini_function(&mut self) {
        let mut b = FunctionBuilder::new("fini", 0);
        if self.composition.is_stateful() {
            let state = self.top_level_state(&mut b);
            b.call_void(&self.qualified("nodeInstanceFini"), vec![state]);
        }
        b.ret(None);
        self.module.add_function(b.finish());
    }

    pub(crate) fn emit_instance_trigger_start_function(&mut self) {
        let mut b = FunctionBuilder::new("triggerStart", 0);
        if self.composition.is_stateful() {
            let state = self.top_level_state(&mut b);
            b.call_void(&self.qualified("nodeInstanceTriggerStart"), vec![state]);
        }
        b.ret(None);
        self.module.add_function(b.finish());
    }

    pub(crate) fn emit_instance_trigger_stop_function(&mut self) {
        let mut b = FunctionBuilder::new("triggerStop", 0);
        let state = self.top_level_state(&mut b);
        b.call_void(&self.qualified("nodeInstanceTriggerStop"), vec![state]);
        b.ret(None);
        self.module.add_function(b.finish());
    }

    pub(crate) fn emit_set_input_port_value_function(&mut self) {
        let mut b = FunctionBuilder::new("setInputPortValue", 2);
        let port_identifier = b.param(0);
        let value = b.param(1);
        let state = self.top_level_state(&mut b);
        b.call_void(
            &self.qualified("compositionSetPortValue"),
            vec![state, port_identifier, value, Operand::boolean(true)],
        );
        b.ret(None);
        self.module.add_function(b.finish());
    }

    pub(crate) fn emit_get_port_value_functions(&mut self) {
        for name in ["getInputPortValue", "getOutputPortValue"] {
            let mut b = FunctionBuilder::new(name, 2);
            let port_identifier = b.param(0);
            let interprocess = b.param(1);
            let state = self.top_level_state(&mut b);
            let serialization = b.fresh();
            b.set_into(serialization, Operand::uint(1));
            let wants_interprocess = b.bin(BinOp::Ne, interprocess, Operand::uint(0));
            b.if_(wants_interprocess, |b| {
                b.set_into(serialization, Operand::uint(2));
            });
            let result = b.call(
                &self.qualified("compositionGetPortValue"),
                vec![
                    state,
                    port_identifier,
                    Operand::reg(serialization),
                    Operand::boolean(true),
                ],
            );
            b.ret(Some(result));
            self.module.add_function(b.finish());
        }
    }

    pub(crate) fn emit_fire_trigger_port_event_function(&mut self) {
        let mut b = FunctionBuilder::new("fireTriggerPortEvent", 1);
        let port_identifier = b.param(0);
        let state = self.top_level_state(&mut b);
        b.call_void(
            &self.qualified("compositionFireTriggerPortEvent"),
            vec![state, port_identifier],
        );
        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// Constant-returning published-port info functions.
    pub(crate) fn emit_published_port_info_functions(&mut self) {
        let sides: [(&str, Vec<(String, Option<String>, Option<serde_json::Value>)>); 2] = [
            (
                "Input",
                self.composition
                    .published_inputs
                    .iter()
                    .map(|p| (p.name.clone(), p.type_name.clone(), p.details.clone()))
                    .collect(),
            ),
            (
                "Output",
                self.composition
                    .published_outputs
                    .iter()
                    .map(|p| (p.name.clone(), p.type_name.clone(), p.details.clone()))
                    .collect(),
            ),
        ];

        for (side, ports) in sides {
            let count_fn = format!("getPublished{side}Count");
            let mut b = FunctionBuilder::new(&count_fn, 0);
            b.ret(Some(Operand::uint(ports.len() as u64)));
            self.module.add_function(b.finish());

            let names_global = format!("published{side}Names");
            self.module.set_global(
                &names_global,
                GlobalValue::StrList {
                    values: ports.iter().map(|(name, _, _)| name.clone()).collect(),
                },
            );
            let mut b = FunctionBuilder::new(&format!("getPublished{side}Names"), 0);
            b.ret(Some(Operand::global(names_global)));
            self.module.add_function(b.finish());

            let types_global = format!("published{side}Types");
            self.module.set_global(
                &types_global,
                GlobalValue::StrList {
                    values: ports
                        .iter()
                        .map(|(_, type_name, _)| {
                            type_name.clone().unwrap_or_else(|| "event".to_string())
                        })
                        .collect(),
                },
            );
            let mut b = FunctionBuilder::new(&format!("getPublished{side}Types"), 0);
            b.ret(Some(Operand::global(types_global)));
            self.module.add_function(b.finish());

            let details_global = format!("published{side}Details");
            self.module.set_global(
                &details_global,
                GlobalValue::StrList {
                    values: ports
                        .iter()
                        .map(|(_, _, details)| {
                            details
                                .as_ref()
                                .map(|d| d.to_string())
                                .unwrap_or_else(|| "{}".to_string())
                        })
                        .collect(),
                },
            );
            let mut b = FunctionBuilder::new(&format!("getPublished{side}Details"), 0);
            b.ret(Some(Operand::global(details_global)));
            self.module.add_function(b.finish());
        }
    }

    pub(crate) fn emit_get_published_port_value_functions(&mut self) {
        let input_node = self.graph.published_input_node();
        let output_node = self.graph.published_output_node();
        let sides: [(&str, usize, Vec<String>); 2] = [
            (
                "getPublishedInputPortValue",
                input_node,
                self.composition
                    .published_inputs
                    .iter()
                    .map(|p| p.name.clone())
                    .collect(),
            ),
            (
                "getPublishedOutputPortValue",
                output_node,
                self.composition
                    .published_outputs
                    .iter()
                    .map(|p| p.name.clone())
                    .collect(),
            ),
        ];

        for (function_name, node, names) in sides {
            let mut b = FunctionBuilder::new(function_name, 2);
            let port_name = b.param(0);
            let interprocess = b.param(1);
            let state = self.top_level_state(&mut b);
            let serialization = b.fresh();
            b.set_into(serialization, Operand::uint(1));
            let wants_interprocess = b.bin(BinOp::Ne, interprocess, Operand::uint(0));
            b.if_(wants_interprocess, |b| {
                b.set_into(serialization, Operand::uint(2));
            });

            let result = b.fresh();
            b.set_into(result, Operand::null());
            let cases: Vec<String> = names;
            emit_string_ladder(
                self,
                &mut b,
                &port_name,
                &cases,
                &|case| case.clone(),
                &mut |gen_, b, case| {
                    let identifier = gen_.composition.port_identifier(node, case);
                    let identifier_op = gen_.intern(&identifier);
                    let value = b.call(
                        &gen_.qualified("compositionGetPortValue"),
                        vec![
                            state.clone(),
                            identifier_op,
                            Operand::reg(serialization),
                            Operand::boolean(true),
                        ],
                    );
                    b.set_into(result, value);
                },
            );
            b.ret(Some(Operand::reg(result)));
            self.module.add_function(b.finish());
        }
    }

    /// `setPublishedInputPortValue(name, value)`: serialized with event
    /// fires by running on the published-input trigger's queue.
    pub(crate) fn emit_set_published_input_port_value_function(&mut self) {
        let worker = self.qualified("setPublishedInputWorker");
        {
            let mut b = FunctionBuilder::new(&worker, 1);
            let context = b.param(0);
            let state = b.rt(RtOp::TupleGet, vec![context.clone(), Operand::uint(0)]);
            let name = b.rt(RtOp::TupleGet, vec![context.clone(), Operand::uint(1)]);
            let value = b.rt(RtOp::TupleGet, vec![context, Operand::uint(2)]);
            b.call_void(
                &self.qualified("compositionSetPublishedInputPortValue"),
                vec![state, name, value, Operand::boolean(true)],
            );
            b.ret(None);
            self.module.add_function(b.finish());
        }

        let mut b = FunctionBuilder::new("setPublishedInputPortValue", 2);
        let name = b.param(0);
        let value = b.param(1);
        let state = self.top_level_state(&mut b);
        let input_node = self.graph.published_input_node();
        let ctx = self.emit_node_get_context(&mut b, &state, input_node);
        let context = b.rt(RtOp::MakeTuple, vec![state, name, value]);
        b.rt_void(
            RtOp::SubmitToTriggerQueueSync,
            vec![
                ctx,
                Operand::uint(self.published_trigger_context_index()),
                Operand::func(worker),
                context,
            ],
        );
        b.ret(None);
        self.module.add_function(b.finish());
    }

    /// `firePublishedInputPortEvent(names, count)`: claim the wait set and
    /// the published-output gather, record the event, mark the named ports,
    /// and fire the published trigger.
    pub(crate) fn emit_fire_published_input_port_event_function(&mut self) {
        let mut b = FunctionBuilder::new("firePublishedInputPortEvent", 2);
        let names = b.param(0);
        let count = b.param(1);
        let state = self.top_level_state(&mut b);

        let Some(published_trigger) = self.graph.published_input_trigger() else {
            b.ret(None);
            self.module.add_function(b.finish());
            return;
        };

        let event_id = b.rt(RtOp::GetNextEventId, vec![state.clone()]);

        let mut wait_nodes = self.nodes_to_wait_on_before_transmission(published_trigger);
        let published_output = self.graph.published_output_node();
        if !wait_nodes.contains(&published_output) {
            wait_nodes.push(published_output);
        }
        self.emit_wait_for_nodes(
            &mut b,
            state.clone(),
            &wait_nodes,
            Some(event_id.clone()),
            true,
        );

        let composition_ctx = b.rt(RtOp::GetCompositionContext, vec![state.clone()]);
        b.rt_void(
            RtOp::StartedExecutingEvent,
            vec![composition_ctx, event_id.clone()],
        );

        let input_node = self.graph.published_input_node();
        let input_ctx = self.emit_node_get_context(&mut b, &state, input_node);

        // Mark the selected ports as hit.
        let index = b.fresh();
        b.set_into(index, Operand::uint(0));
        b.begin_nested();
        let in_range = b.bin(BinOp::Lt, Operand::reg(index), count.clone());
        let header = b.end_nested();
        b.begin_nested();
        {
            let current = b.rt(RtOp::TupleGet, vec![names.clone(), Operand::reg(index)]);
            let cases: Vec<String> = self
                .composition
                .published_inputs
                .iter()
                .map(|p| p.name.clone())
                .collect();
            emit_string_ladder(
                self,
                &mut b,
                &current,
                &cases,
                &|case| case.clone(),
                &mut |gen_, b, case| {
                    if let Some(context_index) =
                        gen_.composition.port_context_index(input_node, case)
                    {
                        b.rt_void(
                            RtOp::SetPortEvent,
                            vec![
                                input_ctx.clone(),
                                Operand::uint(context_index as u64),
                                Operand::boolean(true),
                            ],
                        );
                    }
                },
            );
            let next = b.bin(BinOp::Add, Operand::reg(index), Operand::uint(1));
            b.set_into(index, next);
        }
        let body = b.end_nested();
        b.push_while(header, in_range, body);

        let trigger_fn = b.rt(
            RtOp::GetPortTriggerFunction,
            vec![
                input_ctx,
                Operand::uint(self.published_trigger_context_index()),
            ],
        );
        b.call_indirect_void(trigger_fn, vec![]);

        b.ret(None);
        self.module.add_function(b.finish());
    }
}
