//! Per-node emission: context creation, metadata registration, calls into
//! the node class's entry points with full argument marshalling, and the
//! execute/transmit functions chains are built from.

use crate::codegen::builder::FunctionBuilder;
use crate::codegen::Generator;
use crate::error::Issue;
use crate::ir::types::{BinOp, Operand, RtOp};
use crate::nodeclass::{EventThrottling, FunctionContract, NodeClass, ParamRole, PortKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Event,
    Init,
    Fini,
    CallbackStart,
    CallbackUpdate,
    CallbackStop,
}

enum PostCall {
    OutputData { ptr: Operand, old: Operand, type_name: String },
    OutputEvent { port_index: u64, cell: Operand },
    InstanceData { ptr: Operand, old: Operand },
}

impl<'a> Generator<'a> {
    pub(crate) fn node_class(&self, node: usize) -> &'a NodeClass {
        &self.composition.nodes[node].class
    }

    pub(crate) fn node_contract(
        &self,
        node: usize,
        kind: CallKind,
    ) -> Option<&'a FunctionContract> {
        let functions = &self.node_class(node).functions;
        match kind {
            CallKind::Event => functions.event.as_ref(),
            CallKind::Init => functions.init.as_ref(),
            CallKind::Fini => functions.fini.as_ref(),
            CallKind::CallbackStart => functions.callback_start.as_ref(),
            CallKind::CallbackUpdate => functions.callback_update.as_ref(),
            CallKind::CallbackStop => functions.callback_stop.as_ref(),
        }
    }

    pub(crate) fn emit_node_get_context(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
    ) -> Operand {
        b.rt(
            RtOp::GetNodeContext,
            vec![state.clone(), Operand::uint(self.order_index(node))],
        )
    }

    /// `"parent/child"` identifier of a subcomposition node, built at run
    /// time from the enclosing state's identifier.
    pub(crate) fn emit_subcomposition_identifier(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
    ) -> Operand {
        let parent = b.rt(RtOp::GetStateIdentifier, vec![state.clone()]);
        let with_slash = b.bin(BinOp::Concat, parent, Operand::str("/"));
        let node_id = self.composition.node_identifier(node).to_string();
        b.bin(BinOp::Concat, with_slash, Operand::str(node_id))
    }

    /// Allocate the node context and one port context per port; triggers get
    /// a named serial queue and, when dropping, a throttle semaphore.
    pub(crate) fn emit_node_create_context(
        &mut self,
        b: &mut FunctionBuilder,
        node: usize,
    ) -> Operand {
        let class = self.node_class(node);
        let output_event_count = if class.is_subcomposition {
            class
                .output_ports
                .iter()
                .filter(|p| p.kind != PortKind::Trigger)
                .count() as u64
        } else {
            0
        };
        let ctx = b.rt(
            RtOp::NewNodeContext,
            vec![
                Operand::boolean(class.is_stateful),
                Operand::uint(output_event_count),
            ],
        );
        let ports: Vec<_> = self
            .composition
            .node_ports(node)
            .into_iter()
            .cloned()
            .collect();
        for port in &ports {
            let is_trigger = port.kind == PortKind::Trigger;
            let data_size = self.port_data_size(port.data_type.as_deref());
            let queue = if is_trigger {
                let identifier = self.composition.port_identifier(node, &port.name);
                Operand::str(format!("org.trellis.composition.{identifier}"))
            } else {
                Operand::null()
            };
            let can_drop = is_trigger && port.throttling == EventThrottling::Drop;
            b.rt_void(
                RtOp::AddPortContext,
                vec![
                    ctx.clone(),
                    Operand::boolean(is_trigger),
                    Operand::uint(data_size),
                    queue,
                    Operand::boolean(can_drop),
                ],
            );
        }
        ctx
    }

    /// Register the node's identity, callbacks, and per-port metadata;
    /// recurse into subcomposition nodes.
    pub(crate) fn emit_node_add_metadata(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
    ) {
        let identifier = self.composition.node_identifier(node).to_string();
        let identifier_op = self.intern(&identifier);
        b.rt_void(
            RtOp::AddNodeMetadata,
            vec![
                state.clone(),
                identifier_op,
                Operand::func(self.qualified("compositionCreateContextForNode")),
                Operand::func(self.qualified("compositionSetPortValue")),
                Operand::func(self.qualified("compositionGetPortValue")),
                Operand::func(self.qualified("compositionFireTriggerPortEvent")),
                Operand::func(self.qualified("compositionReleasePortData")),
            ],
        );

        let ports: Vec<_> = self
            .composition
            .node_ports(node)
            .into_iter()
            .cloned()
            .collect();
        for port in &ports {
            let port_identifier = self.composition.port_identifier(node, &port.name);
            let type_index = port
                .data_type
                .as_deref()
                .map(|t| self.type_index(t))
                .unwrap_or(u64::MAX);
            let initial = match (&port.initial_value, port.data_type.as_deref()) {
                (Some(value), _) => value.clone(),
                (None, Some(type_name)) => self
                    .types
                    .get(type_name)
                    .map(|t| t.default_json.clone())
                    .unwrap_or_default(),
                (None, None) => String::new(),
            };
            let port_identifier_op = self.intern(&port_identifier);
            let port_name_op = self.intern(&port.name);
            let initial_op = self.intern(&initial);
            b.rt_void(
                RtOp::AddPortMetadata,
                vec![
                    state.clone(),
                    port_identifier_op,
                    port_name_op,
                    Operand::uint(type_index),
                    initial_op,
                ],
            );
        }

        let class = self.node_class(node);
        if class.is_subcomposition {
            let child_key = class.class_name.clone();
            let child_identifier = self.emit_subcomposition_identifier(b, state, node);
            let child_state = b.rt(RtOp::CreateCompositionState, vec![child_identifier]);
            b.call_void(
                &format!("{child_key}__compositionAddNodeMetadata"),
                vec![child_state],
            );
        }
    }

    /// Build the argument vector for one of the node class's entry points,
    /// call it, and balance events, data ownership, and instance data
    /// around the call.
    pub(crate) fn emit_node_function_call(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
        kind: CallKind,
    ) {
        let Some(contract) = self.node_contract(node, kind) else {
            return;
        };
        let class = self.node_class(node);
        let ctx = self.emit_node_get_context(b, state, node);

        let mut args: Vec<Operand> = Vec::new();
        let mut posts: Vec<PostCall> = Vec::new();

        for param in &contract.params {
            match &param.role {
                ParamRole::CompositionState => {
                    let call_state = if class.is_subcomposition {
                        let identifier = self.emit_subcomposition_identifier(b, state, node);
                        b.rt(RtOp::CreateCompositionState, vec![identifier])
                    } else {
                        state.clone()
                    };
                    args.push(call_state);
                }
                ParamRole::InputEvent(port) => {
                    let Some(index) = self.port_index_or_issue(node, port, contract) else {
                        return;
                    };
                    args.push(b.rt(
                        RtOp::GetPortEvent,
                        vec![ctx.clone(), Operand::uint(index)],
                    ));
                }
                ParamRole::InputData(port) => {
                    let Some(index) = self.port_index_or_issue(node, port, contract) else {
                        return;
                    };
                    let Some(type_name) = self.port_type_or_issue(node, port, contract) else {
                        return;
                    };
                    let adapter = match self.adapter(&type_name) {
                        Ok(adapter) => adapter,
                        Err(issue) => return self.record_issue(issue),
                    };
                    let ptr = b.rt(
                        RtOp::GetPortDataPtr,
                        vec![ctx.clone(), Operand::uint(index)],
                    );
                    match adapter.convert_port_data_to_args(
                        b,
                        ptr,
                        param.unlowered_struct_pointer,
                    ) {
                        Ok(lowered) => args.extend(lowered),
                        Err(issue) => return self.record_issue(issue),
                    }
                }
                ParamRole::OutputData(port) => {
                    let Some(index) = self.port_index_or_issue(node, port, contract) else {
                        return;
                    };
                    let Some(type_name) = self.port_type_or_issue(node, port, contract) else {
                        return;
                    };
                    let size = self.port_data_size(Some(&type_name));
                    let ptr = b.rt(
                        RtOp::GetPortDataPtr,
                        vec![ctx.clone(), Operand::uint(index)],
                    );
                    let old = b.rt(RtOp::Alloc, vec![Operand::uint(size)]);
                    b.rt_void(
                        RtOp::CopyBytes,
                        vec![old.clone(), ptr.clone(), Operand::uint(size)],
                    );
                    args.push(ptr.clone());
                    posts.push(PostCall::OutputData { ptr, old, type_name });
                }
                ParamRole::OutputEvent(port) => {
                    let Some(index) = self.port_index_or_issue(node, port, contract) else {
                        return;
                    };
                    let cell = b.rt(RtOp::Alloc, vec![Operand::uint(8)]);
                    b.rt_void(
                        RtOp::StoreWord,
                        vec![cell.clone(), Operand::uint(0), Operand::uint(0)],
                    );
                    args.push(cell.clone());
                    posts.push(PostCall::OutputEvent { port_index: index, cell });
                }
                ParamRole::OutputTrigger(port) => {
                    let Some(index) = self.port_index_or_issue(node, port, contract) else {
                        return;
                    };
                    args.push(b.rt(
                        RtOp::GetPortTriggerFunction,
                        vec![ctx.clone(), Operand::uint(index)],
                    ));
                }
                ParamRole::InstanceData => {
                    let ptr = b.rt(RtOp::GetInstanceDataPtr, vec![ctx.clone()]);
                    let old = b.rt(RtOp::Alloc, vec![Operand::uint(8)]);
                    b.rt_void(
                        RtOp::CopyBytes,
                        vec![old.clone(), ptr.clone(), Operand::uint(8)],
                    );
                    args.push(ptr.clone());
                    posts.push(PostCall::InstanceData { ptr, old });
                }
            }
        }

        // Announce the composition this node runs in for the duration of
        // the call, without widening the node ABI.
        b.rt_void(RtOp::AddStateToThreadLocal, vec![state.clone()]);
        let result = b.call(&contract.symbol, args);
        b.rt_void(RtOp::RemoveStateFromThreadLocal, vec![]);

        if kind == CallKind::Init {
            let ptr = b.rt(RtOp::GetInstanceDataPtr, vec![ctx.clone()]);
            b.rt_void(RtOp::StoreWord, vec![ptr.clone(), Operand::uint(0), result]);
            b.rt_void(RtOp::Retain, vec![ptr]);
        }

        for post in posts {
            match post {
                PostCall::OutputData { ptr, old, type_name } => {
                    let adapter = match self.adapter(&type_name) {
                        Ok(adapter) => adapter,
                        Err(issue) => return self.record_issue(issue),
                    };
                    if let Err(issue) = adapter.emit_retain(b, ptr) {
                        return self.record_issue(issue);
                    }
                    if let Err(issue) = adapter.emit_release(b, old.clone()) {
                        return self.record_issue(issue);
                    }
                    b.rt_void(RtOp::Free, vec![old]);
                }
                PostCall::OutputEvent { port_index, cell } => {
                    let value = b.rt(RtOp::LoadWord, vec![cell.clone(), Operand::uint(0)]);
                    let flag = b.bin(BinOp::Ne, value, Operand::uint(0));
                    b.rt_void(
                        RtOp::SetPortEvent,
                        vec![ctx.clone(), Operand::uint(port_index), flag],
                    );
                    b.rt_void(RtOp::Free, vec![cell]);
                }
                PostCall::InstanceData { ptr, old } => {
                    if kind == CallKind::Fini {
                        b.rt_void(RtOp::Release, vec![ptr.clone()]);
                        b.rt_void(
                            RtOp::StoreWord,
                            vec![ptr, Operand::uint(0), Operand::uint(0)],
                        );
                    } else {
                        b.rt_void(RtOp::Retain, vec![ptr]);
                        b.rt_void(RtOp::Release, vec![old.clone()]);
                    }
                    b.rt_void(RtOp::Free, vec![old]);
                }
            }
        }
    }

    fn port_index_or_issue(
        &mut self,
        node: usize,
        port: &str,
        contract: &FunctionContract,
    ) -> Option<u64> {
        match self.composition.port_context_index(node, port) {
            Some(index) => Some(index as u64),
            None => {
                let node_id = self.composition.node_identifier(node).to_string();
                self.record_issue(
                    Issue::error(
                        "Unsupported composition layout",
                        format!(
                            "function {} references port '{port}' that the node class lacks",
                            contract.symbol
                        ),
                    )
                    .for_node(node_id),
                );
                None
            }
        }
    }

    fn port_type_or_issue(
        &mut self,
        node: usize,
        port: &str,
        contract: &FunctionContract,
    ) -> Option<String> {
        let class = self.node_class(node);
        let port_class = class
            .input_port(port)
            .or_else(|| class.output_port(port))?;
        match &port_class.data_type {
            Some(type_name) => Some(type_name.clone()),
            None => {
                let node_id = self.composition.node_identifier(node).to_string();
                self.record_issue(
                    Issue::error(
                        "Unsupported composition layout",
                        format!(
                            "function {} expects data on event-only port '{port}'",
                            contract.symbol
                        ),
                    )
                    .for_node(node_id),
                );
                None
            }
        }
    }

    /// The per-chain gate: did any input port record an event? If so, run
    /// the node. Returns the emitted function's symbol.
    pub(crate) fn node_execute_fn(&mut self, node: usize) -> String {
        if let Some(name) = self.execute_fns.get(&node) {
            return name.clone();
        }
        let node_id = self.composition.node_identifier(node).to_string();
        let name = self.qualified(&format!("{node_id}__execute"));
        self.execute_fns.insert(node, name.clone());

        let mut b = FunctionBuilder::new(&name, 3);
        let state = b.param(0);
        let event_id = b.param(1);
        let chain_index = b.param(2);

        let ctx = self.emit_node_get_context(&mut b, &state, node);
        let class = self.node_class(node);

        let is_hit = b.fresh();
        b.set_into(is_hit, Operand::boolean(false));
        for index in 0..class.input_ports.len() {
            let event = b.rt(
                RtOp::GetPortEvent,
                vec![ctx.clone(), Operand::uint(index as u64)],
            );
            let merged = b.bin(BinOp::Or, Operand::reg(is_hit), event);
            b.set_into(is_hit, merged);
        }

        if node == self.graph.published_output_node() {
            if self.is_top_level {
                b.rt_void(RtOp::SendEventFinished, vec![state.clone(), event_id]);
            } else {
                let composition_ctx = b.rt(RtOp::GetCompositionContext, vec![state.clone()]);
                for published in 0..self.composition.published_outputs.len() {
                    let port_hit = b.rt(
                        RtOp::GetPortEvent,
                        vec![ctx.clone(), Operand::uint(published as u64)],
                    );
                    b.rt_void(
                        RtOp::SetOutputEvent,
                        vec![
                            composition_ctx.clone(),
                            Operand::uint(published as u64),
                            port_hit,
                        ],
                    );
                }
                // If this completes the last tracked event, release the
                // wrapper waiting in nodeEvent(); otherwise let the
                // remaining events claim this node.
                let finished = b.rt(
                    RtOp::FinishedExecutingEvent,
                    vec![composition_ctx.clone(), event_id],
                );
                b.begin_nested();
                let group = b.rt(RtOp::GetExecutingGroup, vec![composition_ctx.clone()]);
                b.rt_void(RtOp::LeaveGroup, vec![group]);
                let then_body = b.end_nested();
                b.begin_nested();
                b.rt_void(
                    RtOp::SetClaimingEventId,
                    vec![ctx.clone(), Operand::uint(crate::ir::types::NO_EVENT_ID)],
                );
                b.rt_void(RtOp::NodeSemaphoreSignal, vec![ctx.clone()]);
                let else_body = b.end_nested();
                b.push_if(finished, then_body, else_body);
            }
            b.ret(Some(Operand::reg(is_hit)));
            self.module.add_function(b.finish());
            return name;
        }

        let is_subcomposition = class.is_subcomposition;
        let send_telemetry = node != self.graph.published_input_node();
        let identifier_op = self.intern(&node_id);

        b.begin_nested();
        if is_subcomposition {
            b.rt_void(RtOp::StartedExecutingEvent, vec![ctx.clone(), event_id.clone()]);
            let sub_identifier = self.emit_subcomposition_identifier(&mut b, &state, node);
            b.rt_void(
                RtOp::GrantThreadsToSubcomposition,
                vec![state.clone(), event_id.clone(), chain_index, sub_identifier],
            );
        }
        if send_telemetry {
            b.rt_void(
                RtOp::SendNodeExecutionStarted,
                vec![state.clone(), identifier_op.clone()],
            );
        }
        self.emit_node_function_call(&mut b, &state, node, CallKind::Event);
        if send_telemetry {
            b.rt_void(
                RtOp::SendNodeExecutionFinished,
                vec![state.clone(), identifier_op],
            );
        }
        let hit_body = b.end_nested();
        b.push_if(Operand::reg(is_hit), hit_body, Vec::new());

        b.ret(Some(Operand::reg(is_hit)));
        self.module.add_function(b.finish());
        name
    }

    /// Transmit data and events out of the node once it has executed, then
    /// clear its event flags. Returns the emitted function's symbol.
    pub(crate) fn node_transmit_fn(&mut self, node: usize) -> String {
        if let Some(name) = self.transmit_fns.get(&node) {
            return name.clone();
        }
        let node_id = self.composition.node_identifier(node).to_string();
        let name = self.qualified(&format!("{node_id}__transmit"));
        self.transmit_fns.insert(node, name.clone());

        let mut b = FunctionBuilder::new(&name, 2);
        let state = b.param(0);
        let is_hit = b.param(1);

        b.begin_nested();
        let ctx = self.emit_node_get_context(&mut b, &state, node);
        if node == self.graph.published_output_node() {
            if self.is_top_level {
                self.emit_published_output_telemetry(&mut b, &state, node, &ctx);
            }
        } else {
            self.emit_transmission_from_node(&mut b, &state, node, true, true);
        }
        self.emit_reset_node_events(&mut b, &ctx, node);
        let hit_body = b.end_nested();
        b.push_if(is_hit, hit_body, Vec::new());

        b.ret(None);
        self.module.add_function(b.finish());
        name
    }

    pub(crate) fn emit_reset_node_events(
        &mut self,
        b: &mut FunctionBuilder,
        ctx: &Operand,
        node: usize,
    ) {
        let port_count = self.composition.node_ports(node).len();
        for index in 0..port_count {
            b.rt_void(
                RtOp::SetPortEvent,
                vec![ctx.clone(), Operand::uint(index as u64), Operand::boolean(false)],
            );
        }
    }

    /// The event function of the published-input carrier: for each pair of
    /// published input and relay port, copy data and event through when the
    /// input saw the event.
    pub(crate) fn emit_published_inputs_event(&mut self) {
        let node = self.graph.published_input_node();
        let class = self.node_class(node);
        let Some(contract) = class.functions.event.clone() else {
            return;
        };

        // Physical parameter layout, expanding lowered data parameters.
        let mut physical: Vec<(ParamRole, u32, u32, bool)> = Vec::new();
        let mut param_count: u32 = 0;
        let mut annotations: Vec<Vec<String>> = Vec::new();
        for param in &contract.params {
            let (count, type_name) = match &param.role {
                ParamRole::InputData(port) => {
                    let type_name = class
                        .input_port(port)
                        .and_then(|p| p.data_type.clone());
                    let count = match type_name
                        .as_deref()
                        .and_then(|t| self.types.get(t))
                    {
                        Some(ty) => crate::datatype::adapter::TypeAdapter::new(ty)
                            .lowered_param_count(param.unlowered_struct_pointer),
                        None => 1,
                    };
                    (count, type_name)
                }
                ParamRole::OutputData(port) => (
                    1,
                    class.output_port(port).and_then(|p| p.data_type.clone()),
                ),
                _ => (1, None),
            };
            physical.push((param.role.clone(), param_count, count, param.unlowered_struct_pointer));
            let annotation =
                crate::ir::parse::annotate_role(&param.role, type_name.as_deref());
            for _ in 0..count {
                annotations.push(annotation.clone());
            }
            param_count += count;
        }

        let mut b = FunctionBuilder::new(&contract.symbol, param_count);
        b.set_annotations(annotations);

        // Group the physical params by published input.
        let published_inputs = self.composition.published_inputs.clone();
        for published in &published_inputs {
            let relay = crate::graph::model::published_input_relay_port(&published.name);
            let find = |role: &ParamRole| {
                physical
                    .iter()
                    .find(|(r, _, _, _)| r == role)
                    .map(|(_, start, count, unlowered)| (*start, *count, *unlowered))
            };
            let Some((event_reg, _, _)) = find(&ParamRole::InputEvent(published.name.clone()))
            else {
                continue;
            };
            let out_event = find(&ParamRole::OutputEvent(relay.clone()));
            let in_data = find(&ParamRole::InputData(published.name.clone()));
            let out_data = find(&ParamRole::OutputData(relay.clone()));

            b.begin_nested();
            if let (Some((data_start, data_count, unlowered)), Some((out_reg, _, _))) =
                (in_data, out_data)
                && let Some(type_name) = &published.type_name
            {
                match self.adapter(type_name) {
                    Ok(adapter) => {
                        let args: Vec<Operand> = (data_start..data_start + data_count)
                            .map(Operand::reg)
                            .collect();
                        if let Err(issue) = adapter.convert_call_args_to_port_data(
                            &mut b,
                            &args,
                            unlowered,
                            Operand::reg(out_reg),
                        ) {
                            self.record_issue(issue);
                        }
                    }
                    Err(issue) => self.record_issue(issue),
                }
            }
            if let Some((out_event_reg, _, _)) = out_event {
                b.rt_void(
                    RtOp::StoreWord,
                    vec![Operand::reg(out_event_reg), Operand::uint(0), Operand::uint(1)],
                );
            }
            let body = b.end_nested();
            b.push_if(Operand::reg(event_reg), body, Vec::new());
        }

        b.ret(None);
        self.module.add_function(b.finish());
    }
}
