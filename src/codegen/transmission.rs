//! Transmission of events and data along cables, and data-only transmission
//! through the nodes that propagate values without events.

use crate::codegen::builder::FunctionBuilder;
use crate::codegen::Generator;
use crate::graph::model::Cable;
use crate::ir::types::{BinOp, Operand, RtOp};
use crate::nodeclass::PortKind;

impl<'a> Generator<'a> {
    /// Transmit out of one output port: store data into each connected
    /// input (retain new, release old), set event flags, and send
    /// port-updated telemetry with a lazily computed shared summary.
    pub(crate) fn emit_transmission_from_output_port(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
        port_name: &str,
        data_ptr: Option<Operand>,
        requires_event: bool,
        should_send_telemetry: bool,
    ) {
        let cables: Vec<Cable> = self
            .composition
            .outgoing_cables(node, port_name)
            .into_iter()
            .cloned()
            .collect();
        if cables.is_empty() {
            return;
        }

        let source_type = self
            .node_class(node)
            .output_port(port_name)
            .and_then(|p| p.data_type.clone());
        let out_identifier = self.composition.port_identifier(node, port_name);

        // char *dataSummary = NULL; computed once, shared by listeners.
        let summary = b.fresh();
        b.set_into(summary, Operand::null());
        let sent_data = b.fresh();
        b.set_into(sent_data, Operand::boolean(false));

        if should_send_telemetry {
            if let (Some(data_ptr), Some(type_name)) = (&data_ptr, &source_type) {
                let out_id_op = self.intern(&out_identifier);
                let mut should =
                    b.rt(RtOp::ShouldSendPortDataTelemetry, vec![state.clone(), out_id_op]);
                for cable in cables.iter().filter(|c| c.carries_data()) {
                    let in_identifier = self
                        .composition
                        .port_identifier(cable.to_node, &cable.to_port);
                    let in_id_op = self.intern(&in_identifier);
                    let should_input = b.rt(
                        RtOp::ShouldSendPortDataTelemetry,
                        vec![state.clone(), in_id_op],
                    );
                    should = b.bin(BinOp::Or, should, should_input);
                }
                match self.adapter(type_name) {
                    Ok(adapter) => {
                        b.begin_nested();
                        match adapter.emit_summary(b, data_ptr.clone()) {
                            Ok(text) => {
                                b.set_into(summary, text);
                                b.set_into(sent_data, Operand::boolean(true));
                            }
                            Err(issue) => self.record_issue(issue),
                        }
                        let body = b.end_nested();
                        b.push_if(should, body, Vec::new());
                    }
                    Err(issue) => self.record_issue(issue),
                }
            }
            let out_id_op = self.intern(&out_identifier);
            b.rt_void(
                RtOp::SendOutputPortsUpdated,
                vec![
                    state.clone(),
                    out_id_op,
                    Operand::boolean(requires_event),
                    Operand::reg(sent_data),
                    Operand::reg(summary),
                ],
            );
        }

        for cable in &cables {
            let dest_ctx = b.rt(
                RtOp::GetNodeContext,
                vec![state.clone(), Operand::uint(self.order_index(cable.to_node))],
            );
            let Some(dest_index) =
                self.composition.port_context_index(cable.to_node, &cable.to_port)
            else {
                continue;
            };
            let dest_index = Operand::uint(dest_index as u64);

            let mut transmitted_data = false;
            if cable.carries_data()
                && let (Some(data_ptr), Some(type_name)) = (&data_ptr, &source_type)
            {
                match self.adapter(type_name) {
                    Ok(adapter) => {
                        let size = adapter.storage_size();
                        let dest_ptr = b.rt(
                            RtOp::GetPortDataPtr,
                            vec![dest_ctx.clone(), dest_index.clone()],
                        );
                        let old = b.rt(RtOp::Alloc, vec![Operand::uint(size)]);
                        b.rt_void(
                            RtOp::CopyBytes,
                            vec![old.clone(), dest_ptr.clone(), Operand::uint(size)],
                        );
                        b.rt_void(
                            RtOp::CopyBytes,
                            vec![dest_ptr.clone(), data_ptr.clone(), Operand::uint(size)],
                        );
                        if let Err(issue) = adapter.emit_retain(b, dest_ptr) {
                            self.record_issue(issue);
                        }
                        if let Err(issue) = adapter.emit_release(b, old.clone()) {
                            self.record_issue(issue);
                        }
                        b.rt_void(RtOp::Free, vec![old]);
                        transmitted_data = true;
                    }
                    Err(issue) => self.record_issue(issue),
                }
            }

            if requires_event && cable.carries_event() {
                b.rt_void(
                    RtOp::SetPortEvent,
                    vec![dest_ctx.clone(), dest_index, Operand::boolean(true)],
                );
            }

            if should_send_telemetry {
                let in_identifier = self
                    .composition
                    .port_identifier(cable.to_node, &cable.to_port);
                let in_id_op = self.intern(&in_identifier);
                let summary_operand = if transmitted_data {
                    Operand::reg(summary)
                } else {
                    Operand::null()
                };
                b.rt_void(
                    RtOp::SendInputPortsUpdated,
                    vec![
                        state.clone(),
                        in_id_op,
                        Operand::boolean(requires_event && cable.carries_event()),
                        Operand::boolean(transmitted_data),
                        summary_operand,
                    ],
                );
            }
        }
    }

    /// Transmit out of every non-trigger output port of the node. With
    /// `requires_event`, each port only transmits if it carries an event.
    pub(crate) fn emit_transmission_from_node(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
        requires_event: bool,
        should_send_telemetry: bool,
    ) {
        let class = self.node_class(node);
        let input_count = class.input_ports.len();
        let ctx = self.emit_node_get_context(b, state, node);
        let outputs: Vec<_> = class.output_ports.to_vec();
        for (offset, port) in outputs.iter().enumerate() {
            if port.kind == PortKind::Trigger {
                continue;
            }
            let port_index = (input_count + offset) as u64;
            let data_ptr = if port.data_type.is_some() {
                Some(b.rt(
                    RtOp::GetPortDataPtr,
                    vec![ctx.clone(), Operand::uint(port_index)],
                ))
            } else {
                None
            };
            if requires_event {
                let event = b.rt(
                    RtOp::GetPortEvent,
                    vec![ctx.clone(), Operand::uint(port_index)],
                );
                b.begin_nested();
                self.emit_transmission_from_output_port(
                    b,
                    state,
                    node,
                    &port.name,
                    data_ptr,
                    true,
                    should_send_telemetry,
                );
                let body = b.end_nested();
                b.push_if(event, body, Vec::new());
            } else {
                self.emit_transmission_from_output_port(
                    b,
                    state,
                    node,
                    &port.name,
                    data_ptr,
                    false,
                    should_send_telemetry,
                );
            }
        }
    }

    /// Telemetry for the published output ports whose carrier inputs saw
    /// the event, sent at top level in place of onward transmission.
    pub(crate) fn emit_published_output_telemetry(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
        ctx: &Operand,
    ) {
        let published: Vec<_> = self.composition.published_outputs.to_vec();
        for (index, port) in published.iter().enumerate() {
            let event = b.rt(
                RtOp::GetPortEvent,
                vec![ctx.clone(), Operand::uint(index as u64)],
            );
            b.begin_nested();
            let name_op = self.intern(&port.name);
            let (sent_data, summary) = match &port.type_name {
                Some(type_name) => match self.adapter(type_name) {
                    Ok(adapter) => {
                        let ptr = b.rt(
                            RtOp::GetPortDataPtr,
                            vec![ctx.clone(), Operand::uint(index as u64)],
                        );
                        match adapter.emit_summary(b, ptr) {
                            Ok(summary) => (Operand::boolean(true), summary),
                            Err(issue) => {
                                self.record_issue(issue);
                                (Operand::boolean(false), Operand::null())
                            }
                        }
                    }
                    Err(issue) => {
                        self.record_issue(issue);
                        (Operand::boolean(false), Operand::null())
                    }
                },
                None => (Operand::boolean(false), Operand::null()),
            };
            b.rt_void(
                RtOp::SendPublishedOutputPortsUpdated,
                vec![state.clone(), name_op, sent_data, summary],
            );
            let body = b.end_nested();
            b.push_if(event, body, Vec::new());
        }
    }

    /// Push data along no-event cables: walk the data-only reachable set in
    /// order, re-running each propagating node with its inputs marked and
    /// resetting the marks afterwards.
    pub(crate) fn emit_data_only_transmission_from_node(
        &mut self,
        b: &mut FunctionBuilder,
        state: &Operand,
        node: usize,
        should_wait_for_downstream: bool,
        should_update_triggers: bool,
        should_send_telemetry: bool,
    ) {
        let downstream = self.graph.data_only_downstream(node).to_vec();
        if downstream.is_empty() {
            return;
        }

        if should_wait_for_downstream {
            self.emit_wait_for_nodes(b, state.clone(), &downstream, None, true);
        }

        let mut to_visit = vec![node];
        to_visit.extend_from_slice(&downstream);
        for visited in to_visit {
            if self.graph.may_transmit_data_only(visited) {
                let ctx = self.emit_node_get_context(b, state, visited);
                let input_count = self.node_class(visited).input_ports.len();
                for index in 0..input_count {
                    b.rt_void(
                        RtOp::SetPortEvent,
                        vec![ctx.clone(), Operand::uint(index as u64), Operand::boolean(true)],
                    );
                }
                self.emit_node_function_call(b, state, visited, super::node::CallKind::Event);
                let telemetry =
                    should_send_telemetry && visited != self.graph.published_input_node();
                self.emit_transmission_from_node(b, state, visited, false, telemetry);
                self.emit_reset_node_events(b, &ctx, visited);
            }
            if visited != node {
                if should_update_triggers
                    && self.node_class(visited).functions.callback_update.is_some()
                {
                    self.emit_node_function_call(
                        b,
                        state,
                        visited,
                        super::node::CallKind::CallbackUpdate,
                    );
                }
                if should_wait_for_downstream {
                    self.emit_signal_for_nodes(b, state.clone(), &[visited]);
                }
            }
        }
    }
}
