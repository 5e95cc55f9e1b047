//! The composition model: a directed graph of node instances whose ports are
//! connected by cables, plus published ports on the outer boundary.
//!
//! `finish()` turns a composition under construction into the form the
//! analysis and codegen passes consume: it synthesizes the published-input
//! and published-output carrier nodes, derives graph identifiers, and
//! validates cable endpoints.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::{Issue, IssueList};
use crate::nodeclass::{
    EventBlocking, FunctionContract, NodeClass, ParamRole, PortClass, PortKind,
};

/// Identifier of the outermost composition instance.
pub const TOP_LEVEL_COMPOSITION_IDENTIFIER: &str = "Top";

/// Class names of the synthesized published-port carrier nodes.
pub const PUBLISHED_INPUT_CLASS: &str = "trellis.published.in";
pub const PUBLISHED_OUTPUT_CLASS: &str = "trellis.published.out";

/// Name of the trigger port on the published-input node.
pub const PUBLISHED_INPUT_TRIGGER_NAME: &str = "fired";

#[derive(Debug, Clone, Default)]
pub struct CompositionMetadata {
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub version: Option<String>,
}

/// One node placed in a composition.
#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub title: String,
    pub class: Arc<NodeClass>,
    /// Identifier requested by the caller; collisions are fatal.
    pub explicit_identifier: Option<String>,
    /// Graph identifier derived from the title (or the explicit identifier).
    pub graphviz_identifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CableKind {
    DataAndEvent,
    EventOnly,
    /// Propagates data without generating an event.
    DataOnly,
}

#[derive(Debug, Clone)]
pub struct Cable {
    pub from_node: usize,
    pub from_port: String,
    pub to_node: usize,
    pub to_port: String,
    pub kind: CableKind,
}

impl Cable {
    pub fn carries_data(&self) -> bool {
        matches!(self.kind, CableKind::DataAndEvent | CableKind::DataOnly)
    }

    pub fn carries_event(&self) -> bool {
        matches!(self.kind, CableKind::DataAndEvent | CableKind::EventOnly)
    }
}

/// A port exposed on the composition's outer boundary.
#[derive(Debug, Clone)]
pub struct PublishedPort {
    pub name: String,
    pub type_name: Option<String>,
    pub initial_value: Option<String>,
    pub details: Option<Json>,
}

impl PublishedPort {
    pub fn data(name: &str, type_name: &str) -> Self {
        PublishedPort {
            name: name.to_string(),
            type_name: Some(type_name.to_string()),
            initial_value: None,
            details: None,
        }
    }

    pub fn event(name: &str) -> Self {
        PublishedPort {
            name: name.to_string(),
            type_name: None,
            initial_value: None,
            details: None,
        }
    }

    pub fn with_initial_value(mut self, json: &str) -> Self {
        self.initial_value = Some(json.to_string());
        self
    }
}

/// Output-port name on the published-input node carrying published input `name`.
pub fn published_input_relay_port(name: &str) -> String {
    format!("{name}Out")
}

#[derive(Debug, Clone)]
pub struct Composition {
    pub module_key: String,
    pub metadata: CompositionMetadata,
    pub nodes: Vec<NodeInstance>,
    pub cables: Vec<Cable>,
    pub published_inputs: Vec<PublishedPort>,
    pub published_outputs: Vec<PublishedPort>,
    published_input_targets: Vec<Vec<(usize, String)>>,
    published_output_sources: Vec<Vec<(usize, String)>>,
    pub published_input_node: Option<usize>,
    pub published_output_node: Option<usize>,
    pub dependencies: Vec<String>,
    finished: bool,
}

impl Composition {
    pub fn new(module_key: &str) -> Self {
        Composition {
            module_key: module_key.to_string(),
            metadata: CompositionMetadata::default(),
            nodes: Vec::new(),
            cables: Vec::new(),
            published_inputs: Vec::new(),
            published_outputs: Vec::new(),
            published_input_targets: Vec::new(),
            published_output_sources: Vec::new(),
            published_input_node: None,
            published_output_node: None,
            dependencies: Vec::new(),
            finished: false,
        }
    }

    pub fn add_node(&mut self, title: &str, class: Arc<NodeClass>) -> usize {
        self.nodes.push(NodeInstance {
            title: title.to_string(),
            class,
            explicit_identifier: None,
            graphviz_identifier: String::new(),
        });
        self.nodes.len() - 1
    }

    pub fn add_node_with_identifier(
        &mut self,
        title: &str,
        class: Arc<NodeClass>,
        identifier: &str,
    ) -> usize {
        let index = self.add_node(title, class);
        self.nodes[index].explicit_identifier = Some(identifier.to_string());
        index
    }

    pub fn add_cable(&mut self, from_node: usize, from_port: &str, to_node: usize, to_port: &str) {
        self.add_cable_of_kind(from_node, from_port, to_node, to_port, CableKind::DataAndEvent);
    }

    pub fn add_event_cable(
        &mut self,
        from_node: usize,
        from_port: &str,
        to_node: usize,
        to_port: &str,
    ) {
        self.add_cable_of_kind(from_node, from_port, to_node, to_port, CableKind::EventOnly);
    }

    pub fn add_cable_of_kind(
        &mut self,
        from_node: usize,
        from_port: &str,
        to_node: usize,
        to_port: &str,
        kind: CableKind,
    ) {
        self.cables.push(Cable {
            from_node,
            from_port: from_port.to_string(),
            to_node,
            to_port: to_port.to_string(),
            kind,
        });
    }

    pub fn add_published_input(&mut self, port: PublishedPort) -> usize {
        self.published_inputs.push(port);
        self.published_input_targets.push(Vec::new());
        self.published_inputs.len() - 1
    }

    pub fn add_published_output(&mut self, port: PublishedPort) -> usize {
        self.published_outputs.push(port);
        self.published_output_sources.push(Vec::new());
        self.published_outputs.len() - 1
    }

    pub fn connect_published_input(&mut self, published: usize, node: usize, port: &str) {
        self.published_input_targets[published].push((node, port.to_string()));
    }

    pub fn connect_published_output(&mut self, published: usize, node: usize, port: &str) {
        self.published_output_sources[published].push((node, port.to_string()));
    }

    /// Synthesize the published carrier nodes, assign graph identifiers, and
    /// validate the cable endpoints. Must be called exactly once before the
    /// composition is analyzed or compiled.
    pub fn finish(&mut self) -> Result<(), IssueList> {
        assert!(!self.finished, "composition already finished");
        self.finished = true;

        let mut issues = IssueList::new();

        self.synthesize_published_nodes();
        self.assign_identifiers(&mut issues);
        self.validate_cables(&mut issues);

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    fn synthesize_published_nodes(&mut self) {
        // Published-input carrier: one input/relay port pair per published
        // input, plus the trigger the composition's events originate from.
        let mut input_class = NodeClass::new(PUBLISHED_INPUT_CLASS, "Published Inputs");
        input_class.may_transmit_data_only = true;
        let mut event_params = Vec::new();
        for port in &self.published_inputs {
            let relay = published_input_relay_port(&port.name);
            match &port.type_name {
                Some(type_name) => {
                    let mut input = PortClass::data(&port.name, type_name)
                        .with_blocking(EventBlocking::Door);
                    input.initial_value = port.initial_value.clone();
                    input.details = port.details.clone();
                    input_class.input_ports.push(input);
                    input_class.output_ports.push(PortClass::data(&relay, type_name));
                    event_params.push(ParamRole::InputEvent(port.name.clone()));
                    event_params.push(ParamRole::InputData(port.name.clone()));
                    event_params.push(ParamRole::OutputData(relay.clone()));
                    event_params.push(ParamRole::OutputEvent(relay));
                }
                None => {
                    input_class.input_ports.push(
                        PortClass::event(&port.name).with_blocking(EventBlocking::Door),
                    );
                    input_class.output_ports.push(PortClass::event(&relay));
                    event_params.push(ParamRole::InputEvent(port.name.clone()));
                    event_params.push(ParamRole::OutputEvent(relay));
                }
            }
        }
        input_class
            .output_ports
            .push(PortClass::trigger(PUBLISHED_INPUT_TRIGGER_NAME, None));
        input_class.functions.event = Some(FunctionContract::new(
            &format!("{}__publishedInputsEvent", self.module_key),
            event_params,
        ));

        let input_node = self.add_node_with_identifier(
            "Published Inputs",
            Arc::new(input_class),
            "PublishedInputs",
        );
        self.published_input_node = Some(input_node);

        // Published-output gather node: one input port per published output.
        let mut output_class = NodeClass::new(PUBLISHED_OUTPUT_CLASS, "Published Outputs");
        for port in &self.published_outputs {
            match &port.type_name {
                Some(type_name) => {
                    let mut input = PortClass::data(&port.name, type_name)
                        .with_blocking(EventBlocking::Door);
                    input.details = port.details.clone();
                    output_class.input_ports.push(input);
                }
                None => {
                    output_class.input_ports.push(
                        PortClass::event(&port.name).with_blocking(EventBlocking::Door),
                    );
                }
            }
        }
        let output_node = self.add_node_with_identifier(
            "Published Outputs",
            Arc::new(output_class),
            "PublishedOutputs",
        );
        self.published_output_node = Some(output_node);

        // Published cables.
        let input_targets = self.published_input_targets.clone();
        for (published, targets) in input_targets.iter().enumerate() {
            let relay = published_input_relay_port(&self.published_inputs[published].name);
            for (node, port) in targets {
                self.add_cable(input_node, &relay, *node, port);
            }
        }
        let output_sources = self.published_output_sources.clone();
        for (published, sources) in output_sources.iter().enumerate() {
            let name = self.published_outputs[published].name.clone();
            for (node, port) in sources {
                self.add_cable(*node, port, output_node, &name);
            }
        }
    }

    fn assign_identifiers(&mut self, issues: &mut IssueList) {
        let mut taken: HashSet<String> = HashSet::new();
        for index in 0..self.nodes.len() {
            let identifier = match &self.nodes[index].explicit_identifier {
                Some(explicit) => {
                    if taken.contains(explicit) {
                        issues.push(
                            Issue::error(
                                "Unsupported composition layout",
                                format!("two nodes share the identifier '{explicit}'"),
                            )
                            .for_node(explicit.clone()),
                        );
                    }
                    explicit.clone()
                }
                None => {
                    let base = camel_case_identifier(&self.nodes[index].title);
                    let mut candidate = base.clone();
                    let mut suffix = 2usize;
                    while taken.contains(&candidate) {
                        candidate = format!("{base}{suffix}");
                        suffix += 1;
                    }
                    candidate
                }
            };
            taken.insert(identifier.clone());
            self.nodes[index].graphviz_identifier = identifier;
        }
    }

    fn validate_cables(&mut self, issues: &mut IssueList) {
        for cable in &self.cables {
            let from = &self.nodes[cable.from_node];
            let to = &self.nodes[cable.to_node];
            let from_port = from.class.output_port(&cable.from_port);
            let to_port = to.class.input_port(&cable.to_port);
            if from_port.is_none() {
                issues.push(
                    Issue::error(
                        "Unsupported composition layout",
                        format!(
                            "cable references unknown output port '{}' on class {}",
                            cable.from_port, from.class.class_name
                        ),
                    )
                    .for_node(from.graphviz_identifier.clone()),
                );
            }
            if to_port.is_none() {
                issues.push(
                    Issue::error(
                        "Unsupported composition layout",
                        format!(
                            "cable references unknown input port '{}' on class {}",
                            cable.to_port, to.class.class_name
                        ),
                    )
                    .for_node(to.graphviz_identifier.clone()),
                );
            }
            if let (Some(from_port), Some(to_port)) = (from_port, to_port)
                && cable.carries_data()
                && from_port.data_type != to_port.data_type
            {
                issues.push(
                    Issue::error(
                        "Unsupported composition layout",
                        format!(
                            "cable connects mismatched types {:?} -> {:?}",
                            from_port.data_type, to_port.data_type
                        ),
                    )
                    .for_node(from.graphviz_identifier.clone()),
                );
            }
        }
    }

    /// All ports of a node, inputs first — the node's port-context order.
    pub fn node_ports(&self, node: usize) -> Vec<&PortClass> {
        let class = &self.nodes[node].class;
        class.input_ports.iter().chain(class.output_ports.iter()).collect()
    }

    /// Position of the named port within the node's port contexts.
    pub fn port_context_index(&self, node: usize, port_name: &str) -> Option<usize> {
        self.node_ports(node).iter().position(|p| p.name == port_name)
    }

    pub fn node_identifier(&self, node: usize) -> &str {
        &self.nodes[node].graphviz_identifier
    }

    /// The stable port identifier: `nodeIdentifier__portName`.
    pub fn port_identifier(&self, node: usize, port_name: &str) -> String {
        format!("{}__{}", self.node_identifier(node), port_name)
    }

    pub fn is_stateful(&self) -> bool {
        self.nodes.iter().any(|n| n.class.is_stateful)
    }

    /// Cables leaving the given output port.
    pub fn outgoing_cables(&self, node: usize, port_name: &str) -> Vec<&Cable> {
        self.cables
            .iter()
            .filter(|c| c.from_node == node && c.from_port == port_name)
            .collect()
    }

    /// Input port on the published-input node for published input `index`.
    pub fn input_port_on_published_input_node(&self, index: usize) -> &str {
        &self.published_inputs[index].name
    }

    /// Input port on the published-output node for published output `index`.
    pub fn input_port_on_published_output_node(&self, index: usize) -> &str {
        &self.published_outputs[index].name
    }
}

/// Derive a graph identifier from a node title: camel-cased chunks of
/// alphanumerics, leading digit guarded.
pub fn camel_case_identifier(title: &str) -> String {
    let mut out = String::new();
    for chunk in title.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = chunk.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    if out.is_empty() {
        out.push_str("Node");
    } else if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert_str(0, "Node");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_strips_punctuation() {
        assert_eq!(camel_case_identifier("Count within Range"), "CountWithinRange");
        assert_eq!(camel_case_identifier("blend images (v2)"), "BlendImagesV2");
        assert_eq!(camel_case_identifier("3D Object"), "Node3DObject");
        assert_eq!(camel_case_identifier("---"), "Node");
    }

    #[test]
    fn duplicate_titles_are_disambiguated() {
        let class = Arc::new(NodeClass::new("trellis.test.hold", "Hold"));
        let mut comp = Composition::new("composition");
        let a = comp.add_node("Hold", class.clone());
        let b = comp.add_node("Hold", class);
        comp.finish().expect("finish");
        assert_eq!(comp.node_identifier(a), "Hold");
        assert_eq!(comp.node_identifier(b), "Hold2");
    }

    #[test]
    fn explicit_identifier_collision_is_fatal() {
        let class = Arc::new(NodeClass::new("trellis.test.hold", "Hold"));
        let mut comp = Composition::new("composition");
        comp.add_node_with_identifier("Hold", class.clone(), "X");
        comp.add_node_with_identifier("Hold", class, "X");
        let err = comp.finish().expect_err("collision");
        assert_eq!(err.len(), 1);
    }

    #[test]
    fn finish_synthesizes_published_nodes() {
        let mut comp = Composition::new("composition");
        comp.add_published_input(PublishedPort::data("in", "integer"));
        comp.finish().expect("finish");
        let node = comp.published_input_node.expect("published input node");
        assert_eq!(comp.node_identifier(node), "PublishedInputs");
        // input port, relay output, trigger
        assert_eq!(comp.node_ports(node).len(), 3);
        assert_eq!(comp.port_context_index(node, "fired"), Some(2));
        assert!(comp.published_output_node.is_some());
    }
}
