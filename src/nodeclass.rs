//! Node class descriptors: the capability record a compiled node module
//! exposes to the composition compiler.
//!
//! A node class declares its ports and its externally supplied entry points
//! (event, and for stateful classes init/fini and the callback trio). Entry
//! points are described by `FunctionContract`s listing each parameter's role,
//! mirroring the parameter annotations found in compiled node modules.

use serde_json::Value as Json;

/// How an input port treats incoming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBlocking {
    /// Events always flow through to the node's outputs.
    None,
    /// Events may or may not flow through, decided by the node function.
    Door,
    /// Events never flow through.
    Wall,
}

/// What a trigger does when its previous event is still being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventThrottling {
    Enqueue,
    Drop,
}

/// The flavor of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Carries only events.
    Event,
    /// Carries a data value along with events.
    DataEvent,
    /// An output port from which events originate.
    Trigger,
}

/// One port declared by a node class.
#[derive(Debug, Clone)]
pub struct PortClass {
    pub name: String,
    pub kind: PortKind,
    /// Name of the port's data type in the type registry, if it carries data.
    pub data_type: Option<String>,
    /// Event blocking, meaningful for input ports.
    pub event_blocking: EventBlocking,
    /// Throttling, meaningful for trigger ports.
    pub throttling: EventThrottling,
    /// JSON text of the port's initial value, for data input ports.
    pub initial_value: Option<String>,
    /// Display hints carried through to metadata.
    pub details: Option<Json>,
}

impl PortClass {
    pub fn data(name: &str, data_type: &str) -> Self {
        PortClass {
            name: name.to_string(),
            kind: PortKind::DataEvent,
            data_type: Some(data_type.to_string()),
            event_blocking: EventBlocking::None,
            throttling: EventThrottling::Enqueue,
            initial_value: None,
            details: None,
        }
    }

    pub fn event(name: &str) -> Self {
        PortClass {
            name: name.to_string(),
            kind: PortKind::Event,
            data_type: None,
            event_blocking: EventBlocking::None,
            throttling: EventThrottling::Enqueue,
            initial_value: None,
            details: None,
        }
    }

    pub fn trigger(name: &str, data_type: Option<&str>) -> Self {
        PortClass {
            name: name.to_string(),
            kind: PortKind::Trigger,
            data_type: data_type.map(str::to_string),
            event_blocking: EventBlocking::None,
            throttling: EventThrottling::Enqueue,
            initial_value: None,
            details: None,
        }
    }

    pub fn with_blocking(mut self, blocking: EventBlocking) -> Self {
        self.event_blocking = blocking;
        self
    }

    pub fn with_throttling(mut self, throttling: EventThrottling) -> Self {
        self.throttling = throttling;
        self
    }

    pub fn with_initial_value(mut self, json: &str) -> Self {
        self.initial_value = Some(json.to_string());
        self
    }

    pub fn carries_data(&self) -> bool {
        self.data_type.is_some()
    }
}

/// The role a parameter plays in a node class entry point, recovered from
/// the parameter annotations of the compiled node module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRole {
    /// The composition state handle (subcomposition entry points only).
    CompositionState,
    /// Current value of the named input port.
    InputData(String),
    /// Event flag of the named input port.
    InputEvent(String),
    /// Out-parameter for the named output port's value.
    OutputData(String),
    /// Out-parameter for the named output port's event flag.
    OutputEvent(String),
    /// The scheduler function of the named trigger port.
    OutputTrigger(String),
    /// The node's instance data slot.
    InstanceData,
}

/// One parameter of a node class entry point.
#[derive(Debug, Clone)]
pub struct ParamContract {
    pub role: ParamRole,
    /// Flag recorded when the node module did not lower a struct parameter
    /// the usual way; argument marshalling must pass the struct pointer
    /// through unchanged for this parameter.
    pub unlowered_struct_pointer: bool,
}

impl ParamContract {
    pub fn new(role: ParamRole) -> Self {
        ParamContract { role, unlowered_struct_pointer: false }
    }
}

/// An externally supplied entry point of a node class.
#[derive(Debug, Clone)]
pub struct FunctionContract {
    /// Symbol the emitted call resolves against.
    pub symbol: String,
    pub params: Vec<ParamContract>,
}

impl FunctionContract {
    pub fn new(symbol: &str, roles: Vec<ParamRole>) -> Self {
        FunctionContract {
            symbol: symbol.to_string(),
            params: roles.into_iter().map(ParamContract::new).collect(),
        }
    }

    /// Index of the parameter with the given role, if present.
    pub fn param_index(&self, role: &ParamRole) -> Option<usize> {
        self.params.iter().position(|p| &p.role == role)
    }
}

/// The entry points a node class provides.
#[derive(Debug, Clone, Default)]
pub struct NodeFunctions {
    pub event: Option<FunctionContract>,
    pub init: Option<FunctionContract>,
    pub fini: Option<FunctionContract>,
    pub callback_start: Option<FunctionContract>,
    pub callback_update: Option<FunctionContract>,
    pub callback_stop: Option<FunctionContract>,
}

/// A trigger port buried inside a subcomposition node class, surfaced so the
/// enclosing composition can install a scheduler for it at setup time.
#[derive(Debug, Clone)]
pub struct TriggerDescription {
    /// Index of the trigger's node in the subcomposition's global ordering.
    pub node_index: u64,
    /// Graph identifier of the trigger's node inside the subcomposition.
    pub node_identifier: String,
    /// Class of the node holding the trigger (spin-off detection key).
    pub node_class_name: String,
    pub port_name: String,
    /// Position of the trigger's port context within its node context.
    pub port_context_index: u64,
    pub data_type: Option<String>,
    pub throttling: EventThrottling,
    /// Worker function emitted into the subcomposition's module.
    pub worker_symbol: String,
    pub chain_count: u64,
    pub min_threads: i64,
    pub max_threads: i64,
}

/// A node class: ports plus capability record.
#[derive(Debug, Clone)]
pub struct NodeClass {
    pub class_name: String,
    pub default_title: String,
    pub input_ports: Vec<PortClass>,
    pub output_ports: Vec<PortClass>,
    pub functions: NodeFunctions,
    pub is_stateful: bool,
    pub is_subcomposition: bool,
    /// True for classes whose data propagates onward without an event
    /// (the published-input carrier).
    pub may_transmit_data_only: bool,
    pub trigger_descriptions: Vec<TriggerDescription>,
    pub dependencies: Vec<String>,
}

/// Class-name prefixes of triggers that spin a fresh event off an incoming
/// one; their event IDs are recorded as descendants of the original event.
pub const SPIN_OFF_CLASS_PREFIXES: &[&str] = &[
    "trellis.event.spinOff",
    "trellis.list.build",
    "trellis.list.process",
];

impl NodeClass {
    pub fn new(class_name: &str, default_title: &str) -> Self {
        NodeClass {
            class_name: class_name.to_string(),
            default_title: default_title.to_string(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            functions: NodeFunctions::default(),
            is_stateful: false,
            is_subcomposition: false,
            may_transmit_data_only: false,
            trigger_descriptions: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn is_spin_off(&self) -> bool {
        SPIN_OFF_CLASS_PREFIXES
            .iter()
            .any(|p| self.class_name.starts_with(p))
    }

    pub fn input_port(&self, name: &str) -> Option<&PortClass> {
        self.input_ports.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&PortClass> {
        self.output_ports.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_off_detection_by_class_prefix() {
        let spin = NodeClass::new("trellis.event.spinOff.value", "Spin Off Value");
        let plain = NodeClass::new("trellis.math.add", "Add");
        assert!(spin.is_spin_off());
        assert!(!plain.is_spin_off());
    }

    #[test]
    fn param_index_finds_role() {
        let contract = FunctionContract::new(
            "add_event",
            vec![
                ParamRole::InputData("a".into()),
                ParamRole::InputData("b".into()),
                ParamRole::OutputData("sum".into()),
            ],
        );
        assert_eq!(contract.param_index(&ParamRole::InputData("b".into())), Some(1));
        assert_eq!(contract.param_index(&ParamRole::InstanceData), None);
    }
}
