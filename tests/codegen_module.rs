//! Shape of the emitted module: entry points, metadata, ordering, and the
//! fatal error taxonomy.

mod helpers;

use helpers::*;
use serde_json::Value as Json;
use trellis_compiler::codegen::generate_composition;
use trellis_compiler::datatype::{DataType, Lowering, TypeRegistry};
use trellis_compiler::graph::{Composition, PublishedPort};
use trellis_compiler::nodeclass::{EventThrottling, FunctionContract, NodeClass, ParamRole, PortClass};

fn small_composition() -> Composition {
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let relay = comp.add_node_with_identifier("Relay", relay_class(), "R");
    comp.add_cable(fire, "fired", relay, "value");
    comp
}

#[test]
fn top_level_module_carries_the_control_surface() {
    let registry = registry();
    let mut comp = small_composition();
    let module = compile(&mut comp, &registry);

    for entry_point in [
        "setup",
        "cleanup",
        "init",
        "fini",
        "triggerStart",
        "triggerStop",
        "setInputPortValue",
        "getInputPortValue",
        "getOutputPortValue",
        "fireTriggerPortEvent",
        "setPublishedInputPortValue",
        "firePublishedInputPortEvent",
        "getPublishedInputPortValue",
        "getPublishedOutputPortValue",
        "getPublishedInputCount",
        "getPublishedInputNames",
        "getPublishedInputTypes",
        "getPublishedInputDetails",
        "getPublishedOutputCount",
        "composition__compositionWaitForNode",
        "composition__compositionAddNodeMetadata",
        "composition__compositionCreateContextForNode",
        "composition__compositionPerformDataOnlyTransmissions",
        "composition__compositionReleasePortData",
        "composition__compositionGetPortValue",
        "composition__compositionSetPortValue",
        "composition__compositionFireTriggerPortEvent",
        "composition__compositionSetPublishedInputPortValue",
    ] {
        assert!(
            module.function(entry_point).is_some(),
            "missing entry point {entry_point}"
        );
    }

    assert_eq!(
        module.globals.get("topLevelCompositionIdentifier"),
        Some(&trellis_compiler::ir::types::GlobalValue::Str { value: "Top".into() })
    );
    assert!(module.details_json().is_some());
}

#[test]
fn subcomposition_metadata_round_trips() {
    let registry = registry();
    let mut child = Composition::new("doubler");
    child.metadata.title = "Doubler".into();
    child.metadata.description = "Adds a value to itself".into();
    child.metadata.keywords = vec!["math".into()];
    child.metadata.version = Some("1.1.0".into());
    let add = child.add_node_with_identifier("Add", add_class(), "Sum");
    let input = child.add_published_input(PublishedPort::data("in", "integer"));
    child.connect_published_input(input, add, "a");
    child.connect_published_input(input, add, "b");
    let output = child.add_published_output(PublishedPort::data("out", "integer"));
    child.connect_published_output(output, add, "sum");
    let module = compile_subcomposition(&mut child, &registry);

    let details: Json =
        serde_json::from_str(module.details_json().expect("details")).expect("valid JSON");
    assert_eq!(details["title"], "Doubler");
    assert_eq!(details["description"], "Adds a value to itself");
    assert_eq!(details["keywords"], serde_json::json!(["math"]));
    assert_eq!(details["version"], "1.1.0");
    let dependencies: Vec<String> =
        serde_json::from_value(details["dependencies"].clone()).expect("dependencies");
    assert!(dependencies.contains(&"trellis.test.add".to_string()));
    assert!(dependencies.contains(&"integer".to_string()));
    assert_eq!(details["node"]["nodes"]["Sum"], "trellis.test.add");
    assert_eq!(details["node"]["triggers"][0]["portName"], "fired");

    // Round trip: reparse of the serialized form is structurally equal.
    let reparsed: Json =
        serde_json::from_str(&details.to_string()).expect("reserialized JSON");
    assert_eq!(details, reparsed);

    insta::assert_snapshot!(details["title"].as_str().unwrap(), @"Doubler");
}

#[test]
fn per_trigger_order_embeds_in_the_global_order() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let scatter = comp.add_node_with_identifier("Relay", relay_class(), "S");
    let x = comp.add_node_with_identifier("Increment", increment_class(), "X");
    let y = comp.add_node_with_identifier("Increment", increment_class(), "Y");
    let gather = comp.add_node_with_identifier("Add", add_class(), "G");
    comp.add_cable(fire, "fired", scatter, "value");
    comp.add_cable(scatter, "out", x, "value");
    comp.add_cable(scatter, "out", y, "value");
    comp.add_cable(x, "out", gather, "a");
    comp.add_cable(y, "out", gather, "b");
    let module = compile(&mut comp, &registry);

    // Registration order is the global node order; downstream nodes of the
    // trigger must appear as a subsequence of it.
    let harness = Harness::boot(vec![module], base_symbols());
    let order: Vec<String> = harness
        .runtime
        .metadata_entries()
        .into_iter()
        .filter(|(scope, _, _)| scope == "Top")
        .map(|(_, _, entry)| entry.identifier)
        .collect();
    let position = |name: &str| {
        order
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("{name} not registered"))
    };
    assert!(position("S") < position("X"));
    assert!(position("S") < position("Y"));
    assert!(position("X") < position("G"));
    assert!(position("Y") < position("G"));
    assert!(position("G") < position("PublishedOutputs"));
}

#[test]
fn unknown_cable_port_is_fatal() {
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let relay = comp.add_node_with_identifier("Relay", relay_class(), "R");
    comp.add_cable(fire, "fired", relay, "missing");
    let error = comp.finish().expect_err("unknown port");
    assert!(error.to_string().contains("missing"));
}

#[test]
fn unsupported_lowering_is_fatal() {
    let mut registry = TypeRegistry::new();
    registry.register(DataType::new("integer", Lowering::Scalar, 8));
    // A split pair that is not exactly two words cannot be lowered.
    registry.register(DataType::new("wide", Lowering::SplitPair, 24));

    let mut class = NodeClass::new("trellis.test.wide", "Wide");
    class.input_ports.push(PortClass::data("value", "wide"));
    class.output_ports.push(PortClass::data("out", "wide"));
    class.functions.event = Some(FunctionContract::new(
        "wide_event",
        vec![
            ParamRole::InputData("value".into()),
            ParamRole::OutputData("out".into()),
            ParamRole::OutputEvent("out".into()),
        ],
    ));

    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let wide = comp.add_node("Wide", std::sync::Arc::new(class));
    comp.add_event_cable(fire, "fired", wide, "value");
    comp.finish().expect("finish");

    let error = generate_composition(&comp, &registry, true).expect_err("lowering");
    assert!(error.to_string().contains("Unsupported composition layout"));
}

#[test]
fn missing_contract_argument_is_fatal() {
    let registry = registry();
    let mut class = NodeClass::new("trellis.test.broken", "Broken");
    class.input_ports.push(PortClass::data("value", "integer"));
    // The event function references a port the class does not declare.
    class.functions.event = Some(FunctionContract::new(
        "broken_event",
        vec![
            ParamRole::InputData("value".into()),
            ParamRole::OutputData("absent".into()),
        ],
    ));

    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let broken = comp.add_node("Broken", std::sync::Arc::new(class));
    comp.add_cable(fire, "fired", broken, "value");
    comp.finish().expect("finish");

    let error = generate_composition(&comp, &registry, true).expect_err("missing contract");
    assert!(error.to_string().contains("Unsupported composition layout"));
    assert!(error.to_string().contains("absent"));
}

#[test]
fn constants_are_interned_once_per_module() {
    let registry = registry();
    let mut comp = small_composition();
    let module = compile(&mut comp, &registry);

    let interned: Vec<&String> = module
        .globals
        .iter()
        .filter_map(|(name, value)| match value {
            trellis_compiler::ir::types::GlobalValue::Str { value }
                if name.starts_with("composition__const") =>
            {
                Some(value)
            }
            _ => None,
        })
        .collect();
    let mut deduped = interned.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(interned.len(), deduped.len(), "duplicate interned constants");
}
