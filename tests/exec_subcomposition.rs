//! A composition used as a node: the child module's `nodeEvent` wrapper
//! claims its wait set, fires the published-input trigger, waits for the
//! event to drain, and copies the published outputs back out.

mod helpers;

use helpers::*;
use std::sync::Arc;
use trellis_compiler::graph::{Composition, PublishedPort};
use trellis_compiler::ir::exec::Value;
use trellis_compiler::ir::parse::node_class_from_module;
use trellis_compiler::ir::types::Module;
use trellis_compiler::nodeclass::EventThrottling;

/// A subcomposition computing `out = in + 1`.
fn add_one_module() -> Module {
    let registry = registry();
    let mut child = Composition::new("addone");
    child.metadata.title = "Add One".into();
    let inc = child.add_node_with_identifier("Increment", increment_class(), "Inc");
    let input = child.add_published_input(
        PublishedPort::data("in", "integer").with_initial_value("0"),
    );
    child.connect_published_input(input, inc, "value");
    let output = child.add_published_output(PublishedPort::data("out", "integer"));
    child.connect_published_output(output, inc, "out");
    compile_subcomposition(&mut child, &registry)
}

#[test]
fn subcomposition_node_computes_through_its_wrapper() {
    let registry = registry();
    let child_module = add_one_module();
    let child_class =
        Arc::new(node_class_from_module(&child_module).expect("parse child interface"));
    assert!(child_class.is_subcomposition);

    let mut parent = Composition::new("composition");
    let fire = parent.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let add_one = parent.add_node_with_identifier("Add One", child_class, "AddOne");
    parent.add_cable(fire, "fired", add_one, "in");

    let parent_module = compile(&mut parent, &registry);
    let harness = Harness::start(vec![parent_module, child_module], base_symbols());

    harness.fire(
        &scheduler_symbol("composition", "Fire", "fired"),
        vec![Value::Uint(41)],
    );
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    assert_eq!(harness.output_port_value("AddOne__out"), "42");
    // The outer node executed once; the inner increment ran inside it.
    let executions = harness.executions();
    assert!(executions.contains(&"AddOne".to_string()));
    assert!(executions.contains(&"Inc".to_string()));
    assert_eq!(
        executions.iter().filter(|n| *n == "Inc").count(),
        1,
        "inner node runs once per outer event"
    );
}

#[test]
fn subcomposition_events_stay_paired_across_fires() {
    let registry = registry();
    let child_module = add_one_module();
    let child_class =
        Arc::new(node_class_from_module(&child_module).expect("parse child interface"));

    let mut parent = Composition::new("composition");
    let fire = parent.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let add_one = parent.add_node_with_identifier("Add One", child_class, "AddOne");
    let relay = parent.add_node_with_identifier("Relay", relay_class(), "Tail");
    parent.add_cable(fire, "fired", add_one, "in");
    parent.add_cable(add_one, "out", relay, "value");

    let parent_module = compile(&mut parent, &registry);
    let harness = Harness::start(vec![parent_module, child_module], base_symbols());
    let scheduler = scheduler_symbol("composition", "Fire", "fired");

    for round in 0..3u64 {
        harness.fire(&scheduler, vec![Value::Uint(round * 100)]);
        assert!(harness.wait_for_events_finished(round as usize + 1));
    }
    harness.stop();

    assert_eq!(harness.events_finished(), 3);
    // 200 + 1, relayed out of the subcomposition into the tail node.
    assert_eq!(harness.input_port_value("Tail__value"), "201");
    assert_eq!(
        harness.executions().iter().filter(|n| *n == "Tail").count(),
        3
    );
}

#[test]
fn child_interface_recovers_ports_from_annotations() {
    let child_module = add_one_module();
    let class = node_class_from_module(&child_module).expect("parse child interface");

    assert_eq!(class.class_name, "addone");
    assert_eq!(class.default_title, "Add One");
    assert_eq!(class.input_ports.len(), 1);
    assert_eq!(class.input_ports[0].name, "in");
    assert_eq!(class.input_ports[0].data_type.as_deref(), Some("integer"));
    assert_eq!(class.output_ports.len(), 1);
    assert_eq!(class.output_ports[0].name, "out");

    // The published trigger is surfaced for the enclosing composition.
    assert_eq!(class.trigger_descriptions.len(), 1);
    let trigger = &class.trigger_descriptions[0];
    assert_eq!(trigger.node_identifier, "PublishedInputs");
    assert_eq!(trigger.port_name, "fired");
    assert_eq!(trigger.worker_symbol, "addone__PublishedInputs__fired");
}
