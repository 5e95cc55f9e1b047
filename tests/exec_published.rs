//! The published-port control surface of a top-level composition: value
//! changes serialize with fires on the published trigger's queue.

mod helpers;

use helpers::*;
use std::sync::Arc;
use trellis_compiler::graph::{Composition, PublishedPort};
use trellis_compiler::ir::exec::Value;

fn published_composition() -> Composition {
    let mut comp = Composition::new("composition");
    let inc = comp.add_node_with_identifier("Increment", increment_class(), "Inc");
    let input = comp.add_published_input(
        PublishedPort::data("in", "integer").with_initial_value("10"),
    );
    comp.connect_published_input(input, inc, "value");
    let output = comp.add_published_output(PublishedPort::data("out", "integer"));
    comp.connect_published_output(output, inc, "out");
    comp
}

#[test]
fn published_info_functions_return_declared_shape() {
    let registry = registry();
    let mut comp = published_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::boot(vec![module], base_symbols());

    let count = harness
        .executor
        .call("getPublishedInputCount", vec![])
        .expect("count");
    assert_eq!(count.as_uint().unwrap(), 1);

    let names = harness
        .executor
        .call("getPublishedInputNames", vec![])
        .expect("names");
    match names {
        Value::StrList(list) => assert_eq!(*list, vec!["in".to_string()]),
        other => panic!("expected name list, got {other:?}"),
    }

    let types = harness
        .executor
        .call("getPublishedOutputTypes", vec![])
        .expect("types");
    match types {
        Value::StrList(list) => assert_eq!(*list, vec!["integer".to_string()]),
        other => panic!("expected type list, got {other:?}"),
    }
}

#[test]
fn initial_published_input_value_propagates_at_setup() {
    let registry = registry();
    let mut comp = published_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    // The initial value was pushed along the no-event cables at setup.
    assert_eq!(harness.input_port_value("Inc__value"), "10");
    let published = harness
        .executor
        .call("getPublishedInputPortValue", vec![s("in"), Value::Uint(0)])
        .expect("published value");
    assert_eq!(published.as_str().unwrap(), "10");
    harness.stop();
}

#[test]
fn set_then_fire_published_input_runs_the_graph() {
    let registry = registry();
    let mut comp = published_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    harness
        .executor
        .call("setPublishedInputPortValue", vec![s("in"), s("41")])
        .expect("set published input");
    harness
        .executor
        .call(
            "firePublishedInputPortEvent",
            vec![Value::StrList(Arc::new(vec!["in".into()])), Value::Uint(1)],
        )
        .expect("fire published input");
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    assert_eq!(harness.executions(), ["Inc"]);
    let published = harness
        .executor
        .call("getPublishedOutputPortValue", vec![s("out"), Value::Uint(0)])
        .expect("published output");
    assert_eq!(published.as_str().unwrap(), "42");
}

#[test]
fn published_fires_are_serialized_with_value_changes() {
    let registry = registry();
    let mut comp = published_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    for round in 0..5u64 {
        harness
            .executor
            .call(
                "setPublishedInputPortValue",
                vec![s("in"), s(&round.to_string())],
            )
            .expect("set published input");
        harness
            .executor
            .call(
                "firePublishedInputPortEvent",
                vec![Value::StrList(Arc::new(vec!["in".into()])), Value::Uint(1)],
            )
            .expect("fire published input");
        assert!(harness.wait_for_events_finished(round as usize + 1));
    }
    harness.stop();

    assert_eq!(harness.events_finished(), 5);
    let published = harness
        .executor
        .call("getPublishedOutputPortValue", vec![s("out"), Value::Uint(0)])
        .expect("published output");
    assert_eq!(published.as_str().unwrap(), "5");
}
