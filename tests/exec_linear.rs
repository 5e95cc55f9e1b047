//! A single trigger pushing one event through a serial pipeline.

mod helpers;

use helpers::*;
use trellis_compiler::graph::Composition;
use trellis_compiler::ir::exec::Value;
use trellis_compiler::nodeclass::EventThrottling;
use trellis_compiler::runtime::telemetry::TelemetryEvent;

fn linear_composition() -> Composition {
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let a = comp.add_node_with_identifier("Relay", relay_class(), "A");
    let b = comp.add_node_with_identifier("Relay", relay_class(), "B");
    let c = comp.add_node_with_identifier("Relay", relay_class(), "C");
    comp.add_cable(fire, "fired", a, "value");
    comp.add_cable(a, "out", b, "value");
    comp.add_cable(b, "out", c, "value");
    comp
}

#[test]
fn linear_pipeline_executes_in_order() {
    let registry = registry();
    let mut comp = linear_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    harness.fire(
        &scheduler_symbol("composition", "Fire", "fired"),
        vec![Value::Uint(7)],
    );
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    assert_eq!(harness.executions(), ["A", "B", "C"]);
    assert_eq!(harness.events_finished(), 1);
    assert_eq!(harness.input_port_value("C__value"), "7");

    let finished = harness
        .runtime
        .telemetry
        .snapshot()
        .iter()
        .filter(|r| matches!(r, TelemetryEvent::NodeExecutionFinished { .. }))
        .count();
    assert_eq!(finished, 3);
}

#[test]
fn each_fire_is_a_separate_event() {
    let registry = registry();
    let mut comp = linear_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());
    let scheduler = scheduler_symbol("composition", "Fire", "fired");

    harness.fire(&scheduler, vec![Value::Uint(1)]);
    assert!(harness.wait_for_events_finished(1));
    harness.fire(&scheduler, vec![Value::Uint(2)]);
    assert!(harness.wait_for_events_finished(2));
    harness.stop();

    assert_eq!(harness.executions(), ["A", "B", "C", "A", "B", "C"]);
    assert_eq!(harness.input_port_value("C__value"), "2");
}

#[test]
fn trigger_port_value_is_readable_after_firing() {
    let registry = registry();
    let mut comp = linear_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    harness.fire(
        &scheduler_symbol("composition", "Fire", "fired"),
        vec![Value::Uint(41)],
    );
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    assert_eq!(harness.output_port_value("Fire__fired"), "41");
    assert_eq!(harness.output_port_value("A__out"), "41");
}

#[test]
fn set_input_port_value_reaches_the_port() {
    let registry = registry();
    let mut comp = linear_composition();
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    harness
        .executor
        .call("setInputPortValue", vec![s("B__value"), s("33")])
        .expect("setInputPortValue");
    assert_eq!(harness.input_port_value("B__value"), "33");
    harness.stop();
}

#[test]
fn split_pair_values_cross_the_node_boundary() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let relay = comp.add_node_with_identifier("Relay", relay_class(), "R");
    let swap = comp.add_node_with_identifier("Range Swap", range_swap_class(), "Swap");
    comp.add_cable(fire, "fired", relay, "value");
    comp.add_event_cable(relay, "out", swap, "value");
    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    harness
        .executor
        .call("setInputPortValue", vec![s("Swap__value"), s("[3,9]")])
        .expect("set range value");
    harness.fire(
        &scheduler_symbol("composition", "Fire", "fired"),
        vec![Value::Uint(0)],
    );
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    assert_eq!(harness.output_port_value("Swap__out"), "[9,3]");
}
