//! Feedback: a cycle closed by a back edge makes exactly one extra pass.

mod helpers;

use helpers::*;
use trellis_compiler::graph::Composition;
use trellis_compiler::ir::exec::Value;
use trellis_compiler::nodeclass::EventThrottling;

#[test]
fn feedback_loop_makes_exactly_one_pass() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let a = comp.add_node_with_identifier("Increment", increment_class(), "A");
    let b = comp.add_node_with_identifier("Increment", increment_class(), "B");
    comp.add_cable(fire, "fired", a, "value");
    comp.add_cable(a, "out", b, "value");
    comp.add_cable(b, "out", a, "value");

    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    harness.fire(
        &scheduler_symbol("composition", "Fire", "fired"),
        vec![Value::Uint(0)],
    );
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    // A runs on entry and once more when the loop closes; B runs once.
    assert_eq!(harness.executions(), ["A", "B", "A"]);
    assert_eq!(harness.events_finished(), 1);

    // First pass: A saw 0 and emitted 1; B emitted 2 back into A; the
    // closing pass re-ran A on 2, emitting 3 toward B's input.
    assert_eq!(harness.input_port_value("A__value"), "2");
    assert_eq!(harness.input_port_value("B__value"), "3");
}

#[test]
fn feedback_loop_settles_across_repeated_fires() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Enqueue));
    let a = comp.add_node_with_identifier("Increment", increment_class(), "A");
    let b = comp.add_node_with_identifier("Increment", increment_class(), "B");
    comp.add_cable(fire, "fired", a, "value");
    comp.add_cable(a, "out", b, "value");
    comp.add_cable(b, "out", a, "value");

    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());
    let scheduler = scheduler_symbol("composition", "Fire", "fired");

    for round in 0..3 {
        harness.fire(&scheduler, vec![Value::Uint(round * 10)]);
        assert!(harness.wait_for_events_finished(round as usize + 1));
    }
    harness.stop();

    assert_eq!(harness.events_finished(), 3);
    // Each event makes one full pass and one loop-closing re-entry.
    assert_eq!(harness.executions().len(), 9);
    assert_eq!(harness.input_port_value("B__value"), "23");
}
