//! Scatter-gather: one event forks across branches and reconverges.

mod helpers;

use helpers::*;
use trellis_compiler::graph::Composition;
use trellis_compiler::ir::exec::Value;
use trellis_compiler::nodeclass::EventThrottling;
use trellis_compiler::runtime::telemetry::TelemetryEvent;

#[test]
fn scatter_gather_converges_once() {
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
    let harness = Harness::start(vec![module], base_symbols());

    harness.fire(
        &scheduler_symbol("composition", "Fire", "fired"),
        vec![Value::Uint(5)],
    );
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    let executions = harness.executions();
    assert_eq!(executions.len(), 4);
    assert_eq!(executions[0], "S");
    assert_eq!(executions[3], "G");
    let mut middle = vec![executions[1].clone(), executions[2].clone()];
    middle.sort();
    assert_eq!(middle, ["X", "Y"]);

    // Both inputs of the gather saw the same event exactly once.
    for port in ["G__a", "G__b"] {
        let updates = harness
            .runtime
            .telemetry
            .snapshot()
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    TelemetryEvent::InputPortsUpdated { port: p, received_event: true, .. }
                        if p == port
                )
            })
            .count();
        assert_eq!(updates, 1, "updates for {port}");
    }

    assert_eq!(harness.output_port_value("G__sum"), "12");
}

#[test]
fn concurrent_triggers_through_a_shared_region_do_not_deadlock() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire_one = comp.add_node_with_identifier(
        "Fire",
        fire_class(EventThrottling::Enqueue),
        "FireOne",
    );
    let fire_two = comp.add_node_with_identifier(
        "Fire",
        fire_class(EventThrottling::Enqueue),
        "FireTwo",
    );
    let first = comp.add_node_with_identifier("Relay", relay_class(), "First");
    let second = comp.add_node_with_identifier("Relay", relay_class(), "Second");
    comp.add_cable(fire_one, "fired", first, "value");
    comp.add_cable(fire_two, "fired", first, "value");
    comp.add_cable(first, "out", second, "value");

    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());

    let rounds = 10;
    let threads: Vec<_> = ["FireOne", "FireTwo"]
        .into_iter()
        .map(|node| {
            let executor = harness.executor.clone();
            let scheduler = scheduler_symbol("composition", node, "fired");
            std::thread::spawn(move || {
                for i in 0..rounds {
                    executor
                        .call(&scheduler, vec![Value::Uint(i)])
                        .expect("fire");
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("firing thread");
    }

    assert!(harness.wait_for_events_finished(2 * rounds as usize));
    harness.stop();
    assert_eq!(harness.events_finished(), 2 * rounds as usize);
}
