//! Drop-on-backpressure triggers, and retain/release balance across events.

mod helpers;

use helpers::*;
use trellis_compiler::graph::Composition;
use trellis_compiler::ir::exec::Value;
use trellis_compiler::nodeclass::{
    EventThrottling, FunctionContract, NodeClass, ParamRole, PortClass,
};

#[test]
fn dropping_trigger_drops_under_backpressure() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", fire_class(EventThrottling::Drop));
    let slow = comp.add_node_with_identifier("Slow", slow_class(), "Slow");
    comp.add_cable(fire, "fired", slow, "value");

    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());
    let scheduler = scheduler_symbol("composition", "Fire", "fired");

    // Hold the downstream node so the first worker stays in its claim,
    // keeping the trigger's throttle semaphore taken.
    let slow_context = harness.node_context("Slow");
    slow_context.semaphore.wait();

    harness.fire(&scheduler, vec![Value::Uint(1)]);
    std::thread::sleep(std::time::Duration::from_millis(50));
    harness.fire(&scheduler, vec![Value::Uint(2)]);

    assert_eq!(harness.events_dropped(), ["Fire__fired"]);

    slow_context.semaphore.signal();
    assert!(harness.wait_for_events_finished(1));
    harness.stop();

    assert_eq!(harness.events_finished(), 1);
    let slow_executions =
        harness.executions().into_iter().filter(|n| n == "Slow").count();
    assert_eq!(slow_executions, 1);
    assert_eq!(harness.input_port_value("Slow__value"), "1");
}

fn text_fire_class() -> std::sync::Arc<NodeClass> {
    let mut class = NodeClass::new("trellis.test.textFire", "Fire");
    class
        .output_ports
        .push(PortClass::trigger("fired", Some("text")).with_throttling(EventThrottling::Drop));
    std::sync::Arc::new(class)
}

fn text_sink_class() -> std::sync::Arc<NodeClass> {
    let mut class = NodeClass::new("trellis.test.textSink", "Sink");
    class.input_ports.push(PortClass::data("value", "text"));
    class.output_ports.push(PortClass::data("out", "text"));
    class.functions.event = Some(FunctionContract::new(
        "text_relay_event",
        vec![
            ParamRole::InputData("value".into()),
            ParamRole::OutputData("out".into()),
            ParamRole::OutputEvent("out".into()),
        ],
    ));
    std::sync::Arc::new(class)
}

#[test]
fn retain_counts_stay_balanced_across_events() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", text_fire_class());
    let sink = comp.add_node_with_identifier("Sink", text_sink_class(), "Sink");
    comp.add_cable(fire, "fired", sink, "value");

    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());
    let scheduler = scheduler_symbol("composition", "Fire", "fired");

    let fire_text = |text: &str, expected_finished: usize| {
        let handle = harness.runtime.heap.alloc(text.as_bytes().to_vec());
        harness.fire(&scheduler, vec![Value::Uint(handle)]);
        assert!(harness.wait_for_events_finished(expected_finished));
    };

    fire_text("first", 1);
    let live_after_first = harness.runtime.heap.live_cells();

    fire_text("second", 2);
    fire_text("third", 3);
    harness.stop();

    // Ports that were overwritten released their old values; the live set
    // is the same size after every complete event pass.
    assert_eq!(harness.runtime.heap.live_cells(), live_after_first);
    assert_eq!(harness.output_port_value("Sink__out"), "\"third\"");
}

#[test]
fn dropped_data_value_does_not_leak() {
    let registry = registry();
    let mut comp = Composition::new("composition");
    let fire = comp.add_node("Fire", text_fire_class());
    let sink = comp.add_node_with_identifier("Sink", text_sink_class(), "Sink");
    comp.add_cable(fire, "fired", sink, "value");

    let module = compile(&mut comp, &registry);
    let harness = Harness::start(vec![module], base_symbols());
    let scheduler = scheduler_symbol("composition", "Fire", "fired");

    let sink_context = harness.node_context("Sink");
    sink_context.semaphore.wait();

    let kept = harness.runtime.heap.alloc(b"kept".to_vec());
    harness.fire(&scheduler, vec![Value::Uint(kept)]);
    std::thread::sleep(std::time::Duration::from_millis(50));

    let live_before_drop = harness.runtime.heap.live_cells();
    let dropped = harness.runtime.heap.alloc(b"dropped".to_vec());
    harness.fire(&scheduler, vec![Value::Uint(dropped)]);

    // The dropped value was retained and released on the drop path.
    assert_eq!(harness.events_dropped().len(), 1);
    assert_eq!(harness.runtime.heap.live_cells(), live_before_drop);
    assert_eq!(harness.runtime.heap.refcount(dropped), None);

    sink_context.semaphore.signal();
    assert!(harness.wait_for_events_finished(1));
    harness.stop();
}
