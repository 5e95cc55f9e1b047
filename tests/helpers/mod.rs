//! Shared fixtures: the test type registry, a small library of node
//! classes with native entry points, and the harness that compiles a
//! composition and runs the emitted module through the stub runtime.

use std::sync::Arc;
use std::time::Duration;

use trellis_compiler::codegen::generate_composition;
use trellis_compiler::datatype::{DataType, Lowering, TypeRegistry};
use trellis_compiler::graph::Composition;
use trellis_compiler::ir::exec::{Executor, SymbolTable, Value};
use trellis_compiler::ir::types::Module;
use trellis_compiler::nodeclass::{
    EventThrottling, FunctionContract, NodeClass, ParamRole, PortClass,
};
use trellis_compiler::runtime::telemetry::TelemetryEvent;
use trellis_compiler::runtime::{NodeContext, RuntimeState};

pub fn s(value: &str) -> Value {
    Value::Str(Arc::from(value))
}

// =============================================================================
// Data types
// =============================================================================

pub fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.register(DataType::new("integer", Lowering::Scalar, 8).with_default_json("0"));
    registry.register(
        DataType::new("text", Lowering::Scalar, 8)
            .with_retain_release()
            .with_interprocess()
            .with_default_json("\"\""),
    );
    registry.register(
        DataType::new("range", Lowering::SplitPair, 16).with_default_json("[0,0]"),
    );
    registry
}

fn register_type_functions(symbols: &mut SymbolTable) {
    symbols.register("integer_makeFromJson", |_, args| {
        let value: i64 = serde_json::from_str(args[0].as_str()?).unwrap_or(0);
        args[1].as_ptr()?.store_word(0, value as u64)?;
        Ok(Value::Void)
    });
    symbols.register("integer_getJson", |_, args| {
        Ok(s(&(args[0].as_uint()? as i64).to_string()))
    });
    symbols.register("integer_getSummary", |_, args| {
        Ok(s(&(args[0].as_uint()? as i64).to_string()))
    });

    symbols.register("range_makeFromJson", |_, args| {
        let values: Vec<i64> = serde_json::from_str(args[0].as_str()?).unwrap_or_default();
        let low = values.first().copied().unwrap_or(0) as u64;
        let high = values.get(1).copied().unwrap_or(0) as u64;
        let ptr = args[1].as_ptr()?;
        ptr.store_word(0, low)?;
        ptr.store_word(8, high)?;
        Ok(Value::Void)
    });
    symbols.register("range_getJson", |_, args| {
        let low = args[0].as_uint()? as i64;
        let high = args[1].as_uint()? as i64;
        Ok(s(&format!("[{low},{high}]")))
    });
    symbols.register("range_getSummary", |_, args| {
        let low = args[0].as_uint()? as i64;
        let high = args[1].as_uint()? as i64;
        Ok(s(&format!("{low} through {high}")))
    });

    symbols.register("text_makeFromJson", |api, args| {
        let value: String = serde_json::from_str(args[0].as_str()?).unwrap_or_default();
        let handle = api.heap().alloc(value.into_bytes());
        args[1].as_ptr()?.store_word(0, handle)?;
        Ok(Value::Void)
    });
    symbols.register("text_getJson", |api, args| {
        let bytes = api.heap().bytes(args[0].as_uint()?).unwrap_or_default();
        Ok(s(&serde_json::to_string(&String::from_utf8_lossy(&bytes)).unwrap()))
    });
    symbols.register("text_getInterprocessJson", |api, args| {
        let bytes = api.heap().bytes(args[0].as_uint()?).unwrap_or_default();
        Ok(s(&serde_json::to_string(&String::from_utf8_lossy(&bytes)).unwrap()))
    });
    symbols.register("text_getSummary", |api, args| {
        let bytes = api.heap().bytes(args[0].as_uint()?).unwrap_or_default();
        Ok(s(&String::from_utf8_lossy(&bytes)))
    });
    symbols.register("text_retain", |api, args| {
        api.heap().retain(args[0].as_uint()?);
        Ok(Value::Void)
    });
    symbols.register("text_release", |api, args| {
        api.heap().release(args[0].as_uint()?);
        Ok(Value::Void)
    });
}

// =============================================================================
// Node classes
// =============================================================================

/// A node holding one integer trigger port, fired by calling its scheduler.
pub fn fire_class(throttling: EventThrottling) -> Arc<NodeClass> {
    let mut class = NodeClass::new("trellis.test.fire", "Fire");
    class
        .output_ports
        .push(PortClass::trigger("fired", Some("integer")).with_throttling(throttling));
    Arc::new(class)
}

fn relay_shaped_class(class_name: &str, title: &str, symbol: &str) -> NodeClass {
    let mut class = NodeClass::new(class_name, title);
    class.input_ports.push(PortClass::data("value", "integer"));
    class.output_ports.push(PortClass::data("out", "integer"));
    class.functions.event = Some(FunctionContract::new(
        symbol,
        vec![
            ParamRole::InputData("value".into()),
            ParamRole::OutputData("out".into()),
            ParamRole::OutputEvent("out".into()),
        ],
    ));
    class
}

pub fn relay_class() -> Arc<NodeClass> {
    Arc::new(relay_shaped_class("trellis.test.relay", "Relay", "relay_event"))
}

pub fn increment_class() -> Arc<NodeClass> {
    Arc::new(relay_shaped_class("trellis.test.increment", "Increment", "increment_event"))
}

pub fn slow_class() -> Arc<NodeClass> {
    Arc::new(relay_shaped_class("trellis.test.slow", "Slow", "slow_event"))
}

/// Gather node: `sum = a + b`.
pub fn add_class() -> Arc<NodeClass> {
    let mut class = NodeClass::new("trellis.test.add", "Add");
    class.input_ports.push(PortClass::data("a", "integer"));
    class.input_ports.push(PortClass::data("b", "integer"));
    class.output_ports.push(PortClass::data("sum", "integer"));
    class.functions.event = Some(FunctionContract::new(
        "add_event",
        vec![
            ParamRole::InputData("a".into()),
            ParamRole::InputData("b".into()),
            ParamRole::OutputData("sum".into()),
            ParamRole::OutputEvent("sum".into()),
        ],
    ));
    Arc::new(class)
}

/// Text passthrough, exercising the reference-counted type.
pub fn text_relay_class() -> Arc<NodeClass> {
    let mut class = NodeClass::new("trellis.test.textRelay", "Text Relay");
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
    Arc::new(class)
}

/// Range passthrough, exercising the split-pair lowering.
pub fn range_swap_class() -> Arc<NodeClass> {
    let mut class = NodeClass::new("trellis.test.rangeSwap", "Range Swap");
    class.input_ports.push(PortClass::data("value", "range"));
    class.output_ports.push(PortClass::data("out", "range"));
    class.functions.event = Some(FunctionContract::new(
        "range_swap_event",
        vec![
            ParamRole::InputData("value".into()),
            ParamRole::OutputData("out".into()),
            ParamRole::OutputEvent("out".into()),
        ],
    ));
    Arc::new(class)
}

/// Stateful counter with a distinct init symbol per test-visible name.
pub fn counter_class(prefix: &str) -> Arc<NodeClass> {
    let mut class = NodeClass::new(&format!("trellis.test.counter.{prefix}"), "Count");
    class.is_stateful = true;
    class.input_ports.push(PortClass::event("tick"));
    class.output_ports.push(PortClass::data("count", "integer"));
    class.functions.event = Some(FunctionContract::new(
        "counter_event",
        vec![
            ParamRole::InstanceData,
            ParamRole::OutputData("count".into()),
            ParamRole::OutputEvent("count".into()),
        ],
    ));
    class.functions.init = Some(FunctionContract::new(&format!("{prefix}_init"), vec![]));
    class.functions.fini = Some(FunctionContract::new(
        "counter_fini",
        vec![ParamRole::InstanceData],
    ));
    Arc::new(class)
}

fn register_node_functions(symbols: &mut SymbolTable) {
    symbols.register("relay_event", |_, args| {
        let value = args[0].as_uint()?;
        args[1].as_ptr()?.store_word(0, value)?;
        args[2].as_ptr()?.store_word(0, 1)?;
        Ok(Value::Void)
    });
    symbols.register("increment_event", |_, args| {
        let value = args[0].as_uint()?;
        args[1].as_ptr()?.store_word(0, value.wrapping_add(1))?;
        args[2].as_ptr()?.store_word(0, 1)?;
        Ok(Value::Void)
    });
    symbols.register("slow_event", |_, args| {
        std::thread::sleep(Duration::from_millis(150));
        let value = args[0].as_uint()?;
        args[1].as_ptr()?.store_word(0, value)?;
        args[2].as_ptr()?.store_word(0, 1)?;
        Ok(Value::Void)
    });
    symbols.register("add_event", |_, args| {
        let sum = args[0].as_uint()?.wrapping_add(args[1].as_uint()?);
        args[2].as_ptr()?.store_word(0, sum)?;
        args[3].as_ptr()?.store_word(0, 1)?;
        Ok(Value::Void)
    });
    symbols.register("text_relay_event", |api, args| {
        let handle = args[0].as_uint()?;
        let bytes = api.heap().bytes(handle).unwrap_or_default();
        let out = api.heap().alloc(bytes);
        args[1].as_ptr()?.store_word(0, out)?;
        args[2].as_ptr()?.store_word(0, 1)?;
        Ok(Value::Void)
    });
    symbols.register("range_swap_event", |_, args| {
        let low = args[0].as_uint()?;
        let high = args[1].as_uint()?;
        let out = args[2].as_ptr()?;
        out.store_word(0, high)?;
        out.store_word(8, low)?;
        args[3].as_ptr()?.store_word(0, 1)?;
        Ok(Value::Void)
    });
    symbols.register("counter_event", |api, args| {
        let handle = args[0].as_ptr()?.load_word(0)?;
        let mut bytes = api.heap().bytes(handle).unwrap_or(vec![0; 8]);
        let count =
            u64::from_le_bytes(bytes[..8].try_into().unwrap()).wrapping_add(1);
        bytes[..8].copy_from_slice(&count.to_le_bytes());
        api.heap().set_bytes(handle, bytes);
        args[1].as_ptr()?.store_word(0, count)?;
        args[2].as_ptr()?.store_word(0, 1)?;
        Ok(Value::Void)
    });
    symbols.register("counter_fini", |_, _| Ok(Value::Void));
}

pub fn base_symbols() -> SymbolTable {
    let mut symbols = SymbolTable::new();
    register_type_functions(&mut symbols);
    register_node_functions(&mut symbols);
    symbols
}

// =============================================================================
// Harness
// =============================================================================

pub fn compile(composition: &mut Composition, registry: &TypeRegistry) -> Module {
    composition.finish().expect("finish composition");
    generate_composition(composition, registry, true).expect("generate composition")
}

pub fn compile_subcomposition(
    composition: &mut Composition,
    registry: &TypeRegistry,
) -> Module {
    composition.finish().expect("finish composition");
    generate_composition(composition, registry, false).expect("generate subcomposition")
}

/// Symbol of the scheduler a node calls to fire a top-level trigger.
pub fn scheduler_symbol(module_key: &str, node_identifier: &str, port: &str) -> String {
    format!("Top__{module_key}__{node_identifier}__{port}")
}

pub struct Harness {
    pub executor: Executor,
    pub runtime: Arc<RuntimeState>,
}

impl Harness {
    /// Link the modules and run `setup()` only; the caller drives the rest
    /// of the lifecycle.
    pub fn boot(modules: Vec<Module>, symbols: SymbolTable) -> Harness {
        let runtime = Arc::new(RuntimeState::new());
        let executor = Executor::new(
            modules.into_iter().map(Arc::new).collect(),
            symbols,
            runtime.clone(),
        );
        executor.call("setup", vec![]).expect("setup");
        Harness { executor, runtime }
    }

    /// Link the modules, set up the composition, and start it.
    pub fn start(modules: Vec<Module>, symbols: SymbolTable) -> Harness {
        let harness = Harness::boot(modules, symbols);
        harness.init();
        harness.trigger_start();
        harness
    }

    pub fn init(&self) {
        self.executor.call("init", vec![]).expect("init");
    }

    pub fn trigger_start(&self) {
        self.executor.call("triggerStart", vec![]).expect("triggerStart");
    }

    pub fn fire(&self, scheduler: &str, args: Vec<Value>) {
        self.executor.call(scheduler, args).expect("fire trigger");
    }

    pub fn stop(&self) {
        self.executor.call("triggerStop", vec![]).expect("triggerStop");
    }

    pub fn wait_for_events_finished(&self, count: usize) -> bool {
        self.runtime.telemetry.wait_for(Duration::from_secs(10), |records| {
            records
                .iter()
                .filter(|r| matches!(r, TelemetryEvent::EventFinished { .. }))
                .count()
                >= count
        })
    }

    /// Node identifiers from execution-started telemetry, in order.
    pub fn executions(&self) -> Vec<String> {
        self.runtime
            .telemetry
            .snapshot()
            .into_iter()
            .filter_map(|record| match record {
                TelemetryEvent::NodeExecutionStarted { node, .. } => Some(node),
                _ => None,
            })
            .collect()
    }

    pub fn events_dropped(&self) -> Vec<String> {
        self.runtime
            .telemetry
            .snapshot()
            .into_iter()
            .filter_map(|record| match record {
                TelemetryEvent::EventDropped { port, .. } => Some(port),
                _ => None,
            })
            .collect()
    }

    pub fn events_finished(&self) -> usize {
        self.runtime
            .telemetry
            .snapshot()
            .iter()
            .filter(|r| matches!(r, TelemetryEvent::EventFinished { .. }))
            .count()
    }

    pub fn input_port_value(&self, port_identifier: &str) -> String {
        self.executor
            .call("getInputPortValue", vec![s(port_identifier), Value::Uint(0)])
            .expect("getInputPortValue")
            .as_str()
            .expect("string value")
            .to_string()
    }

    pub fn output_port_value(&self, port_identifier: &str) -> String {
        self.executor
            .call("getOutputPortValue", vec![s(port_identifier), Value::Uint(0)])
            .expect("getOutputPortValue")
            .as_str()
            .expect("string value")
            .to_string()
    }

    /// The context of a node, looked up by its registered identifier.
    pub fn node_context(&self, identifier: &str) -> Arc<NodeContext> {
        for (scope, index, entry) in self.runtime.metadata_entries() {
            if entry.identifier == identifier {
                return self
                    .runtime
                    .node_context(&scope, index)
                    .expect("node context exists");
            }
        }
        panic!("no node registered as '{identifier}'");
    }
}
