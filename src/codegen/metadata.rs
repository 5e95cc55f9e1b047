//! Serializes the composition's metadata into the `moduleDetails` JSON blob
//! attached to the emitted module.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value as Json};

use crate::codegen::Generator;
use crate::ir::types::{GlobalValue, MODULE_DETAILS_GLOBAL};

impl<'a> Generator<'a> {
    pub(crate) fn emit_module_metadata(&mut self) {
        let metadata = &self.composition.metadata;
        let title = if metadata.title.is_empty() {
            self.module_key.clone()
        } else {
            metadata.title.clone()
        };

        let mut dependencies: BTreeSet<String> =
            self.composition.dependencies.iter().cloned().collect();
        for node in &self.composition.nodes {
            dependencies.insert(node.class.class_name.clone());
        }
        for type_name in &self.ordered_types {
            dependencies.insert(type_name.clone());
        }

        let mut details = Map::new();
        details.insert("title".into(), json!(title));
        details.insert("description".into(), json!(metadata.description));
        details.insert("keywords".into(), json!(metadata.keywords));
        if let Some(version) = &metadata.version {
            details.insert("version".into(), json!(version));
        }
        details.insert(
            "dependencies".into(),
            json!(dependencies.into_iter().collect::<Vec<_>>()),
        );
        details.insert("node".into(), self.node_metadata_json());

        let text = Json::Object(details).to_string();
        self.module
            .set_global(MODULE_DETAILS_GLOBAL, GlobalValue::Json { value: text });
    }

    /// Declared triggers and the node roster, emitted for modules that will
    /// be used as node classes. The trigger list also surfaces triggers
    /// nested inside this composition's own subcomposition nodes so an
    /// enclosing composition can reach them by node and port-context index.
    fn node_metadata_json(&self) -> Json {
        if self.is_top_level {
            return json!({});
        }

        let mut triggers = Vec::new();
        for trigger in 0..self.graph.trigger_count() {
            let t = self.graph.trigger(trigger);
            let class = self.node_class(t.node);
            let port = class.output_port(&t.port_name);
            let (min_threads, max_threads) = self.graph.worker_threads_for_trigger(trigger);
            triggers.push(json!({
                "nodeIndex": self.order_index(t.node),
                "nodeIdentifier": self.composition.node_identifier(t.node),
                "nodeClassName": class.class_name,
                "portName": t.port_name,
                "portContextIndex": self
                    .composition
                    .port_context_index(t.node, &t.port_name)
                    .unwrap_or(0),
                "dataType": port.and_then(|p| p.data_type.clone()),
                "throttling": match port.map(|p| p.throttling) {
                    Some(crate::nodeclass::EventThrottling::Drop) => "drop",
                    _ => "enqueue",
                },
                "workerSymbol": self.trigger_worker_symbol(trigger),
                "chainCount": self.graph.chains(trigger).len(),
                "minThreads": min_threads,
                "maxThreads": max_threads,
            }));
        }

        for node in 0..self.composition.nodes.len() {
            let class = self.node_class(node);
            if !class.is_subcomposition {
                continue;
            }
            let node_id = self.composition.node_identifier(node);
            for nested in &class.trigger_descriptions {
                triggers.push(json!({
                    "nodeIndex": nested.node_index,
                    "nodeIdentifier": format!("{node_id}/{}", nested.node_identifier),
                    "nodeClassName": nested.node_class_name,
                    "portName": nested.port_name,
                    "portContextIndex": nested.port_context_index,
                    "dataType": nested.data_type,
                    "throttling": match nested.throttling {
                        crate::nodeclass::EventThrottling::Drop => "drop",
                        crate::nodeclass::EventThrottling::Enqueue => "enqueue",
                    },
                    "workerSymbol": nested.worker_symbol,
                    "chainCount": nested.chain_count,
                    "minThreads": nested.min_threads,
                    "maxThreads": nested.max_threads,
                }));
            }
        }

        let mut nodes = Map::new();
        for &node in &self.ordered_nodes {
            nodes.insert(
                self.composition.node_identifier(node).to_string(),
                json!(self.node_class(node).class_name),
            );
        }

        json!({ "triggers": triggers, "nodes": nodes })
    }
}
