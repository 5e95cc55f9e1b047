//! Reads parameter annotations and metadata globals from a compiled node
//! module, recovering the node class interface the code generator needs.
//! Used when a composition contains a subcomposition node: the child's
//! emitted module is re-parsed into a `NodeClass`.

use serde_json::Value as Json;

use crate::error::{Issue, IssueList};
use crate::ir::types::{Function, Module};
use crate::nodeclass::{
    EventBlocking, EventThrottling, FunctionContract, NodeClass, NodeFunctions, ParamContract,
    ParamRole, PortClass, PortKind, TriggerDescription,
};

pub const ANNOTATION_COMPOSITION_STATE: &str = "compositionState";
pub const ANNOTATION_INSTANCE_DATA: &str = "instanceData";
pub const ANNOTATION_INPUT_DATA: &str = "inputData";
pub const ANNOTATION_INPUT_EVENT: &str = "inputEvent";
pub const ANNOTATION_OUTPUT_DATA: &str = "outputData";
pub const ANNOTATION_OUTPUT_EVENT: &str = "outputEvent";
pub const ANNOTATION_OUTPUT_TRIGGER: &str = "outputTrigger";
pub const ANNOTATION_TYPE: &str = "type";
pub const ANNOTATION_DETAILS: &str = "details";
pub const ANNOTATION_UNLOWERED_STRUCT_POINTER: &str = "unloweredStructPointer";

/// Build the annotation list for one parameter.
pub fn annotate_role(role: &ParamRole, type_name: Option<&str>) -> Vec<String> {
    let mut annotations = Vec::new();
    match role {
        ParamRole::CompositionState => annotations.push(ANNOTATION_COMPOSITION_STATE.to_string()),
        ParamRole::InstanceData => annotations.push(ANNOTATION_INSTANCE_DATA.to_string()),
        ParamRole::InputData(port) => {
            annotations.push(format!("{ANNOTATION_INPUT_DATA}:{port}"));
        }
        ParamRole::InputEvent(port) => {
            annotations.push(format!("{ANNOTATION_INPUT_EVENT}:{port}"));
        }
        ParamRole::OutputData(port) => {
            annotations.push(format!("{ANNOTATION_OUTPUT_DATA}:{port}"));
        }
        ParamRole::OutputEvent(port) => {
            annotations.push(format!("{ANNOTATION_OUTPUT_EVENT}:{port}"));
        }
        ParamRole::OutputTrigger(port) => {
            annotations.push(format!("{ANNOTATION_OUTPUT_TRIGGER}:{port}"));
        }
    }
    if let Some(type_name) = type_name {
        annotations.push(format!("{ANNOTATION_TYPE}:{type_name}"));
    }
    annotations
}

/// One parameter's recovered facts.
#[derive(Debug, Clone, Default)]
pub struct ParsedParam {
    pub role: Option<ParamRole>,
    pub type_name: Option<String>,
    pub details: Option<Json>,
    pub unlowered_struct_pointer: bool,
}

/// Parse the annotation strings of one parameter. Unrecognized annotations
/// are logged and skipped.
pub fn parse_param(annotations: &[String]) -> ParsedParam {
    let mut parsed = ParsedParam::default();
    for annotation in annotations {
        let (head, rest) = match annotation.split_once(':') {
            Some((head, rest)) => (head, Some(rest)),
            None => (annotation.as_str(), None),
        };
        match (head, rest) {
            (ANNOTATION_COMPOSITION_STATE, None) => {
                parsed.role = Some(ParamRole::CompositionState);
            }
            (ANNOTATION_INSTANCE_DATA, None) => parsed.role = Some(ParamRole::InstanceData),
            (ANNOTATION_INPUT_DATA, Some(port)) => {
                parsed.role = Some(ParamRole::InputData(port.to_string()));
            }
            (ANNOTATION_INPUT_EVENT, Some(port)) => {
                parsed.role = Some(ParamRole::InputEvent(port.to_string()));
            }
            (ANNOTATION_OUTPUT_DATA, Some(port)) => {
                parsed.role = Some(ParamRole::OutputData(port.to_string()));
            }
            (ANNOTATION_OUTPUT_EVENT, Some(port)) => {
                parsed.role = Some(ParamRole::OutputEvent(port.to_string()));
            }
            (ANNOTATION_OUTPUT_TRIGGER, Some(port)) => {
                parsed.role = Some(ParamRole::OutputTrigger(port.to_string()));
            }
            (ANNOTATION_TYPE, Some(type_name)) => {
                parsed.type_name = Some(type_name.to_string());
            }
            (ANNOTATION_DETAILS, Some(json)) => match serde_json::from_str(json) {
                Ok(details) => parsed.details = Some(details),
                Err(error) => log::warn!("unparseable details annotation: {error}"),
            },
            (ANNOTATION_UNLOWERED_STRUCT_POINTER, None) => {
                parsed.unlowered_struct_pointer = true;
            }
            _ => log::warn!("unrecognized parameter annotation '{annotation}'"),
        }
    }
    parsed
}

/// Recover a function contract from an annotated module function.
pub fn function_contract(function: &Function) -> Result<FunctionContract, Issue> {
    if function.annotations.len() != function.param_count as usize {
        return Err(Issue::error(
            "Metadata parse failure",
            format!(
                "function {} declares {} parameters but {} annotation lists",
                function.name,
                function.param_count,
                function.annotations.len()
            ),
        ));
    }
    let mut params = Vec::new();
    for (index, annotations) in function.annotations.iter().enumerate() {
        let parsed = parse_param(annotations);
        let Some(role) = parsed.role else {
            return Err(Issue::error(
                "Metadata parse failure",
                format!("parameter {index} of {} has no role annotation", function.name),
            ));
        };
        params.push(ParamContract {
            role,
            unlowered_struct_pointer: parsed.unlowered_struct_pointer,
        });
    }
    Ok(FunctionContract { symbol: function.name.clone(), params })
}

fn json_str(value: &Json, key: &str) -> Option<String> {
    value.get(key).and_then(Json::as_str).map(str::to_string)
}

fn json_u64(value: &Json, key: &str) -> Option<u64> {
    value.get(key).and_then(Json::as_u64)
}

/// Recover a node class from a compiled (sub)composition module: ports from
/// the event function's annotations, entry points by symbol convention,
/// nested triggers and dependencies from the metadata global.
pub fn node_class_from_module(module: &Module) -> Result<NodeClass, IssueList> {
    let key = &module.key;
    let mut issues = IssueList::new();

    let (event_function, stateful) = match (
        module.function(&format!("{key}__nodeInstanceEvent")),
        module.function(&format!("{key}__nodeEvent")),
    ) {
        (Some(function), _) => (function, true),
        (None, Some(function)) => (function, false),
        (None, None) => {
            issues.push(Issue::error(
                "Metadata parse failure",
                format!("module {key} lacks a nodeEvent/nodeInstanceEvent function"),
            ));
            return Err(issues);
        }
    };

    let details: Json = module
        .details_json()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or(Json::Null);
    let title = json_str(&details, "title").unwrap_or_else(|| key.clone());

    let mut class = NodeClass::new(key, &title);
    class.is_subcomposition = true;
    class.is_stateful = stateful;

    let contract = match function_contract(event_function) {
        Ok(contract) => contract,
        Err(issue) => {
            issues.push(issue);
            return Err(issues);
        }
    };

    for (index, param) in contract.params.iter().enumerate() {
        let parsed = parse_param(&event_function.annotations[index]);
        match &param.role {
            ParamRole::InputData(port) => {
                let Some(type_name) = parsed.type_name else {
                    issues.push(Issue::error(
                        "Metadata parse failure",
                        format!("input data parameter '{port}' of {key} lacks a type"),
                    ));
                    continue;
                };
                let mut port_class = PortClass::data(port, &type_name)
                    .with_blocking(EventBlocking::Door);
                if let Some(default) =
                    parsed.details.as_ref().and_then(|d| d.get("default"))
                {
                    port_class.initial_value = Some(default.to_string());
                }
                port_class.details = parsed.details;
                class.input_ports.push(port_class);
            }
            ParamRole::InputEvent(port) => {
                if class.input_port(port).is_none() {
                    class
                        .input_ports
                        .push(PortClass::event(port).with_blocking(EventBlocking::Door));
                }
            }
            ParamRole::OutputData(port) => {
                let Some(type_name) = parsed.type_name else {
                    issues.push(Issue::error(
                        "Metadata parse failure",
                        format!("output data parameter '{port}' of {key} lacks a type"),
                    ));
                    continue;
                };
                class.output_ports.push(PortClass::data(port, &type_name));
            }
            ParamRole::OutputEvent(port) => {
                if class.output_port(port).is_none() {
                    class.output_ports.push(PortClass::event(port));
                }
            }
            ParamRole::OutputTrigger(port) => {
                class
                    .output_ports
                    .push(PortClass::trigger(port, parsed.type_name.as_deref()));
            }
            ParamRole::CompositionState | ParamRole::InstanceData => {}
        }
    }

    class.functions = NodeFunctions {
        event: Some(contract),
        init: parse_optional_contract(module, &format!("{key}__nodeInstanceInit"), &mut issues),
        fini: parse_optional_contract(module, &format!("{key}__nodeInstanceFini"), &mut issues),
        callback_start: parse_optional_contract(
            module,
            &format!("{key}__nodeInstanceTriggerStart"),
            &mut issues,
        ),
        callback_update: parse_optional_contract(
            module,
            &format!("{key}__nodeInstanceTriggerUpdate"),
            &mut issues,
        ),
        callback_stop: parse_optional_contract(
            module,
            &format!("{key}__nodeInstanceTriggerStop"),
            &mut issues,
        ),
    };

    if let Some(dependencies) = details.get("dependencies").and_then(Json::as_array) {
        class.dependencies = dependencies
            .iter()
            .filter_map(Json::as_str)
            .map(str::to_string)
            .collect();
    }

    if let Some(triggers) = details
        .get("node")
        .and_then(|n| n.get("triggers"))
        .and_then(Json::as_array)
    {
        for trigger in triggers {
            let (Some(node_identifier), Some(port_name), Some(worker_symbol)) = (
                json_str(trigger, "nodeIdentifier"),
                json_str(trigger, "portName"),
                json_str(trigger, "workerSymbol"),
            ) else {
                issues.push(Issue::error(
                    "Metadata parse failure",
                    format!("malformed trigger description in module {key}"),
                ));
                continue;
            };
            class.trigger_descriptions.push(TriggerDescription {
                node_index: json_u64(trigger, "nodeIndex").unwrap_or(0),
                node_identifier,
                node_class_name: json_str(trigger, "nodeClassName").unwrap_or_default(),
                port_name,
                port_context_index: json_u64(trigger, "portContextIndex").unwrap_or(0),
                data_type: json_str(trigger, "dataType"),
                throttling: match json_str(trigger, "throttling").as_deref() {
                    Some("drop") => EventThrottling::Drop,
                    _ => EventThrottling::Enqueue,
                },
                worker_symbol,
                chain_count: json_u64(trigger, "chainCount").unwrap_or(0),
                min_threads: trigger
                    .get("minThreads")
                    .and_then(Json::as_i64)
                    .unwrap_or(1),
                max_threads: trigger
                    .get("maxThreads")
                    .and_then(Json::as_i64)
                    .unwrap_or(1),
            });
        }
    }

    if issues.is_empty() { Ok(class) } else { Err(issues) }
}

fn parse_optional_contract(
    module: &Module,
    symbol: &str,
    issues: &mut IssueList,
) -> Option<FunctionContract> {
    let function = module.function(symbol)?;
    match function_contract(function) {
        Ok(contract) => Some(contract),
        Err(issue) => {
            issues.push(issue);
            None
        }
    }
}

/// Count ports of a parsed class, for sizing published-output event slots.
pub fn published_output_count(class: &NodeClass) -> usize {
    class
        .output_ports
        .iter()
        .filter(|p| p.kind != PortKind::Trigger)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_roundtrip_through_annotations() {
        let role = ParamRole::InputData("seconds".into());
        let annotations = annotate_role(&role, Some("real"));
        let parsed = parse_param(&annotations);
        assert_eq!(parsed.role, Some(role));
        assert_eq!(parsed.type_name.as_deref(), Some("real"));
    }

    #[test]
    fn missing_role_is_a_parse_failure() {
        let function = Function::external("orphan", 1, vec![vec!["type:integer".into()]]);
        let error = function_contract(&function).expect_err("no role");
        assert!(error.summary.contains("Metadata parse failure"));
    }

    #[test]
    fn unrecognized_annotations_are_skipped() {
        let parsed = parse_param(&["tintColor:blue".to_string(), "instanceData".to_string()]);
        assert_eq!(parsed.role, Some(ParamRole::InstanceData));
    }
}
