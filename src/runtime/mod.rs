//! The runtime collaborator: composition states, node and port contexts,
//! event bookkeeping, live-edit gates, and telemetry. The emitted code
//! reaches this through the runtime ABI; external node functions reach it
//! through the executor's API surface.

pub mod dispatch;
pub mod heap;
pub mod telemetry;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use dispatch::{DispatchGroup, DispatchQueue, Semaphore, ThreadManager};
use heap::Heap;
use telemetry::TelemetrySink;

use crate::ir::types::NO_EVENT_ID;

/// Transient state of one port for one composition instantiation.
pub struct PortContext {
    pub event: Mutex<bool>,
    /// Canonical bytes of the port's data value; empty for event-only ports.
    pub data: Mutex<Vec<u8>>,
    pub is_trigger: bool,
    pub trigger_queue: Option<DispatchQueue>,
    /// Back-pressure semaphore, present when the trigger drops events.
    pub trigger_semaphore: Option<Semaphore>,
    /// Symbol of the installed trigger scheduler function.
    pub trigger_function: Mutex<Option<String>>,
}

impl PortContext {
    pub fn new(is_trigger: bool, data_size: usize, queue_name: Option<&str>, can_drop: bool) -> Self {
        PortContext {
            event: Mutex::new(false),
            data: Mutex::new(vec![0; data_size]),
            is_trigger,
            trigger_queue: queue_name.map(DispatchQueue::new),
            trigger_semaphore: if can_drop { Some(Semaphore::new()) } else { None },
            trigger_function: Mutex::new(None),
        }
    }
}

/// Transient state of one node for one composition instantiation. Also used
/// as the composition context of a (sub)composition as a whole.
pub struct NodeContext {
    pub ports: RwLock<Vec<Arc<PortContext>>>,
    /// Word-sized slot holding the node's instance data handle.
    pub instance_data: Mutex<Option<Vec<u8>>>,
    pub semaphore: Semaphore,
    pub claiming_event_id: AtomicU64,
    pub executing_group: DispatchGroup,
    /// Event flags for published output ports, read back by `nodeEvent`.
    pub output_events: Mutex<Vec<bool>>,
    executing_event_ids: Mutex<Vec<u64>>,
}

impl NodeContext {
    pub fn new(has_instance_data: bool, output_event_count: usize) -> Self {
        NodeContext {
            ports: RwLock::new(Vec::new()),
            instance_data: Mutex::new(if has_instance_data { Some(vec![0; 8]) } else { None }),
            semaphore: Semaphore::new(),
            claiming_event_id: AtomicU64::new(NO_EVENT_ID),
            executing_group: DispatchGroup::new(),
            output_events: Mutex::new(vec![false; output_event_count]),
            executing_event_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn add_port(&self, port: PortContext) {
        self.ports.write().push(Arc::new(port));
    }

    pub fn port(&self, index: usize) -> Arc<PortContext> {
        self.ports.read()[index].clone()
    }

    pub fn port_count(&self) -> usize {
        self.ports.read().len()
    }

    pub fn started_executing_event(&self, event_id: u64) {
        self.executing_event_ids.lock().push(event_id);
    }

    /// Record an event spun off from one already executing here; the
    /// original event is not finished until its descendants are.
    pub fn spun_off_executing_event(&self, event_id: u64) {
        self.executing_event_ids.lock().push(event_id);
    }

    /// Remove the event from the tracked set. Returns true when this was
    /// the final tracked event to complete, meaning the caller owns the
    /// single leave of the executing group.
    pub fn finished_executing_event(&self, event_id: u64) -> bool {
        let mut ids = self.executing_event_ids.lock();
        if let Some(position) = ids.iter().position(|id| *id == event_id) {
            ids.remove(position);
            ids.is_empty()
        } else {
            false
        }
    }

    pub fn one_executing_event(&self) -> u64 {
        self.executing_event_ids.lock().first().copied().unwrap_or(NO_EVENT_ID)
    }
}

/// Identifies one composition instantiation: the process-wide runtime state
/// plus the instance's identifier path ("Top", "Top/AddOne", …).
pub struct CompositionState {
    pub runtime: Arc<RuntimeState>,
    pub identifier: String,
}

impl CompositionState {
    pub fn new(runtime: Arc<RuntimeState>, identifier: &str) -> Self {
        CompositionState { runtime, identifier: identifier.to_string() }
    }
}

#[derive(Debug, Clone)]
pub struct PortMetadata {
    pub identifier: String,
    pub name: String,
    pub type_index: u64,
    pub initial_value: String,
}

/// Per-node registration made by the emitted `compositionAddNodeMetadata`.
#[derive(Debug, Clone)]
pub struct NodeMetadataEntry {
    pub identifier: String,
    pub create_context: String,
    pub set_value: String,
    pub get_value: String,
    pub fire_event: String,
    pub release_data: String,
    pub ports: Vec<PortMetadata>,
}

thread_local! {
    static STATE_STACK: RefCell<Vec<Arc<CompositionState>>> = const { RefCell::new(Vec::new()) };
}

/// Process-wide runtime state for one running top-level composition.
pub struct RuntimeState {
    paused: AtomicBool,
    next_event_id: AtomicU64,
    pub heap: Heap,
    pub telemetry: TelemetrySink,
    pub thread_manager: ThreadManager,
    trigger_workers_scheduled: DispatchGroup,
    metadata: Mutex<Vec<(String, NodeMetadataEntry)>>,
    contexts: Mutex<HashMap<(String, u64), Arc<NodeContext>>>,
    contexts_by_path: Mutex<HashMap<String, Arc<NodeContext>>>,
    top_level_context: Mutex<Option<Arc<NodeContext>>>,
    data_telemetry_ports: Mutex<HashSet<String>>,
    nodes_being_added: Mutex<HashSet<String>>,
    nodes_being_removed: Mutex<HashSet<String>>,
}

impl RuntimeState {
    pub fn new() -> Self {
        RuntimeState {
            paused: AtomicBool::new(false),
            next_event_id: AtomicU64::new(1),
            heap: Heap::new(),
            telemetry: TelemetrySink::new(),
            thread_manager: ThreadManager::new(),
            trigger_workers_scheduled: DispatchGroup::new(),
            metadata: Mutex::new(Vec::new()),
            contexts: Mutex::new(HashMap::new()),
            contexts_by_path: Mutex::new(HashMap::new()),
            top_level_context: Mutex::new(None),
            data_telemetry_ports: Mutex::new(HashSet::new()),
            nodes_being_added: Mutex::new(HashSet::new()),
            nodes_being_removed: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn next_event_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn trigger_workers_scheduled(&self) -> DispatchGroup {
        self.trigger_workers_scheduled.clone()
    }

    /// Register a node's metadata under the composition scope. The node's
    /// index within the scope is its registration position.
    pub fn add_node_metadata(&self, scope: &str, entry: NodeMetadataEntry) {
        self.metadata.lock().push((scope.to_string(), entry));
    }

    /// Attach port metadata to the most recently registered node.
    pub fn add_port_metadata(&self, scope: &str, port: PortMetadata) {
        let mut metadata = self.metadata.lock();
        match metadata.iter_mut().rev().find(|(s, _)| s == scope) {
            Some((_, entry)) => entry.ports.push(port),
            None => log::warn!("port metadata for unknown scope {scope}"),
        }
    }

    /// All registered node metadata: (scope, index within scope, entry).
    pub fn metadata_entries(&self) -> Vec<(String, u64, NodeMetadataEntry)> {
        let metadata = self.metadata.lock();
        let mut per_scope: HashMap<&str, u64> = HashMap::new();
        metadata
            .iter()
            .map(|(scope, entry)| {
                let index = per_scope.entry(scope.as_str()).or_insert(0);
                let current = *index;
                *index += 1;
                (scope.clone(), current, entry.clone())
            })
            .collect()
    }

    pub fn find_port_metadata(&self, port_identifier: &str) -> Option<(String, PortMetadata)> {
        let metadata = self.metadata.lock();
        for (scope, entry) in metadata.iter() {
            for port in &entry.ports {
                if port.identifier == port_identifier {
                    return Some((scope.clone(), port.clone()));
                }
            }
        }
        None
    }

    pub fn register_node_context(
        &self,
        scope: &str,
        index: u64,
        node_identifier: &str,
        context: Arc<NodeContext>,
    ) {
        self.contexts.lock().insert((scope.to_string(), index), context.clone());
        self.contexts_by_path
            .lock()
            .insert(format!("{scope}/{node_identifier}"), context);
    }

    pub fn node_context(&self, scope: &str, index: u64) -> Option<Arc<NodeContext>> {
        self.contexts.lock().get(&(scope.to_string(), index)).cloned()
    }

    pub fn set_top_level_context(&self, context: Arc<NodeContext>) {
        *self.top_level_context.lock() = Some(context);
    }

    /// The composition context for an instance identifier: the synthetic
    /// top-level context, or the context of the subcomposition node itself.
    pub fn composition_context(&self, identifier: &str) -> Option<Arc<NodeContext>> {
        if identifier.contains('/') {
            self.contexts_by_path.lock().get(identifier).cloned()
        } else {
            self.top_level_context.lock().clone()
        }
    }

    pub fn fini_contexts(&self) {
        self.contexts.lock().clear();
        self.contexts_by_path.lock().clear();
        *self.top_level_context.lock() = None;
        self.metadata.lock().clear();
    }

    pub fn set_port_data_telemetry(&self, port_identifier: &str, enabled: bool) {
        let mut ports = self.data_telemetry_ports.lock();
        if enabled {
            ports.insert(port_identifier.to_string());
        } else {
            ports.remove(port_identifier);
        }
    }

    pub fn should_send_port_data_telemetry(&self, port_identifier: &str) -> bool {
        self.data_telemetry_ports.lock().contains(port_identifier)
    }

    pub fn set_node_being_added_or_replaced(&self, node_identifier: &str, value: bool) {
        let mut nodes = self.nodes_being_added.lock();
        if value {
            nodes.insert(node_identifier.to_string());
        } else {
            nodes.remove(node_identifier);
        }
    }

    pub fn is_node_being_added_or_replaced(&self, node_identifier: &str) -> bool {
        self.nodes_being_added.lock().contains(node_identifier)
    }

    pub fn set_node_being_removed_or_replaced(&self, node_identifier: &str, value: bool) {
        let mut nodes = self.nodes_being_removed.lock();
        if value {
            nodes.insert(node_identifier.to_string());
        } else {
            nodes.remove(node_identifier);
        }
    }

    pub fn is_node_being_removed_or_replaced(&self, node_identifier: &str) -> bool {
        self.nodes_being_removed.lock().contains(node_identifier)
    }

    // --- Thread-local composition state, giving node code access to the
    // composition it runs in without widening the node ABI. ---

    pub fn push_thread_state(state: Arc<CompositionState>) {
        STATE_STACK.with(|stack| stack.borrow_mut().push(state));
    }

    pub fn pop_thread_state() {
        STATE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }

    pub fn current_thread_state() -> Option<Arc<CompositionState>> {
        STATE_STACK.with(|stack| stack.borrow().last().cloned())
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tracking_completes_when_set_empties() {
        let ctx = NodeContext::new(false, 1);
        ctx.started_executing_event(5);
        ctx.spun_off_executing_event(9);
        assert_eq!(ctx.one_executing_event(), 5);
        // The original event finishing is not final while a spun-off
        // descendant is still in flight.
        assert!(!ctx.finished_executing_event(5));
        assert!(ctx.finished_executing_event(9));
        assert!(!ctx.finished_executing_event(9));
    }

    #[test]
    fn metadata_indices_count_per_scope() {
        let runtime = RuntimeState::new();
        let entry = |id: &str| NodeMetadataEntry {
            identifier: id.into(),
            create_context: "create".into(),
            set_value: "set".into(),
            get_value: "get".into(),
            fire_event: "fire".into(),
            release_data: "release".into(),
            ports: Vec::new(),
        };
        runtime.add_node_metadata("Top", entry("A"));
        runtime.add_node_metadata("Top/Sub", entry("B"));
        runtime.add_node_metadata("Top", entry("C"));
        let entries = runtime.metadata_entries();
        assert_eq!(entries[0].1, 0);
        assert_eq!(entries[1].1, 0);
        assert_eq!(entries[2].1, 1);
    }
}
