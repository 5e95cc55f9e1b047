//! Precomputed graph analysis consumed by the code generator.
//!
//! For each trigger: the downstream reachable set, the forward-edge DAG
//! (back edges split off for feedback handling), the chains of serially
//! executable nodes, and the overlap predicates that decide how wide each
//! lock set must be. Event flow stops at wall-blocked input ports.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::graph::model::Composition;
use crate::nodeclass::EventBlocking;

/// A trigger port, identified by its node and port name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRef {
    pub node: usize,
    pub port_name: String,
}

/// An ordered run of nodes that can execute as one serial unit.
#[derive(Debug, Clone)]
pub struct Chain {
    pub nodes: Vec<usize>,
    /// True if this chain closes a feedback loop; it must run after all
    /// other chains of its trigger.
    pub is_last_in_loop: bool,
}

#[derive(Debug, Clone, Default)]
struct TriggerScope {
    /// All nodes the trigger's events can reach, in traversal preorder,
    /// with the published-output node appended for event tracking.
    downstream: Vec<usize>,
    downstream_set: HashSet<usize>,
    /// Direct targets of the trigger port's cables.
    immediate: Vec<usize>,
    /// Forward adjacency (real cables plus leaf-to-published-output edges).
    succ: HashMap<usize, Vec<usize>>,
    /// Real cable edges only, for scatter detection.
    real_out_degree: HashMap<usize, usize>,
    back_edges: Vec<(usize, usize)>,
    chains: Vec<Chain>,
}

#[derive(Debug)]
pub struct GraphAnalysis {
    node_count: usize,
    pub triggers: Vec<TriggerRef>,
    scopes: Vec<TriggerScope>,
    published_input_trigger: Option<usize>,
    published_input_node: usize,
    published_output_node: usize,
    /// Trigger indices per node.
    triggers_on_node: Vec<Vec<usize>>,
    spin_off_node: Vec<bool>,
    data_only_transmitter: Vec<bool>,
    data_only_downstream: Vec<Vec<usize>>,
    data_only_sources: Vec<usize>,
}

impl GraphAnalysis {
    pub fn new(composition: &Composition) -> Self {
        let node_count = composition.nodes.len();
        let published_input_node =
            composition.published_input_node.expect("composition not finished");
        let published_output_node =
            composition.published_output_node.expect("composition not finished");

        let mut triggers = Vec::new();
        let mut triggers_on_node = vec![Vec::new(); node_count];
        for (index, node) in composition.nodes.iter().enumerate() {
            for port in &node.class.output_ports {
                if port.kind == crate::nodeclass::PortKind::Trigger {
                    triggers_on_node[index].push(triggers.len());
                    triggers.push(TriggerRef { node: index, port_name: port.name.clone() });
                }
            }
        }

        let published_input_trigger = triggers.iter().position(|t| {
            t.node == published_input_node
                && t.port_name == crate::graph::model::PUBLISHED_INPUT_TRIGGER_NAME
        });

        let spin_off_node = composition.nodes.iter().map(|n| n.class.is_spin_off()).collect();
        let data_only_transmitter: Vec<bool> =
            composition.nodes.iter().map(|n| n.class.may_transmit_data_only).collect();

        let mut analysis = GraphAnalysis {
            node_count,
            triggers,
            scopes: Vec::new(),
            published_input_trigger,
            published_input_node,
            published_output_node,
            triggers_on_node,
            spin_off_node,
            data_only_transmitter,
            data_only_downstream: vec![Vec::new(); node_count],
            data_only_sources: Vec::new(),
        };

        for index in 0..analysis.triggers.len() {
            let scope = analysis.build_scope(composition, index);
            analysis.scopes.push(scope);
        }
        analysis.build_data_only(composition);
        analysis
    }

    fn build_scope(&self, composition: &Composition, trigger_index: usize) -> TriggerScope {
        let trigger = &self.triggers[trigger_index];
        let mut scope = TriggerScope::default();

        // Entry edges: the trigger port's cables, or the published-input
        // carrier for the synthetic published trigger.
        let mut entries: Vec<(usize, bool)> = Vec::new();
        if Some(trigger_index) == self.published_input_trigger {
            entries.push((self.published_input_node, true));
            scope.immediate.push(self.published_input_node);
        } else {
            for cable in composition.outgoing_cables(trigger.node, &trigger.port_name) {
                if !cable.carries_event() {
                    continue;
                }
                let blocking = composition.nodes[cable.to_node]
                    .class
                    .input_port(&cable.to_port)
                    .map(|p| p.event_blocking)
                    .unwrap_or(EventBlocking::None);
                if !scope.immediate.contains(&cable.to_node) {
                    scope.immediate.push(cable.to_node);
                }
                entries.push((cable.to_node, blocking != EventBlocking::Wall));
            }
        }

        // Depth-first traversal classifying edges: an edge to an on-stack
        // node is a back edge (feedback); everything else is forward.
        let mut on_stack: HashSet<usize> = HashSet::new();
        let mut expanded: HashSet<usize> = HashSet::new();
        let mut forward_edges: Vec<(usize, usize)> = Vec::new();

        struct Walk<'a> {
            composition: &'a Composition,
            scope: &'a mut TriggerScope,
            on_stack: &'a mut HashSet<usize>,
            expanded: &'a mut HashSet<usize>,
            forward_edges: &'a mut Vec<(usize, usize)>,
        }

        impl Walk<'_> {
            fn visit(&mut self, node: usize, may_expand: bool) {
                if !self.scope.downstream_set.contains(&node) {
                    self.scope.downstream_set.insert(node);
                    self.scope.downstream.push(node);
                }
                if !may_expand || self.expanded.contains(&node) {
                    return;
                }
                self.expanded.insert(node);
                self.on_stack.insert(node);
                let class = self.composition.nodes[node].class.clone();
                for port in &class.output_ports {
                    if port.kind == crate::nodeclass::PortKind::Trigger {
                        continue;
                    }
                    for cable in self.composition.outgoing_cables(node, &port.name) {
                        if !cable.carries_event() {
                            continue;
                        }
                        let target = cable.to_node;
                        if self.on_stack.contains(&target) {
                            if !self.scope.back_edges.contains(&(node, target)) {
                                self.scope.back_edges.push((node, target));
                            }
                            continue;
                        }
                        if !self.forward_edges.contains(&(node, target)) {
                            self.forward_edges.push((node, target));
                        }
                        let blocking = self.composition.nodes[target]
                            .class
                            .input_port(&cable.to_port)
                            .map(|p| p.event_blocking)
                            .unwrap_or(EventBlocking::None);
                        self.visit(target, blocking != EventBlocking::Wall);
                    }
                }
                self.on_stack.remove(&node);
            }
        }

        let mut walk = Walk {
            composition,
            scope: &mut scope,
            on_stack: &mut on_stack,
            expanded: &mut expanded,
            forward_edges: &mut forward_edges,
        };
        for (node, may_expand) in entries {
            walk.visit(node, may_expand);
        }

        // Every event implicitly travels to the published-output node so
        // that event completion can be tracked there.
        if !scope.downstream_set.contains(&self.published_output_node) {
            scope.downstream.push(self.published_output_node);
            scope.downstream_set.insert(self.published_output_node);
        }
        for (from, to) in &forward_edges {
            *scope.real_out_degree.entry(*from).or_insert(0) += 1;
            scope.succ.entry(*from).or_default().push(*to);
        }
        let leaves: Vec<usize> = scope
            .downstream
            .iter()
            .copied()
            .filter(|n| {
                *n != self.published_output_node
                    && scope.succ.get(n).map(|s| s.is_empty()).unwrap_or(true)
            })
            .collect();
        for leaf in leaves {
            let entry = scope.succ.entry(leaf).or_default();
            if !entry.contains(&self.published_output_node) {
                entry.push(self.published_output_node);
            }
        }

        scope.chains = self.build_chains(&scope);
        scope
    }

    /// Group a trigger's downstream nodes into chains over the forward DAG,
    /// then add one last-in-loop chain per feedback target.
    fn build_chains(&self, scope: &TriggerScope) -> Vec<Chain> {
        let mut pred: HashMap<usize, Vec<usize>> = HashMap::new();
        for (from, succs) in &scope.succ {
            for to in succs {
                pred.entry(*to).or_default().push(*from);
            }
        }

        // Topological order over the forward DAG, seeded in traversal order.
        let mut dag: DiGraph<usize, ()> = DiGraph::new();
        let mut index_of = HashMap::new();
        for node in &scope.downstream {
            index_of.insert(*node, dag.add_node(*node));
        }
        for node in &scope.downstream {
            if let Some(succs) = scope.succ.get(node) {
                for to in succs {
                    dag.add_edge(index_of[node], index_of[to], ());
                }
            }
        }
        let topo: Vec<usize> = match toposort(&dag, None) {
            Ok(order) => order.into_iter().map(|i| dag[i]).collect(),
            // Back edges were split off, so the forward graph cannot cycle.
            Err(_) => scope.downstream.clone(),
        };

        let out_degree =
            |n: usize| scope.succ.get(&n).map(|s| s.len()).unwrap_or(0);

        let mut chains: Vec<Chain> = Vec::new();
        let mut chain_of: HashMap<usize, usize> = HashMap::new();
        for node in topo {
            let preds = pred.get(&node);
            // The published-output gather always gets its own chain, so it
            // runs only after every chain feeding it has completed.
            let extend = match preds {
                Some(preds) if preds.len() == 1 && node != self.published_output_node => {
                    let p = preds[0];
                    out_degree(p) == 1
                        && chain_of
                            .get(&p)
                            .is_some_and(|c| chains[*c].nodes.last() == Some(&p))
                }
                _ => false,
            };
            if extend {
                let c = chain_of[&preds.unwrap()[0]];
                chains[c].nodes.push(node);
                chain_of.insert(node, c);
            } else {
                chains.push(Chain { nodes: vec![node], is_last_in_loop: false });
                chain_of.insert(node, chains.len() - 1);
            }
        }

        let mut loop_targets: Vec<usize> = Vec::new();
        for (_, target) in &scope.back_edges {
            if !loop_targets.contains(target) {
                loop_targets.push(*target);
            }
        }
        for target in loop_targets {
            chains.push(Chain { nodes: vec![target], is_last_in_loop: true });
        }

        chains
    }

    fn build_data_only(&mut self, composition: &Composition) {
        for node in 0..self.node_count {
            if !self.data_only_transmitter[node] {
                continue;
            }
            let data_targets = |current: usize| -> Vec<usize> {
                let mut targets = Vec::new();
                for port in &composition.nodes[current].class.output_ports {
                    if port.kind == crate::nodeclass::PortKind::Trigger {
                        continue;
                    }
                    for cable in composition.outgoing_cables(current, &port.name) {
                        if cable.carries_data() {
                            targets.push(cable.to_node);
                        }
                    }
                }
                targets
            };

            let mut seen: HashSet<usize> = HashSet::new();
            seen.insert(node);
            let mut order: Vec<usize> = Vec::new();
            let mut queue: VecDeque<usize> = data_targets(node).into();
            while let Some(current) = queue.pop_front() {
                if !seen.insert(current) {
                    continue;
                }
                order.push(current);
                if self.data_only_transmitter[current] {
                    queue.extend(data_targets(current));
                }
            }
            self.data_only_downstream[node] = order;
        }

        // Sources: data-only transmitters not fed by another transmitter.
        let mut fed: HashSet<usize> = HashSet::new();
        for node in 0..self.node_count {
            if self.data_only_transmitter[node] {
                for target in &self.data_only_downstream[node] {
                    if self.data_only_transmitter[*target] {
                        fed.insert(*target);
                    }
                }
            }
        }
        self.data_only_sources = (0..self.node_count)
            .filter(|n| self.data_only_transmitter[*n] && !fed.contains(n))
            .collect();
    }

    // --- Trigger lookups ---

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn trigger(&self, index: usize) -> &TriggerRef {
        &self.triggers[index]
    }

    pub fn published_input_trigger(&self) -> Option<usize> {
        self.published_input_trigger
    }

    pub fn published_input_node(&self) -> usize {
        self.published_input_node
    }

    pub fn published_output_node(&self) -> usize {
        self.published_output_node
    }

    pub fn triggers_on_node(&self, node: usize) -> &[usize] {
        &self.triggers_on_node[node]
    }

    // --- Downstream structure ---

    pub fn downstream_nodes(&self, trigger: usize) -> &[usize] {
        &self.scopes[trigger].downstream
    }

    pub fn immediate_downstream(&self, trigger: usize) -> &[usize] {
        &self.scopes[trigger].immediate
    }

    pub fn chains(&self, trigger: usize) -> &[Chain] {
        &self.scopes[trigger].chains
    }

    pub fn nodes_immediately_downstream_of_node(&self, trigger: usize, node: usize) -> Vec<usize> {
        self.scopes[trigger].succ.get(&node).cloned().unwrap_or_default()
    }

    pub fn nodes_downstream_of_node(&self, trigger: usize, node: usize) -> Vec<usize> {
        let scope = &self.scopes[trigger];
        let mut seen: HashSet<usize> = HashSet::new();
        let mut order: Vec<usize> = Vec::new();
        let mut queue: VecDeque<usize> =
            scope.succ.get(&node).cloned().unwrap_or_default().into();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current);
            if let Some(succs) = scope.succ.get(&current) {
                for s in succs {
                    queue.push_back(*s);
                }
            }
        }
        order
    }

    /// Whether an event from `trigger` can pass directly from `from` to `to`.
    pub fn may_transmit(&self, trigger: usize, from: usize, to: usize) -> bool {
        self.scopes[trigger].succ.get(&from).is_some_and(|s| s.contains(&to))
    }

    /// Like `may_transmit`, but also true across the back edge that closes a
    /// feedback loop. Chain ordering relies on this.
    pub fn may_transmit_including_feedback(&self, trigger: usize, from: usize, to: usize) -> bool {
        self.may_transmit(trigger, from, to)
            || self.scopes[trigger].back_edges.contains(&(from, to))
    }

    /// Whether the node sits at the hub of a feedback loop under this
    /// trigger, i.e. the same event reaches it more than once.
    pub fn is_repeated_in_feedback_loop(&self, trigger: usize, node: usize) -> bool {
        self.scopes[trigger]
            .chains
            .iter()
            .any(|c| c.is_last_in_loop && c.nodes.contains(&node))
    }

    // --- Lock-widening predicates ---

    fn overlaps_another_trigger(&self, trigger: usize, region: &[usize]) -> bool {
        for other in 0..self.triggers.len() {
            if other == trigger {
                continue;
            }
            let other_set = &self.scopes[other].downstream_set;
            if region
                .iter()
                .any(|n| *n != self.published_output_node && other_set.contains(n))
            {
                return true;
            }
        }
        false
    }

    /// Whether the trigger has a scatter downstream that another trigger
    /// partially overlaps. The check is an over-approximation: any overlap
    /// anywhere downstream counts. Widening the lock set is always safe.
    pub fn has_scatter_partially_overlapped_by_another_trigger(&self, trigger: usize) -> bool {
        let scope = &self.scopes[trigger];
        let has_scatter = scope.immediate.len() > 1
            || scope.real_out_degree.values().any(|d| *d > 1);
        if !has_scatter {
            return false;
        }
        self.overlaps_another_trigger(trigger, &scope.downstream)
    }

    /// Same check, scoped to a scatter at one node.
    pub fn has_scatter_at_node_partially_overlapped_by_another_trigger(
        &self,
        trigger: usize,
        node: usize,
    ) -> bool {
        let scope = &self.scopes[trigger];
        if scope.real_out_degree.get(&node).copied().unwrap_or(0) <= 1 {
            return false;
        }
        let region = self.nodes_downstream_of_node(trigger, node);
        self.overlaps_another_trigger(trigger, &region)
    }

    /// Whether a spin-off trigger reachable from this trigger shares
    /// downstream nodes with it.
    pub fn has_overlap_with_spin_off(&self, trigger: usize) -> bool {
        let scope = &self.scopes[trigger];
        for node in &scope.downstream {
            if !self.spin_off_node[*node] {
                continue;
            }
            for other in &self.triggers_on_node[*node] {
                if *other == trigger {
                    continue;
                }
                let other_scope = &self.scopes[*other];
                if scope
                    .downstream
                    .iter()
                    .any(|n| {
                        *n != self.published_output_node
                            && other_scope.downstream_set.contains(n)
                    })
                {
                    return true;
                }
            }
        }
        false
    }

    // --- Data-only transmission ---

    pub fn may_transmit_data_only(&self, node: usize) -> bool {
        self.data_only_transmitter[node]
    }

    pub fn data_only_downstream(&self, node: usize) -> &[usize] {
        &self.data_only_downstream[node]
    }

    pub fn data_only_sources(&self) -> &[usize] {
        &self.data_only_sources
    }

    // --- Thread estimates ---

    /// Thread budget for a trigger's worker: at least one, at most one per
    /// chain that could run concurrently.
    pub fn worker_threads_for_trigger(&self, trigger: usize) -> (i64, i64) {
        (1, self.scopes[trigger].chains.len().max(1) as i64)
    }

    pub fn worker_threads_for_chain(&self, _trigger: usize, _chain: usize) -> (i64, i64) {
        (1, 1)
    }
}
