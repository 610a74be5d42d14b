// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Binding registry: owns the component graph and the event bindings,
//! assigns stable integer ids, and supports structural merges when
//! sub-graphs are mounted.

use crate::core::binding::{events, BindingId, BindingSpec, EventBinding};
use crate::core::component::{Component, ComponentNode, NodeId};
use crate::core::context::RenderScope;
use crate::core::error::{EngineError, Result};
use crate::core::value::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Owns nodes and bindings for one application graph.
#[derive(Default)]
pub struct BindingRegistry {
    nodes: HashMap<NodeId, ComponentNode>,
    bindings: HashMap<BindingId, EventBinding>,
    /// Stable re-render key to binding id, consulted at registration time.
    key_to_id: HashMap<String, BindingId>,
    /// Nodes with at least one binding listening on their change event.
    change_listeners: HashSet<NodeId>,
    next_node_id: usize,
    next_binding_id: usize,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Declare a node inside the given render scope. The node attaches to
    /// the scope's current parent and page.
    pub fn add_node(&mut self, scope: &RenderScope, component: Arc<dyn Component>) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;

        let parent = scope.current_parent();
        let node = ComponentNode {
            id,
            parent,
            children: Vec::new(),
            page: scope.page().to_string(),
            rendered: true,
            component,
        };

        if let Some(parent_id) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                parent_node.children.push(id);
            }
        }

        self.nodes.insert(id, node);
        id
    }

    pub fn get_node(&self, id: NodeId) -> Option<&ComponentNode> {
        self.nodes.get(&id)
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Detach a node from its parent without destroying it. Bindings that
    /// reference the node keep working.
    pub fn unrender_node(&mut self, id: NodeId) -> Result<()> {
        let parent = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.rendered = false;
                node.parent.take()
            }
            None => return Err(EngineError::Graph(format!("{} does not exist", id))),
        };
        if let Some(parent_id) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                parent_node.children.retain(|c| *c != id);
            }
        }
        Ok(())
    }

    /// Exported configuration snapshots for every rendered node, ordered by
    /// id. The session config shadow diffs against these after mutations.
    pub fn export_config(&self) -> Vec<(NodeId, serde_json::Map<String, Value>)> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                let node = &self.nodes[&id];
                node.rendered.then(|| (id, node.config_snapshot()))
            })
            .collect()
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    /// Register a binding. Re-registration with an existing `key` reuses the
    /// prior binding id, so in-flight client references survive a re-render.
    pub fn register(&mut self, spec: BindingSpec) -> Result<BindingId> {
        self.validate_spec(&spec)?;

        let id = match spec.key.as_deref().and_then(|k| self.key_to_id.get(k)) {
            Some(&existing) => {
                tracing::debug!("Reusing {} for key {:?}", existing, spec.key);
                existing
            }
            None => {
                let id = BindingId(self.next_binding_id);
                self.next_binding_id += 1;
                if let Some(key) = &spec.key {
                    self.key_to_id.insert(key.clone(), id);
                }
                id
            }
        };

        let concurrency_id = spec
            .concurrency_id
            .clone()
            .unwrap_or_else(|| id.to_string());

        let binding = EventBinding {
            id,
            targets: spec.targets,
            inputs: spec.inputs,
            outputs: spec.outputs,
            function: spec.function,
            batch: spec.batch,
            max_batch_size: spec.max_batch_size,
            concurrency_id,
            concurrency_limit: spec.concurrency_limit,
            trigger_mode: spec.trigger_mode,
            cancels: spec.cancels,
            trigger_after: spec.trigger_after,
            trigger_only_on_success: spec.trigger_only_on_success,
            streaming: spec.streaming,
            key: spec.key,
        };

        for target in &binding.targets {
            if let Some(node) = target.node {
                if target.event == events::CHANGE {
                    self.change_listeners.insert(node);
                }
            }
        }

        self.bindings.insert(id, binding);
        Ok(id)
    }

    fn validate_spec(&self, spec: &BindingSpec) -> Result<()> {
        for id in spec.inputs.iter().chain(&spec.outputs) {
            if !self.nodes.contains_key(id) {
                return Err(EngineError::Graph(format!(
                    "Binding references unknown {}",
                    id
                )));
            }
        }
        for target in &spec.targets {
            if let Some(id) = target.node {
                if !self.nodes.contains_key(&id) {
                    return Err(EngineError::Graph(format!(
                        "Binding targets unknown {}",
                        id
                    )));
                }
            }
        }
        for id in &spec.cancels {
            if !self.bindings.contains_key(id) {
                return Err(EngineError::Graph(format!("Cancel set names unknown {}", id)));
            }
        }
        if let Some(id) = spec.trigger_after {
            if !self.bindings.contains_key(&id) {
                return Err(EngineError::Graph(format!(
                    "trigger_after names unknown {}",
                    id
                )));
            }
        }
        if spec.batch {
            if spec.max_batch_size == 0 {
                return Err(EngineError::Config("max_batch_size must be at least 1".into()));
            }
            if spec.function.as_ref().is_some_and(|f| f.is_generator()) {
                return Err(EngineError::Config(
                    "Generator callables cannot run in batch mode".into(),
                ));
            }
            for id in &spec.outputs {
                if self.nodes.get(id).is_some_and(|n| n.is_stateful()) {
                    return Err(EngineError::Config(format!(
                        "Batch bindings cannot target stateful {}",
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn lookup(&self, id: BindingId) -> Result<&EventBinding> {
        self.bindings
            .get(&id)
            .ok_or_else(|| EngineError::Graph(format!("{} does not exist", id)))
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Whether any binding listens on this node's change event.
    pub fn has_change_listener(&self, node: NodeId) -> bool {
        self.change_listeners.contains(&node)
    }

    /// Bindings chained after `id` via `trigger_after`, filtered by whether
    /// the triggering invocation succeeded.
    pub fn successors_of(&self, id: BindingId, success: bool) -> Vec<BindingId> {
        let mut out: Vec<BindingId> = self
            .bindings
            .values()
            .filter(|b| b.trigger_after == Some(id) && (success || !b.trigger_only_on_success))
            .map(|b| b.id)
            .collect();
        out.sort();
        out
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Mount a sub-registry, re-indexing its node and binding ids by a
    /// computed offset and re-pointing every cross-reference. Sub-bindings
    /// whose key already exists here reuse the prior binding id.
    pub fn merge(&mut self, sub: BindingRegistry) -> Result<()> {
        let node_offset = self.next_node_id;

        // First pass: final id for every sub binding (keyed ones reuse).
        let mut binding_map: HashMap<BindingId, BindingId> = HashMap::new();
        let mut sub_binding_ids: Vec<BindingId> = sub.bindings.keys().copied().collect();
        sub_binding_ids.sort();
        for old_id in &sub_binding_ids {
            let binding = &sub.bindings[old_id];
            let new_id = match binding.key.as_deref().and_then(|k| self.key_to_id.get(k)) {
                Some(&existing) => existing,
                None => {
                    let id = BindingId(self.next_binding_id);
                    self.next_binding_id += 1;
                    id
                }
            };
            binding_map.insert(*old_id, new_id);
        }

        let remap_node = |id: NodeId| NodeId(id.0 + node_offset);
        let remap_binding = |id: BindingId| -> Result<BindingId> {
            binding_map
                .get(&id)
                .copied()
                .ok_or_else(|| EngineError::Graph(format!("Merge references unknown {}", id)))
        };

        let mut sub_node_ids: Vec<NodeId> = sub.nodes.keys().copied().collect();
        sub_node_ids.sort();
        for old_id in sub_node_ids {
            let mut node = sub.nodes[&old_id].clone();
            node.id = remap_node(node.id);
            node.parent = node.parent.map(remap_node);
            node.children = node.children.into_iter().map(remap_node).collect();
            self.nodes.insert(node.id, node);
        }
        self.next_node_id += sub.next_node_id;

        for old_id in sub_binding_ids {
            let mut binding = sub.bindings[&old_id].clone();
            binding.id = binding_map[&old_id];
            binding.inputs = binding.inputs.into_iter().map(remap_node).collect();
            binding.outputs = binding.outputs.into_iter().map(remap_node).collect();
            for target in &mut binding.targets {
                target.node = target.node.map(remap_node);
            }
            binding.cancels = binding
                .cancels
                .into_iter()
                .map(remap_binding)
                .collect::<Result<Vec<_>>>()?;
            binding.trigger_after = binding.trigger_after.map(remap_binding).transpose()?;
            // Derived default concurrency ids track the re-indexed id.
            if binding.concurrency_id == old_id.to_string() {
                binding.concurrency_id = binding.id.to_string();
            }
            if let Some(key) = &binding.key {
                self.key_to_id.insert(key.clone(), binding.id);
            }
            for target in &binding.targets {
                if let Some(node) = target.node {
                    if target.event == events::CHANGE {
                        self.change_listeners.insert(node);
                    }
                }
            }
            self.bindings.insert(binding.id, binding);
        }

        // Post-merge structural check: every reference must resolve.
        for binding in self.bindings.values() {
            for id in binding.inputs.iter().chain(&binding.outputs) {
                if !self.nodes.contains_key(id) {
                    return Err(EngineError::Graph(format!(
                        "{} references missing {} after merge",
                        binding.id, id
                    )));
                }
            }
        }

        tracing::info!(
            "Merged sub-registry: {} nodes, {} bindings total",
            self.node_count(),
            self.binding_count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::binding::BoundFunction;
    use crate::core::value::OutputValue;
    use serde_json::json;

    struct Plain;

    impl Component for Plain {
        fn type_name(&self) -> &str {
            "plain"
        }
    }

    fn registry_with_nodes(n: usize) -> (BindingRegistry, Vec<NodeId>) {
        let mut registry = BindingRegistry::new();
        let scope = RenderScope::new("main");
        let ids = (0..n)
            .map(|_| registry.add_node(&scope, Arc::new(Plain)))
            .collect();
        (registry, ids)
    }

    fn noop() -> Option<BoundFunction> {
        Some(BoundFunction::sync(|_| Ok(vec![OutputValue::Value(json!(null))])))
    }

    #[test]
    fn test_monotonic_node_ids() {
        let (_, ids) = registry_with_nodes(3);
        assert_eq!(ids, vec![NodeId(0), NodeId(1), NodeId(2)]);
    }

    #[test]
    fn test_scope_parents_children() {
        let mut registry = BindingRegistry::new();
        let mut scope = RenderScope::new("main");
        let root = registry.add_node(&scope, Arc::new(Plain));
        scope.enter(root);
        let child = registry.add_node(&scope, Arc::new(Plain));
        scope.exit();

        assert_eq!(registry.get_node(child).unwrap().parent, Some(root));
        assert_eq!(registry.get_node(root).unwrap().children, vec![child]);
    }

    #[test]
    fn test_register_rejects_unknown_nodes() {
        let (mut registry, ids) = registry_with_nodes(1);
        let spec = BindingSpec::on(ids[0], events::CLICK, vec![NodeId(99)], vec![], noop());
        assert!(matches!(registry.register(spec), Err(EngineError::Graph(_))));
    }

    #[test]
    fn test_key_reuse_preserves_binding_id() {
        let (mut registry, ids) = registry_with_nodes(2);
        let mut spec = BindingSpec::on(ids[0], events::CLICK, vec![ids[1]], vec![], noop());
        spec.key = Some("submit-row".into());
        let first = registry.register(spec.clone()).unwrap();
        let second = registry.register(spec).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.binding_count(), 1);
    }

    #[test]
    fn test_generator_in_batch_rejected() {
        let (mut registry, ids) = registry_with_nodes(1);
        let mut spec = BindingSpec::on(
            ids[0],
            events::CLICK,
            vec![],
            vec![],
            Some(BoundFunction::generator(|_args, _tx| async { Ok(()) })),
        );
        spec.batch = true;
        assert!(matches!(registry.register(spec), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_unrender_keeps_node_for_bindings() {
        let (mut registry, ids) = registry_with_nodes(2);
        let spec = BindingSpec::on(ids[0], events::CLICK, vec![ids[1]], vec![], noop());
        let binding = registry.register(spec).unwrap();

        registry.unrender_node(ids[1]).unwrap();
        assert!(registry.has_node(ids[1]));
        assert!(!registry.get_node(ids[1]).unwrap().rendered);
        assert_eq!(registry.lookup(binding).unwrap().inputs, vec![ids[1]]);
    }

    #[test]
    fn test_merge_reindexes_references() {
        let (mut main, _main_ids) = registry_with_nodes(2);

        let (mut sub, sub_ids) = registry_with_nodes(2);
        let first = sub
            .register(BindingSpec::on(sub_ids[0], events::CLICK, vec![sub_ids[1]], vec![], noop()))
            .unwrap();
        let mut chained = BindingSpec::on(sub_ids[1], events::CLICK, vec![], vec![], noop());
        chained.cancels = vec![first];
        chained.trigger_after = Some(first);
        sub.register(chained).unwrap();

        main.merge(sub).unwrap();
        assert_eq!(main.node_count(), 4);
        assert_eq!(main.binding_count(), 2);

        // Sub node 0/1 became node 2/3; the chained binding's references
        // moved with the first binding.
        let moved_first = main.lookup(BindingId(0)).unwrap();
        assert_eq!(moved_first.inputs, vec![NodeId(3)]);
        let moved_chained = main.lookup(BindingId(1)).unwrap();
        assert_eq!(moved_chained.cancels, vec![BindingId(0)]);
        assert_eq!(moved_chained.trigger_after, Some(BindingId(0)));
    }

    #[test]
    fn test_merge_key_reuse() {
        let (mut main, main_ids) = registry_with_nodes(1);
        let mut spec = BindingSpec::on(main_ids[0], events::CLICK, vec![], vec![], noop());
        spec.key = Some("stable".into());
        let original = main.register(spec).unwrap();

        let (mut sub, sub_ids) = registry_with_nodes(1);
        let mut re_spec = BindingSpec::on(sub_ids[0], events::CLICK, vec![], vec![], noop());
        re_spec.key = Some("stable".into());
        sub.register(re_spec).unwrap();

        main.merge(sub).unwrap();
        assert_eq!(main.binding_count(), 1);
        assert!(main.lookup(original).is_ok());
    }

    #[test]
    fn test_successors_respect_success_flag() {
        let (mut registry, ids) = registry_with_nodes(1);
        let root = registry
            .register(BindingSpec::on(ids[0], events::CLICK, vec![], vec![], noop()))
            .unwrap();
        let mut after = BindingSpec::on(ids[0], events::CLICK, vec![], vec![], noop());
        after.trigger_after = Some(root);
        after.trigger_only_on_success = true;
        let after_id = registry.register(after).unwrap();

        assert_eq!(registry.successors_of(root, true), vec![after_id]);
        assert!(registry.successors_of(root, false).is_empty());
    }

    #[test]
    fn test_change_listener_index() {
        let (mut registry, ids) = registry_with_nodes(2);
        registry
            .register(BindingSpec::on(ids[0], events::CHANGE, vec![], vec![], noop()))
            .unwrap();
        assert!(registry.has_change_listener(ids[0]));
        assert!(!registry.has_change_listener(ids[1]));
    }
}
