// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Component nodes: graph identity plus the marshalling hooks the engine
//! needs from the rendering layer.

use crate::core::error::Result;
use crate::core::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Registry-scoped node identifier. Monotonically assigned; re-indexed by a
/// fixed offset when sub-registries are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// The shape the engine requires from a UI component.
///
/// Rendering, markup, and widget-specific serialization live outside the
/// engine; dispatch only needs the value transforms and the stateful flag.
pub trait Component: Send + Sync {
    /// Component type name used in exported configuration.
    fn type_name(&self) -> &str;

    /// If true, the component's value lives in session state rather than
    /// being passed fresh with each call.
    fn is_stateful(&self) -> bool {
        false
    }

    /// Transform a raw event payload into the callable-facing value.
    fn preprocess(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }

    /// Transform a callable result into the relay-facing value.
    fn postprocess(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }

    /// Representative value for non-interactive introspection.
    fn example_value(&self) -> Value {
        Value::Null
    }
}

/// A graph entity for one UI component: identity, tree position, page, and
/// the marshalling hooks.
#[derive(Clone)]
pub struct ComponentNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub page: String,
    /// Detached nodes stay in the registry while bindings reference them.
    pub rendered: bool,
    pub component: Arc<dyn Component>,
}

impl ComponentNode {
    pub fn is_stateful(&self) -> bool {
        self.component.is_stateful()
    }

    /// Configuration snapshot exported to the relay layer; the session's
    /// config shadow diffs against this after update descriptors land.
    pub fn config_snapshot(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), self.component.type_name().into());
        map.insert("page".into(), self.page.clone().into());
        map.insert(
            "parent".into(),
            self.parent.map(|p| p.0.into()).unwrap_or(Value::Null),
        );
        map.insert("rendered".into(), self.rendered.into());
        map
    }
}

impl fmt::Debug for ComponentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentNode")
            .field("id", &self.id)
            .field("type", &self.component.type_name())
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("page", &self.page)
            .field("rendered", &self.rendered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl Component for Probe {
        fn type_name(&self) -> &str {
            "probe"
        }
    }

    #[test]
    fn test_default_hooks_pass_through() {
        let probe = Probe;
        let value = serde_json::json!({"k": 1});
        assert_eq!(probe.preprocess(&value).unwrap(), value);
        assert_eq!(probe.postprocess(&value).unwrap(), value);
        assert!(!probe.is_stateful());
        assert_eq!(probe.example_value(), Value::Null);
    }

    #[test]
    fn test_config_snapshot_fields() {
        let node = ComponentNode {
            id: NodeId(3),
            parent: Some(NodeId(1)),
            children: vec![],
            page: "main".into(),
            rendered: true,
            component: Arc::new(Probe),
        };
        let snapshot = node.config_snapshot();
        assert_eq!(snapshot["type"], "probe");
        assert_eq!(snapshot["parent"], 1);
        assert_eq!(snapshot["rendered"], true);
    }
}
