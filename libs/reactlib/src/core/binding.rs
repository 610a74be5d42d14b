// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Event bindings: the unit of reactivity linking a component event to a
//! bound callable with its input/output nodes and admission policy.

use crate::core::component::NodeId;
use crate::core::error::Result;
use crate::core::stream::ChunkSender;
use crate::core::value::{OutputValue, Value};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Well-known event names.
pub mod events {
    /// Fired when a stateful node's value changes; drives dependent-binding
    /// notification through `changed_state_ids`.
    pub const CHANGE: &str = "change";
    pub const CLICK: &str = "click";
    pub const SUBMIT: &str = "submit";
    pub const LOAD: &str = "load";
}

/// Registry-scoped binding identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingId(pub usize);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding_{}", self.0)
    }
}

/// A trigger: a component (or none, for app-level events) plus event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTarget {
    pub node: Option<NodeId>,
    pub event: String,
}

impl EventTarget {
    pub fn new(node: NodeId, event: impl Into<String>) -> Self {
        Self {
            node: Some(node),
            event: event.into(),
        }
    }

    /// App-level trigger with no source component (e.g. page load).
    pub fn app(event: impl Into<String>) -> Self {
        Self {
            node: None,
            event: event.into(),
        }
    }
}

/// Repeat-submission admission policy while an invocation is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Reject new submissions while one is pending.
    #[default]
    Once,
    /// Admit unlimited concurrent submissions.
    Multiple,
    /// Queue only the most recent submission; discard superseded ones.
    AlwaysLast,
}

/// Bound on simultaneous in-flight invocations sharing a concurrency id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyLimit {
    /// Resolve to the process-wide default limit.
    #[default]
    Default,
    /// No gate at all.
    Unbounded,
    Limit(usize),
}

/// Streaming parameters for generator-backed bindings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamingConfig {
    /// Wall-clock bound on a whole run; observed cooperatively at the next
    /// chunk pull after expiry.
    pub time_limit: Option<Duration>,
    /// Minimum interval between successive media chunk deliveries.
    pub stream_every: Option<Duration>,
}

pub type SyncFn = dyn Fn(Vec<Value>) -> Result<Vec<OutputValue>> + Send + Sync;
pub type AsyncFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Vec<OutputValue>>> + Send + Sync;
pub type GeneratorFn = dyn Fn(Vec<Value>, ChunkSender) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// The callable a binding dispatches to.
///
/// Sync callables run on the bounded worker pool; async callables run inline
/// on the event loop; generators produce chunks through a bounded channel
/// that the pipeline pulls one item at a time.
#[derive(Clone)]
pub enum BoundFunction {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
    Generator(Arc<GeneratorFn>),
}

impl BoundFunction {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Vec<OutputValue>> + Send + Sync + 'static,
    {
        BoundFunction::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Vec<OutputValue>>> + Send + 'static,
    {
        BoundFunction::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn generator<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>, ChunkSender) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        BoundFunction::Generator(Arc::new(move |args, tx| Box::pin(f(args, tx))))
    }

    pub fn is_generator(&self) -> bool {
        matches!(self, BoundFunction::Generator(_))
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            BoundFunction::Sync(_) => "Sync",
            BoundFunction::Async(_) => "Async",
            BoundFunction::Generator(_) => "Generator",
        };
        write!(f, "BoundFunction::{}", kind)
    }
}

/// Declaration-time description of a binding, registered with
/// [`BindingRegistry::register`](crate::core::registry::BindingRegistry::register).
#[derive(Clone, Default)]
pub struct BindingSpec {
    pub targets: Vec<EventTarget>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    /// Absent for pure relay bindings with frontend-only effects.
    pub function: Option<BoundFunction>,
    pub batch: bool,
    pub max_batch_size: usize,
    /// Defaults to an id derived from the binding when empty.
    pub concurrency_id: Option<String>,
    pub concurrency_limit: ConcurrencyLimit,
    pub trigger_mode: TriggerMode,
    pub cancels: Vec<BindingId>,
    pub trigger_after: Option<BindingId>,
    pub trigger_only_on_success: bool,
    pub streaming: StreamingConfig,
    /// Stable re-render key: re-registration with the same key reuses the
    /// prior binding id.
    pub key: Option<String>,
}

impl BindingSpec {
    pub fn new(
        targets: Vec<EventTarget>,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeId>,
        function: Option<BoundFunction>,
    ) -> Self {
        Self {
            targets,
            inputs,
            outputs,
            function,
            max_batch_size: 4,
            ..Default::default()
        }
    }

    /// Single-target shorthand.
    pub fn on(
        node: NodeId,
        event: impl Into<String>,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeId>,
        function: Option<BoundFunction>,
    ) -> Self {
        Self::new(vec![EventTarget::new(node, event)], inputs, outputs, function)
    }
}

/// A registered event binding.
#[derive(Debug, Clone)]
pub struct EventBinding {
    pub id: BindingId,
    pub targets: Vec<EventTarget>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    pub function: Option<BoundFunction>,
    pub batch: bool,
    pub max_batch_size: usize,
    pub concurrency_id: String,
    pub concurrency_limit: ConcurrencyLimit,
    pub trigger_mode: TriggerMode,
    pub cancels: Vec<BindingId>,
    pub trigger_after: Option<BindingId>,
    pub trigger_only_on_success: bool,
    pub streaming: StreamingConfig,
    pub key: Option<String>,
}

impl EventBinding {
    pub fn is_generator(&self) -> bool {
        self.function.as_ref().is_some_and(BoundFunction::is_generator)
    }

    /// True if this binding listens for `event` on `node`.
    pub fn listens_on(&self, node: NodeId, event: &str) -> bool {
        self.targets
            .iter()
            .any(|t| t.node == Some(node) && t.event == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_mode_default() {
        assert_eq!(TriggerMode::default(), TriggerMode::Once);
    }

    #[test]
    fn test_bound_function_kinds() {
        let sync = BoundFunction::sync(|args| Ok(vec![OutputValue::Value(json!(args.len()))]));
        assert!(!sync.is_generator());

        let generator = BoundFunction::generator(|_args, _tx| async { Ok(()) });
        assert!(generator.is_generator());
        assert_eq!(format!("{:?}", generator), "BoundFunction::Generator");
    }

    #[test]
    fn test_spec_single_target_shorthand() {
        let spec = BindingSpec::on(NodeId(1), events::CLICK, vec![NodeId(2)], vec![NodeId(3)], None);
        assert_eq!(spec.targets.len(), 1);
        assert_eq!(spec.targets[0].node, Some(NodeId(1)));
        assert_eq!(spec.targets[0].event, events::CLICK);
        assert_eq!(spec.trigger_mode, TriggerMode::Once);
    }
}
