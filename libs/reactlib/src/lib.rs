// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Suppress pedantic clippy warnings that are intentional design choices
#![allow(clippy::too_many_arguments)] // Some APIs need many parameters (e.g., run wiring)
#![allow(clippy::type_complexity)] // Complex types are clear in context

pub mod core;

pub use crate::core::{
    fingerprint,
    markers,
    BindingId,
    BindingMetrics,
    BindingRegistry,
    BindingSpec,
    BoundFunction,
    ChunkSender,
    Component,
    ComponentNode,
    ConcurrencyLimit,
    DispatchOutput,
    DispatchRequest,
    Dispatcher,
    EngineConfig,
    EngineError,
    EventBinding,
    EventTarget,
    NodeId,
    OutputValue,
    RenderScope,
    Result,
    RunId,
    SessionStore,
    StreamingConfig,
    TriggerMode,
    Value,
};

pub mod prelude {
    pub use crate::core::prelude::*;
}
