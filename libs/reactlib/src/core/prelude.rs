// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Commonly used types for `use reactlib::prelude::*`.

pub use crate::core::{
    // Errors
    error::{EngineError, Result},

    // Graph
    binding::{BindingId, BindingSpec, BoundFunction, EventTarget, TriggerMode},
    component::{Component, NodeId},
    context::RenderScope,
    registry::BindingRegistry,

    // Dispatch
    dispatch::{DispatchOutput, DispatchRequest, Dispatcher},
    value::OutputValue,
};
