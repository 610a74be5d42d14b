// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-binding invocation timing for observability.

use crate::core::binding::BindingId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
struct BindingStats {
    invocations: u64,
    total: Duration,
}

/// Records duration and a running average per binding.
#[derive(Debug, Default)]
pub struct BindingMetrics {
    inner: Mutex<HashMap<BindingId, BindingStats>>,
}

impl BindingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one invocation and return the updated running average.
    pub fn record(&self, binding: BindingId, duration: Duration) -> Duration {
        let mut inner = self.inner.lock();
        let stats = inner.entry(binding).or_default();
        stats.invocations += 1;
        stats.total += duration;
        stats.total / stats.invocations as u32
    }

    pub fn average(&self, binding: BindingId) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .get(&binding)
            .filter(|s| s.invocations > 0)
            .map(|s| s.total / s.invocations as u32)
    }

    pub fn invocations(&self, binding: BindingId) -> u64 {
        self.inner
            .lock()
            .get(&binding)
            .map(|s| s.invocations)
            .unwrap_or(0)
    }
}
