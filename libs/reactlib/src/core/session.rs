// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-connection session state: stateful node values plus a shadow of the
//! last-exported node configurations.

use crate::core::component::NodeId;
use crate::core::value::Value;
use parking_lot::Mutex;
use serde_json::Map;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Mutable per-session state. Shared only within one session; concurrent
/// invocations in the same session race on stateful entries and must be
/// serialized by the caller if strict consistency is required.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Current value per stateful node (plus nodes replaced by an update
    /// descriptor carrying a value).
    pub state: HashMap<NodeId, Value>,
    /// Last-exported configuration per node, diffed after mutations to know
    /// what must be re-sent downstream.
    pub config_shadow: HashMap<NodeId, Map<String, Value>>,
}

impl SessionState {
    /// Merge an update descriptor's field delta into the node's shadow.
    pub fn apply_patch(&mut self, node: NodeId, fields: &Map<String, Value>) {
        let shadow = self.config_shadow.entry(node).or_default();
        for (k, v) in fields {
            shadow.insert(k.clone(), v.clone());
        }
    }
}

/// Handle to one live session.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub state: Mutex<SessionState>,
}

impl SessionHandle {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            state: Mutex::new(SessionState::default()),
        }
    }
}

struct StoreInner {
    sessions: HashMap<String, Arc<SessionHandle>>,
    /// Least-recently-used at the front.
    order: VecDeque<String>,
}

/// Store of live sessions, evicting least-recently-used beyond capacity.
pub struct SessionStore {
    capacity: usize,
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(StoreInner {
                sessions: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Fetch (and touch) a session, creating it on first use. Returns the
    /// ids of any sessions evicted to make room.
    pub fn get_or_create(&self, session_id: &str) -> (Arc<SessionHandle>, Vec<String>) {
        let mut inner = self.inner.lock();

        if inner.sessions.contains_key(session_id) {
            inner.order.retain(|s| s != session_id);
            inner.order.push_back(session_id.to_string());
            return (Arc::clone(&inner.sessions[session_id]), Vec::new());
        }

        let handle = Arc::new(SessionHandle::new(session_id.to_string()));
        inner
            .sessions
            .insert(session_id.to_string(), Arc::clone(&handle));
        inner.order.push_back(session_id.to_string());

        let mut evicted = Vec::new();
        while inner.sessions.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.sessions.remove(&oldest);
                tracing::debug!("Evicting least-recently-used session {}", oldest);
                evicted.push(oldest);
            }
        }

        (handle, evicted)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    /// Drop a session at connection end.
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let mut inner = self.inner.lock();
        inner.order.retain(|s| s != session_id);
        inner.sessions.remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
