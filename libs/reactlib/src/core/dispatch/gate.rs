// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Admission control: concurrency gates, trigger-mode pending tracking, and
//! cooperative cancellation tokens.

use crate::core::binding::{BindingId, ConcurrencyLimit, TriggerMode};
use crate::core::error::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};

// ---------------------------------------------------------------------------
// CancellationToken — shared cancellation signal
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation token observed at suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake async observers.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyGates — counting gates shared across bindings
// ---------------------------------------------------------------------------

struct Gate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Maps a `concurrency_id` to a shared counting gate. Admission is FIFO once
/// a gate is saturated (tokio semaphores queue waiters in arrival order).
pub struct ConcurrencyGates {
    default_limit: usize,
    gates: Mutex<HashMap<String, Gate>>,
}

impl ConcurrencyGates {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: default_limit.max(1),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a slot for an invocation. Returns `None` for unbounded
    /// bindings; otherwise waits for a permit on the shared gate.
    pub async fn acquire(
        &self,
        concurrency_id: &str,
        limit: ConcurrencyLimit,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        let resolved = match limit {
            ConcurrencyLimit::Unbounded => return Ok(None),
            ConcurrencyLimit::Default => self.default_limit,
            ConcurrencyLimit::Limit(0) => {
                return Err(EngineError::Config(
                    "concurrency_limit must be at least 1".into(),
                ))
            }
            ConcurrencyLimit::Limit(n) => n,
        };

        let semaphore = {
            let mut gates = self.gates.lock();
            let gate = gates.entry(concurrency_id.to_string()).or_insert_with(|| Gate {
                semaphore: Arc::new(Semaphore::new(resolved)),
                limit: resolved,
            });
            if gate.limit != resolved {
                tracing::warn!(
                    "Concurrency gate '{}' sized {} ignores conflicting limit {}",
                    concurrency_id,
                    gate.limit,
                    resolved
                );
            }
            Arc::clone(&gate.semaphore)
        };

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Cancelled("concurrency gate closed".into()))?;
        Ok(Some(permit))
    }
}

// ---------------------------------------------------------------------------
// PendingTracker — trigger-mode admission and cancel targets
// ---------------------------------------------------------------------------

type PendingKey = (BindingId, String);

#[derive(Default)]
struct PendingEntry {
    running: usize,
    /// `always_last` slot: only the most recently queued submission waits
    /// here; replacing the sender discards the superseded waiter.
    queued: Option<oneshot::Sender<()>>,
    tokens: Vec<CancellationToken>,
}

impl PendingEntry {
    fn is_idle(&self) -> bool {
        self.running == 0 && self.queued.is_none() && self.tokens.is_empty()
    }
}

/// Tracks in-flight invocations per (binding, session) for trigger-mode
/// admission, the `is_pending` query, and cancellation fan-out.
#[derive(Default)]
pub struct PendingTracker {
    inner: Mutex<HashMap<PendingKey, PendingEntry>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, binding: BindingId, session_key: &str) -> bool {
        self.inner
            .lock()
            .get(&(binding, session_key.to_string()))
            .map(|e| e.running > 0)
            .unwrap_or(false)
    }

    /// Admit a submission under the binding's trigger mode. Resolves to a
    /// guard that must live for the whole invocation.
    pub async fn admit(
        self: &Arc<Self>,
        binding: BindingId,
        session_key: &str,
        mode: TriggerMode,
    ) -> Result<PendingGuard> {
        let key = (binding, session_key.to_string());
        let token = CancellationToken::new();

        match mode {
            TriggerMode::Once => {
                let mut inner = self.inner.lock();
                let entry = inner.entry(key.clone()).or_default();
                if entry.running > 0 {
                    return Err(EngineError::Pending(binding.to_string()));
                }
                entry.running = 1;
                entry.tokens.push(token.clone());
            }
            TriggerMode::Multiple => {
                let mut inner = self.inner.lock();
                let entry = inner.entry(key.clone()).or_default();
                entry.running += 1;
                entry.tokens.push(token.clone());
            }
            TriggerMode::AlwaysLast => {
                let waiter = {
                    let mut inner = self.inner.lock();
                    let entry = inner.entry(key.clone()).or_default();
                    if entry.running == 0 {
                        entry.running = 1;
                        entry.tokens.push(token.clone());
                        None
                    } else {
                        let (tx, rx) = oneshot::channel();
                        // Dropping a previously queued sender resolves that
                        // waiter as superseded.
                        entry.queued = Some(tx);
                        Some(rx)
                    }
                };
                if let Some(rx) = waiter {
                    match rx.await {
                        Ok(()) => {
                            // The finished invocation handed its running
                            // slot to us.
                            let mut inner = self.inner.lock();
                            let entry = inner.entry(key.clone()).or_default();
                            entry.tokens.push(token.clone());
                        }
                        Err(_) => {
                            return Err(EngineError::Cancelled(
                                "superseded by a newer submission".into(),
                            ))
                        }
                    }
                }
            }
        }

        Ok(PendingGuard {
            tracker: Arc::clone(self),
            key,
            token,
        })
    }

    /// Request cooperative cancellation of every in-flight invocation of
    /// `binding` within the session.
    pub fn request_cancel(&self, binding: BindingId, session_key: &str) {
        let inner = self.inner.lock();
        if let Some(entry) = inner.get(&(binding, session_key.to_string())) {
            for token in &entry.tokens {
                token.cancel();
            }
        }
    }

    fn release(&self, key: &PendingKey, token: &CancellationToken) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(key) else {
            return;
        };
        entry.tokens.retain(|t| !t.ptr_eq(token));
        // Hand the running slot to the queued always_last waiter.
        let handed_over = match entry.queued.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };
        if !handed_over {
            entry.running = entry.running.saturating_sub(1);
        }
        if entry.is_idle() {
            inner.remove(key);
        }
    }
}

/// Live-invocation guard; releasing it (or dropping it) frees the pending
/// slot and hands over to a queued `always_last` submission.
pub struct PendingGuard {
    tracker: Arc<PendingTracker>,
    key: PendingKey,
    token: CancellationToken,
}

impl PendingGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.key, &self.token);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_cancelled_wakes_waiters() {
        let token = CancellationToken::new();
        let observer = token.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_gate_bounds_concurrent_permits() {
        let gates = ConcurrencyGates::new(1);
        let first = gates
            .acquire("shared", ConcurrencyLimit::Limit(2))
            .await
            .unwrap();
        let second = gates
            .acquire("shared", ConcurrencyLimit::Limit(2))
            .await
            .unwrap();
        assert!(first.is_some() && second.is_some());

        // Third must wait until a permit frees up.
        let third = tokio::time::timeout(
            Duration::from_millis(50),
            gates.acquire("shared", ConcurrencyLimit::Limit(2)),
        )
        .await;
        assert!(third.is_err());

        drop(first);
        let third = gates
            .acquire("shared", ConcurrencyLimit::Limit(2))
            .await
            .unwrap();
        assert!(third.is_some());
        drop(second);
    }

    #[tokio::test]
    async fn test_unbounded_needs_no_permit() {
        let gates = ConcurrencyGates::new(1);
        let permit = gates
            .acquire("free", ConcurrencyLimit::Unbounded)
            .await
            .unwrap();
        assert!(permit.is_none());
    }

    #[tokio::test]
    async fn test_once_rejects_while_pending() {
        let tracker = Arc::new(PendingTracker::new());
        let guard = tracker
            .admit(BindingId(1), "s", TriggerMode::Once)
            .await
            .unwrap();
        assert!(tracker.is_pending(BindingId(1), "s"));

        let rejected = tracker.admit(BindingId(1), "s", TriggerMode::Once).await;
        assert!(matches!(rejected, Err(EngineError::Pending(_))));

        drop(guard);
        assert!(!tracker.is_pending(BindingId(1), "s"));
        let admitted = tracker.admit(BindingId(1), "s", TriggerMode::Once).await;
        assert!(admitted.is_ok());
    }

    #[tokio::test]
    async fn test_always_last_discards_superseded() {
        let tracker = Arc::new(PendingTracker::new());
        let running = tracker
            .admit(BindingId(2), "s", TriggerMode::AlwaysLast)
            .await
            .unwrap();

        let t2 = Arc::clone(&tracker);
        let second = tokio::spawn(async move {
            t2.admit(BindingId(2), "s", TriggerMode::AlwaysLast).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let t3 = Arc::clone(&tracker);
        let third = tokio::spawn(async move {
            t3.admit(BindingId(2), "s", TriggerMode::AlwaysLast).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The second submission was superseded by the third.
        let superseded = second.await.unwrap();
        assert!(matches!(superseded, Err(EngineError::Cancelled(_))));

        drop(running);
        let resumed = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap();
        assert!(resumed.is_ok());
        assert!(tracker.is_pending(BindingId(2), "s"));
    }

    #[tokio::test]
    async fn test_request_cancel_reaches_tokens() {
        let tracker = Arc::new(PendingTracker::new());
        let guard = tracker
            .admit(BindingId(3), "s", TriggerMode::Multiple)
            .await
            .unwrap();
        let token = guard.token();
        assert!(!token.is_cancelled());

        tracker.request_cancel(BindingId(3), "s");
        assert!(token.is_cancelled());

        // Other sessions are untouched.
        let other = tracker
            .admit(BindingId(3), "other", TriggerMode::Multiple)
            .await
            .unwrap();
        tracker.request_cancel(BindingId(3), "s");
        assert!(!other.token().is_cancelled());
    }
}
