// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Stream & diff registry: per-session, per-run tracking of generator
//! output.
//!
//! Generators produce through a capacity-1 bounded channel; the pipeline
//! pulls one chunk, postprocesses and delivers it, then pulls the next.
//! Production never buffers ahead of delivery.

use crate::core::binding::{BindingId, StreamingConfig};
use crate::core::component::NodeId;
use crate::core::dispatch::gate::{CancellationToken, PendingGuard};
use crate::core::error::{EngineError, Result};
use crate::core::value::{OutputValue, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;

/// Handle for one generator invocation run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(cuid2::create_id())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run_{}", self.0)
    }
}

/// Producer half handed to a generator callable.
#[derive(Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<Result<Vec<OutputValue>>>,
    cancel: CancellationToken,
}

impl ChunkSender {
    /// Emit one chunk. This is a suspension point: it waits until the
    /// pipeline has consumed the previous chunk, and it observes
    /// cancellation.
    pub async fn send(&self, chunk: Vec<OutputValue>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled("generator cancelled".into()));
        }
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| EngineError::Cancelled("generator output closed".into()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a pull produced.
pub enum PulledChunk {
    Chunk(Vec<OutputValue>),
    /// Generator exhausted normally.
    Finished,
    /// Generator raised; the invocation is failed.
    Failed(EngineError),
    /// Cancelled with nothing left in flight.
    Cancelled,
}

/// Book-keeping for one in-flight generator run.
pub struct PendingRun {
    pub binding: BindingId,
    pub session: Option<String>,
    rx: mpsc::Receiver<Result<Vec<OutputValue>>>,
    cancel: CancellationToken,
    started: Instant,
    last_delivery: Option<Instant>,
    pub chunks_delivered: u64,
    /// Accumulated media segments per output node.
    pub stream_state: HashMap<NodeId, Vec<Value>>,
    /// Last emitted value per output index, the diff baseline.
    pub diff_state: HashMap<usize, Value>,
    streaming: StreamingConfig,
    /// Held for the whole run so the concurrency gate counts generators
    /// until exhaustion.
    _permit: Option<OwnedSemaphorePermit>,
    _pending: PendingGuard,
}

impl PendingRun {
    /// Wire a new run: returns the producer half and the run record.
    pub fn channel(
        binding: BindingId,
        session: Option<String>,
        streaming: StreamingConfig,
        cancel: CancellationToken,
        permit: Option<OwnedSemaphorePermit>,
        pending: PendingGuard,
    ) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(1);
        let sender = ChunkSender {
            tx,
            cancel: cancel.clone(),
        };
        let run = Self {
            binding,
            session,
            rx,
            cancel,
            started: Instant::now(),
            last_delivery: None,
            chunks_delivered: 0,
            stream_state: HashMap::new(),
            diff_state: HashMap::new(),
            streaming,
            _permit: permit,
            _pending: pending,
        };
        (sender, run)
    }

    /// Pull the next chunk, honoring cancellation, the run's wall-clock
    /// limit, and the configured delivery pacing.
    pub async fn pull(&mut self) -> PulledChunk {
        // A chunk already produced before cancellation is still delivered.
        if self.cancel.is_cancelled() {
            return match self.rx.try_recv() {
                Ok(Ok(chunk)) => self.deliver(chunk).await,
                Ok(Err(error)) => PulledChunk::Failed(error),
                Err(_) => PulledChunk::Cancelled,
            };
        }

        let deadline = self
            .streaming
            .time_limit
            .map(|limit| self.started + limit);

        let received = match deadline {
            Some(deadline) => {
                tokio::select! {
                    received = self.rx.recv() => Some(received),
                    _ = tokio::time::sleep_until(deadline.into()) => None,
                    _ = self.cancel.cancelled() => None,
                }
            }
            None => {
                tokio::select! {
                    received = self.rx.recv() => Some(received),
                    _ = self.cancel.cancelled() => None,
                }
            }
        };

        match received {
            Some(Some(Ok(chunk))) => self.deliver(chunk).await,
            Some(Some(Err(error))) => PulledChunk::Failed(error),
            Some(None) => PulledChunk::Finished,
            // Timed out or cancelled: tear down, draining one in-flight
            // chunk if the producer had already committed it.
            None => {
                self.cancel.cancel();
                match self.rx.try_recv() {
                    Ok(Ok(chunk)) => self.deliver(chunk).await,
                    _ => PulledChunk::Cancelled,
                }
            }
        }
    }

    async fn deliver(&mut self, chunk: Vec<OutputValue>) -> PulledChunk {
        if let (Some(every), Some(last)) = (self.streaming.stream_every, self.last_delivery) {
            let elapsed = last.elapsed();
            if elapsed < every {
                tokio::time::sleep(every - elapsed).await;
            }
        }
        self.last_delivery = Some(Instant::now());
        self.chunks_delivered += 1;
        PulledChunk::Chunk(chunk)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// When the run was opened; the run's whole duration is recorded on
    /// exhaustion.
    pub fn started(&self) -> Instant {
        self.started
    }
}

/// Wrapper delivering a terminal error from the producer task.
pub struct ErrorSender {
    tx: mpsc::Sender<Result<Vec<OutputValue>>>,
}

impl ErrorSender {
    pub async fn send(self, error: EngineError) {
        let _ = self.tx.send(Err(error)).await;
    }
}

impl ChunkSender {
    /// Split off a terminal-error sender for the producer wrapper task.
    pub fn error_sender(&self) -> ErrorSender {
        ErrorSender {
            tx: self.tx.clone(),
        }
    }
}

/// Registry of in-flight generator runs.
#[derive(Default)]
pub struct StreamRegistry {
    runs: Mutex<HashMap<RunId, PendingRun>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, run: PendingRun) -> RunId {
        let id = RunId::generate();
        tracing::debug!("Opening {} for {}", id, run.binding);
        self.runs.lock().insert(id.clone(), run);
        id
    }

    /// Take a run out for pulling; check it back in unless it ended.
    pub fn checkout(&self, id: &RunId) -> Option<PendingRun> {
        self.runs.lock().remove(id)
    }

    pub fn checkin(&self, id: RunId, run: PendingRun) {
        self.runs.lock().insert(id, run);
    }

    pub fn contains(&self, id: &RunId) -> bool {
        self.runs.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every run of `binding` within the session: cancel the
    /// producers and drop stream/diff state immediately.
    pub fn cancel_binding(&self, binding: BindingId, session_key: &str) {
        let mut runs = self.runs.lock();
        runs.retain(|id, run| {
            let matches = run.binding == binding
                && run.session.as_deref().unwrap_or("") == session_key;
            if matches {
                tracing::debug!("Cancelling {} for {}", id, binding);
                run.cancel_token().cancel();
            }
            !matches
        });
    }

    /// Drop all runs belonging to a session at connection end.
    pub fn close_session(&self, session_id: &str) {
        let mut runs = self.runs.lock();
        runs.retain(|_, run| {
            let matches = run.session.as_deref() == Some(session_id);
            if matches {
                run.cancel_token().cancel();
            }
            !matches
        });
    }
}
