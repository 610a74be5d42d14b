// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Dispatch pipeline: resolves inputs against session state, invokes the
//! bound callable under the binding's admission policy, and reconciles
//! outputs back into session state.

pub mod batch;
pub mod gate;

use crate::core::binding::{BindingId, BoundFunction, EventBinding, StreamingConfig};
use crate::core::component::NodeId;
use crate::core::config::EngineConfig;
use crate::core::diff::compute_diff;
use crate::core::error::{EngineError, Result};
use crate::core::metrics::BindingMetrics;
use crate::core::registry::BindingRegistry;
use crate::core::session::{SessionHandle, SessionStore};
use crate::core::stream::{PendingRun, PulledChunk, RunId, StreamRegistry};
use crate::core::value::{self, fingerprint, markers, OutputValue, Value};
use gate::{CancellationToken, ConcurrencyGates, PendingGuard, PendingTracker};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Pipeline states, logged as an invocation progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Validating,
    Preprocessing,
    Invoking,
    Yielding,
    Postprocessing,
    Done,
    Failed,
}

/// One dispatch call from the transport layer.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub binding: BindingId,
    /// Ordered raw inputs; extras beyond the bound inputs are tolerated.
    pub inputs: Vec<Value>,
    pub session: Option<String>,
    /// Event payload appended as a trailing argument when present.
    pub event_data: Option<Value>,
    /// Pre-existing generator handle: pulls the next chunk of that run.
    pub run: Option<RunId>,
    /// Raw values on every chunk instead of structural deltas.
    pub simple_format: bool,
}

impl DispatchRequest {
    pub fn new(binding: BindingId, inputs: Vec<Value>) -> Self {
        Self {
            binding,
            inputs,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_run(mut self, run: RunId) -> Self {
        self.run = Some(run);
        self
    }
}

/// What the transport layer relays back.
#[derive(Debug, Clone)]
pub struct DispatchOutput {
    pub outputs: Vec<Value>,
    pub is_generating: bool,
    pub run: Option<RunId>,
    pub duration: Duration,
    pub average_duration: Duration,
    /// Stateful nodes whose value changed and that have a change listener.
    pub changed_state_ids: Vec<NodeId>,
}

/// The engine facade: owns sessions, gates, pending tracking, streams, and
/// metrics around a shared binding registry.
pub struct Dispatcher {
    registry: Arc<RwLock<BindingRegistry>>,
    sessions: Arc<SessionStore>,
    streams: StreamRegistry,
    gates: ConcurrencyGates,
    pending: Arc<PendingTracker>,
    metrics: BindingMetrics,
    /// Ceiling on concurrently running sync callables; `None` is unbounded.
    worker_gate: Option<Arc<Semaphore>>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<RwLock<BindingRegistry>>, config: EngineConfig) -> Self {
        Self {
            registry,
            sessions: Arc::new(SessionStore::new(config.session_capacity)),
            streams: StreamRegistry::new(),
            gates: ConcurrencyGates::new(config.default_concurrency_limit),
            pending: Arc::new(PendingTracker::new()),
            metrics: BindingMetrics::new(),
            worker_gate: config
                .max_workers
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<BindingRegistry>> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Fetch an existing session for inspection.
    pub fn session(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| EngineError::Session(format!("Unknown session {}", session_id)))
    }

    pub fn metrics(&self) -> &BindingMetrics {
        &self.metrics
    }

    /// Whether an invocation of `binding` is pending in the session. The
    /// transport layer consults this for `trigger_mode = once`.
    pub fn is_pending(&self, binding: BindingId, session: Option<&str>) -> bool {
        self.pending.is_pending(binding, session.unwrap_or(""))
    }

    /// Cooperatively cancel in-flight invocations of `binding` in the
    /// session. Generator stream/diff state is torn down immediately.
    pub fn request_cancel(&self, binding: BindingId, session: Option<&str>) {
        let key = session.unwrap_or("");
        self.pending.request_cancel(binding, key);
        self.streams.cancel_binding(binding, key);
    }

    /// Mount a sub-registry into the live graph.
    pub fn merge_registry(&self, sub: BindingRegistry) -> Result<()> {
        self.registry.write().merge(sub)
    }

    /// Number of in-flight generator runs.
    pub fn active_runs(&self) -> usize {
        self.streams.len()
    }

    /// Drop a session and every run it owns at connection end.
    pub fn close_session(&self, session_id: &str) {
        self.streams.close_session(session_id);
        self.sessions.remove(session_id);
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutput> {
        let binding = self.registry.read().lookup(request.binding)?.clone();

        // Continuation of an in-flight generator run.
        if let Some(run_id) = request.run.clone() {
            return self.pull_chunk(&binding, run_id, request.simple_format).await;
        }

        let session_key = request.session.clone().unwrap_or_default();
        tracing::debug!(state = ?DispatchState::Validating, "Dispatching {}", binding.id);

        // Firing this binding requests cancellation of its cancel set.
        for target in &binding.cancels {
            self.request_cancel(*target, request.session.as_deref());
        }

        if request.inputs.len() < binding.inputs.len() {
            return Err(EngineError::input_arity(
                binding.inputs.len(),
                request.inputs.len(),
            ));
        }

        let guard = self
            .pending
            .admit(binding.id, &session_key, binding.trigger_mode)
            .await?;
        let token = guard.token();

        let session = match request.session.as_deref() {
            Some(id) => {
                let (handle, evicted) = self.sessions.get_or_create(id);
                for stale in evicted {
                    self.streams.close_session(&stale);
                }
                Some(handle)
            }
            None => None,
        };

        let started = Instant::now();
        let result = if binding.batch {
            self.run_batched(&binding, &request, session.as_ref(), &token)
                .await
        } else {
            self.run_single(&binding, &request, session.as_ref(), guard, token)
                .await
        };

        match result {
            Ok(RunOutcome::Finished { outputs, changed }) => {
                let duration = started.elapsed();
                let average = self.metrics.record(binding.id, duration);
                tracing::debug!(state = ?DispatchState::Done, "{} finished in {:?}", binding.id, duration);
                Ok(DispatchOutput {
                    outputs,
                    is_generating: false,
                    run: None,
                    duration,
                    average_duration: average,
                    changed_state_ids: changed,
                })
            }
            Ok(RunOutcome::Streaming { run_id }) => {
                self.pull_chunk(&binding, run_id, request.simple_format).await
            }
            Err(error) => {
                tracing::warn!(state = ?DispatchState::Failed, "{} failed: {}", binding.id, error);
                Err(error)
            }
        }
    }

    async fn run_single(
        &self,
        binding: &EventBinding,
        request: &DispatchRequest,
        session: Option<&Arc<SessionHandle>>,
        guard: PendingGuard,
        token: CancellationToken,
    ) -> Result<RunOutcome> {
        tracing::debug!(state = ?DispatchState::Preprocessing, "{}", binding.id);
        let mut args = self.preprocess(binding, &request.inputs, session)?;
        if let Some(event_data) = &request.event_data {
            args.push(event_data.clone());
        }

        let permit = self
            .gates
            .acquire(&binding.concurrency_id, binding.concurrency_limit)
            .await?;
        if token.is_cancelled() {
            return Err(EngineError::Cancelled(format!(
                "{} cancelled before invocation",
                binding.id
            )));
        }

        tracing::debug!(state = ?DispatchState::Invoking, "{}", binding.id);
        let raw_outputs = match &binding.function {
            None => {
                // Pure relay binding: frontend-only effects, nothing to run.
                vec![OutputValue::Skip; binding.outputs.len()]
            }
            Some(BoundFunction::Sync(f)) => {
                let _worker = match &self.worker_gate {
                    Some(gate) => Some(
                        Arc::clone(gate)
                            .acquire_owned()
                            .await
                            .map_err(|_| EngineError::Cancelled("worker pool closed".into()))?,
                    ),
                    None => None,
                };
                let f = Arc::clone(f);
                let handle = tokio::task::spawn_blocking(move || f(args));
                tokio::select! {
                    joined = handle => joined
                        .map_err(|e| EngineError::Invocation(format!("worker panicked: {}", e)))?
                        .map_err(invocation_error)?,
                    _ = token.cancelled() => {
                        return Err(EngineError::Cancelled(format!("{} cancelled", binding.id)));
                    }
                }
            }
            Some(BoundFunction::Async(f)) => {
                let future = f(args);
                tokio::select! {
                    result = future => result.map_err(invocation_error)?,
                    _ = token.cancelled() => {
                        return Err(EngineError::Cancelled(format!("{} cancelled", binding.id)));
                    }
                }
            }
            Some(BoundFunction::Generator(f)) => {
                let streaming = self.effective_streaming(binding);
                let (sender, run) = PendingRun::channel(
                    binding.id,
                    request.session.clone(),
                    streaming,
                    token.clone(),
                    permit,
                    guard,
                );
                let error_sender = sender.error_sender();
                let producer = f(args, sender);
                let id = binding.id;
                tokio::spawn(async move {
                    match producer.await {
                        Ok(()) => {}
                        Err(EngineError::Cancelled(reason)) => {
                            tracing::debug!("{} generator stopped: {}", id, reason);
                        }
                        Err(error) => {
                            tracing::warn!("{} generator failed: {}", id, error);
                            error_sender.send(error).await;
                        }
                    }
                });
                let run_id = self.streams.begin(run);
                return Ok(RunOutcome::Streaming { run_id });
            }
        };

        tracing::debug!(state = ?DispatchState::Postprocessing, "{}", binding.id);
        let (outputs, changed) = self.reconcile(binding, raw_outputs, session)?;
        Ok(RunOutcome::Finished { outputs, changed })
    }

    async fn run_batched(
        &self,
        binding: &EventBinding,
        request: &DispatchRequest,
        session: Option<&Arc<SessionHandle>>,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let lists = &request.inputs[..binding.inputs.len()];
        let row_count = batch::validate_batch(lists, binding.max_batch_size)?;

        tracing::debug!(state = ?DispatchState::Preprocessing, "{} ({} rows)", binding.id, row_count);
        let raw_rows = batch::rows(lists, row_count);
        let mut resolved_rows = Vec::with_capacity(row_count);
        for row in &raw_rows {
            resolved_rows.push(self.preprocess(binding, row, session)?);
        }
        let args = batch::columns(&resolved_rows, binding.inputs.len());

        let permit = self
            .gates
            .acquire(&binding.concurrency_id, binding.concurrency_limit)
            .await?;
        if token.is_cancelled() {
            return Err(EngineError::Cancelled(format!(
                "{} cancelled before invocation",
                binding.id
            )));
        }

        tracing::debug!(state = ?DispatchState::Invoking, "{}", binding.id);
        let raw_outputs = match &binding.function {
            None => vec![OutputValue::Skip; binding.outputs.len()],
            Some(BoundFunction::Sync(f)) => {
                let f = Arc::clone(f);
                let handle = tokio::task::spawn_blocking(move || f(args));
                handle
                    .await
                    .map_err(|e| EngineError::Invocation(format!("worker panicked: {}", e)))?
                    .map_err(invocation_error)?
            }
            Some(BoundFunction::Async(f)) => f(args).await.map_err(invocation_error)?,
            // Rejected at registration.
            Some(BoundFunction::Generator(_)) => {
                return Err(EngineError::Config(
                    "Generator callables cannot run in batch mode".into(),
                ))
            }
        };
        drop(permit);

        tracing::debug!(state = ?DispatchState::Postprocessing, "{}", binding.id);
        let truncated = self.check_output_arity(binding, raw_outputs)?;
        let per_row = batch::unzip_outputs(&truncated, row_count)?;

        let registry = self.registry.read();
        let mut wire_rows = Vec::with_capacity(row_count);
        for row in per_row {
            let mut wire_row = Vec::with_capacity(binding.outputs.len());
            for (output, node_id) in row.into_iter().zip(&binding.outputs) {
                let node = registry
                    .get_node(*node_id)
                    .ok_or_else(|| EngineError::Graph(format!("{} does not exist", node_id)))?;
                let wire = match output {
                    OutputValue::Value(v) => node.component.postprocess(&v)?,
                    other => other.to_wire(),
                };
                wire_row.push(wire);
            }
            wire_rows.push(wire_row);
        }

        Ok(RunOutcome::Finished {
            outputs: batch::rezip_wire(&wire_rows, binding.outputs.len()),
            changed: Vec::new(),
        })
    }

    /// Resolve raw inputs into callable arguments: stateful inputs come from
    /// session state, others run their preprocess hook.
    fn preprocess(
        &self,
        binding: &EventBinding,
        raw: &[Value],
        session: Option<&Arc<SessionHandle>>,
    ) -> Result<Vec<Value>> {
        let registry = self.registry.read();
        let mut args = Vec::with_capacity(binding.inputs.len());
        for (index, node_id) in binding.inputs.iter().enumerate() {
            let node = registry
                .get_node(*node_id)
                .ok_or_else(|| EngineError::Graph(format!("{} does not exist", node_id)))?;
            if node.is_stateful() {
                // An unseeded slot reads as the component's example value.
                let value = session
                    .and_then(|s| s.state.lock().state.get(node_id).cloned())
                    .unwrap_or_else(|| node.component.example_value());
                args.push(value);
            } else {
                let raw_value = raw.get(index).cloned().unwrap_or(Value::Null);
                args.push(node.component.preprocess(&raw_value)?);
            }
        }
        Ok(args)
    }

    /// Output-arity policy: too few is fatal; extra empty slots are dropped
    /// silently; extra real values warn and truncate.
    fn check_output_arity(
        &self,
        binding: &EventBinding,
        mut outputs: Vec<OutputValue>,
    ) -> Result<Vec<OutputValue>> {
        let wanted = binding.outputs.len();
        if outputs.len() < wanted {
            return Err(EngineError::output_arity(wanted, outputs.len()));
        }
        if outputs.len() > wanted {
            let overflow_real = outputs[wanted..].iter().any(|v| !v.is_empty());
            if overflow_real {
                tracing::warn!(
                    "{} returned {} outputs, expected {}; extra values truncated",
                    binding.id,
                    outputs.len(),
                    wanted
                );
            }
            outputs.truncate(wanted);
        }
        Ok(outputs)
    }

    /// Reconcile callable outputs into session state and produce the wire
    /// values plus the set of changed stateful nodes.
    fn reconcile(
        &self,
        binding: &EventBinding,
        raw_outputs: Vec<OutputValue>,
        session: Option<&Arc<SessionHandle>>,
    ) -> Result<(Vec<Value>, Vec<NodeId>)> {
        let outputs = self.check_output_arity(binding, raw_outputs)?;
        let registry = self.registry.read();

        // Fingerprint watched nodes before writing anything back. Each node
        // appears once even if several output slots target it.
        let mut watched: Vec<NodeId> = binding
            .outputs
            .iter()
            .copied()
            .filter(|id| {
                registry.has_change_listener(*id)
                    && registry.get_node(*id).is_some_and(|n| n.is_stateful())
            })
            .collect();
        watched.sort();
        watched.dedup();
        let before: Vec<(NodeId, u64)> = watched
            .iter()
            .map(|id| {
                let current = session
                    .and_then(|s| s.state.lock().state.get(id).cloned())
                    .unwrap_or(Value::Null);
                (*id, fingerprint(&current))
            })
            .collect();

        let mut wire = Vec::with_capacity(outputs.len());
        for (output, node_id) in outputs.into_iter().zip(&binding.outputs) {
            let node = registry
                .get_node(*node_id)
                .ok_or_else(|| EngineError::Graph(format!("{} does not exist", node_id)))?;
            match output {
                OutputValue::Skip => wire.push(value::type_marker(markers::SKIP)),
                OutputValue::Patch(fields) => {
                    if let Some(session) = session {
                        let mut state = session.state.lock();
                        state.apply_patch(*node_id, &fields);
                        // A patch carrying a value replaces the node's
                        // live value even for non-stateful nodes.
                        if let Some(v) = fields.get("value") {
                            state.state.insert(*node_id, v.clone());
                        }
                    }
                    wire.push(OutputValue::Patch(fields).to_wire());
                }
                OutputValue::Value(v) => {
                    if node.is_stateful() {
                        if let Some(session) = session {
                            session.state.lock().state.insert(*node_id, v);
                        }
                        // Server-held values are not echoed downstream.
                        wire.push(Value::Null);
                    } else {
                        wire.push(node.component.postprocess(&v)?);
                    }
                }
            }
        }

        let mut changed = Vec::new();
        for (node_id, fingerprint_before) in before {
            let current = session
                .and_then(|s| s.state.lock().state.get(&node_id).cloned())
                .unwrap_or(Value::Null);
            if fingerprint(&current) != fingerprint_before {
                changed.push(node_id);
            }
        }

        Ok((wire, changed))
    }

    // =========================================================================
    // Yielding
    // =========================================================================

    async fn pull_chunk(
        &self,
        binding: &EventBinding,
        run_id: RunId,
        simple_format: bool,
    ) -> Result<DispatchOutput> {
        let Some(mut run) = self.streams.checkout(&run_id) else {
            // Torn down by cancellation between pulls; emit the terminal
            // frame so the relay can settle the stream.
            tracing::debug!("{} not found; emitting terminal frame", run_id);
            return Ok(self.terminal_output(binding, None));
        };
        if run.binding != binding.id {
            self.streams.checkin(run_id, run);
            return Err(EngineError::Graph(format!(
                "Run does not belong to {}",
                binding.id
            )));
        }

        let session = run.session.as_deref().and_then(|id| self.sessions.get(id));
        let started = Instant::now();

        tracing::debug!(state = ?DispatchState::Yielding, "{} pulling {}", binding.id, run_id);
        match run.pull().await {
            PulledChunk::Chunk(chunk) => {
                let (mut wire, changed) = match self.reconcile(binding, chunk, session.as_ref()) {
                    Ok(done) => done,
                    Err(error) => {
                        // Failed postprocessing fails the run.
                        run.cancel_token().cancel();
                        self.metrics.record(binding.id, run.started().elapsed());
                        return Err(error);
                    }
                };

                // Stream & diff merging requires session + run context.
                if session.is_some() {
                    self.merge_chunk_state(binding, &mut wire, &mut run, simple_format);
                }

                let duration = started.elapsed();
                let average = self
                    .metrics
                    .average(binding.id)
                    .unwrap_or(duration);
                self.streams.checkin(run_id.clone(), run);
                Ok(DispatchOutput {
                    outputs: wire,
                    is_generating: true,
                    run: Some(run_id),
                    duration,
                    average_duration: average,
                    changed_state_ids: changed,
                })
            }
            PulledChunk::Finished => {
                self.metrics.record(binding.id, run.started().elapsed());
                tracing::debug!(state = ?DispatchState::Done, "{} exhausted {}", binding.id, run_id);
                Ok(self.terminal_output(binding, Some(&run)))
            }
            PulledChunk::Failed(error) => {
                self.metrics.record(binding.id, run.started().elapsed());
                Err(invocation_error(error))
            }
            PulledChunk::Cancelled => {
                if run.chunks_delivered > 0 {
                    tracing::debug!("{} cancelled after partial output", run_id);
                    Ok(self.terminal_output(binding, Some(&run)))
                } else {
                    Err(EngineError::Cancelled(format!(
                        "{} cancelled before any output",
                        binding.id
                    )))
                }
            }
        }
    }

    /// Append media segments and convert values to structural deltas.
    fn merge_chunk_state(
        &self,
        binding: &EventBinding,
        wire: &mut [Value],
        run: &mut PendingRun,
        simple_format: bool,
    ) {
        for (index, (value, node_id)) in wire.iter_mut().zip(&binding.outputs).enumerate() {
            // Media segments accumulate per output node for the run.
            if value.get(markers::TYPE_KEY).and_then(Value::as_str) == Some(markers::STREAM) {
                run.stream_state
                    .entry(*node_id)
                    .or_default()
                    .push(value.clone());
                continue;
            }
            if simple_format {
                continue;
            }
            match run.diff_state.get(&index) {
                // First chunk is the baseline and passes through whole.
                None => {
                    run.diff_state.insert(index, value.clone());
                }
                Some(previous) => {
                    let ops = compute_diff(previous, value);
                    let mut delta = value::type_marker(markers::DIFF);
                    delta["ops"] = serde_json::to_value(ops).unwrap_or_default();
                    run.diff_state.insert(index, value.clone());
                    *value = delta;
                }
            }
        }
    }

    /// Terminal frame: a finished sentinel per output slot, carrying the
    /// last full value when the run streamed in diff mode.
    fn terminal_output(&self, binding: &EventBinding, run: Option<&PendingRun>) -> DispatchOutput {
        let outputs = (0..binding.outputs.len())
            .map(|index| {
                let mut sentinel = value::finished_sentinel();
                if let Some(last) = run.and_then(|r| r.diff_state.get(&index)) {
                    sentinel["value"] = last.clone();
                }
                sentinel
            })
            .collect();
        DispatchOutput {
            outputs,
            is_generating: false,
            run: None,
            duration: Duration::ZERO,
            average_duration: self
                .metrics
                .average(binding.id)
                .unwrap_or(Duration::ZERO),
            changed_state_ids: Vec::new(),
        }
    }

    fn effective_streaming(&self, binding: &EventBinding) -> StreamingConfig {
        let mut streaming = binding.streaming;
        if streaming.stream_every.is_none() && self.config.stream_every_ms > 0 {
            streaming.stream_every = Some(Duration::from_millis(self.config.stream_every_ms));
        }
        streaming
    }
}

enum RunOutcome {
    Finished {
        outputs: Vec<Value>,
        changed: Vec<NodeId>,
    },
    Streaming {
        run_id: RunId,
    },
}

/// Callable failures surface as invocation errors; cancellation keeps its
/// identity so partial-output handling stays intact.
fn invocation_error(error: EngineError) -> EngineError {
    match error {
        cancelled @ EngineError::Cancelled(_) => cancelled,
        already @ EngineError::Invocation(_) => already,
        other => EngineError::Invocation(other.to_string()),
    }
}
