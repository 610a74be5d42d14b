//! Streaming Integration Test
//!
//! Verifies generator-backed bindings end to end:
//! 1. Chunk-by-chunk delivery with back-pressure
//! 2. Terminal finished sentinels and run teardown
//! 3. Diff-mode deltas versus simple format
//! 4. Cancellation mid-stream

use reactlib::core::binding::events;
use reactlib::prelude::*;
use reactlib::{markers, EngineConfig, RunId, Value};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Textbox;

impl Component for Textbox {
    fn type_name(&self) -> &str {
        "textbox"
    }
}

fn dispatcher(registry: BindingRegistry) -> Dispatcher {
    Dispatcher::new(
        Arc::new(parking_lot::RwLock::new(registry)),
        EngineConfig::default(),
    )
}

/// Binding whose generator yields each provided value, then exhausts.
fn yielding_binding(registry: &mut BindingRegistry, values: Vec<Value>) -> BindingId {
    let scope = RenderScope::new("main");
    let trigger = registry.add_node(&scope, Arc::new(Textbox));
    let out = registry.add_node(&scope, Arc::new(Textbox));
    registry
        .register(BindingSpec::on(
            trigger,
            events::SUBMIT,
            vec![],
            vec![out],
            Some(BoundFunction::generator(move |_args, tx| {
                let values = values.clone();
                async move {
                    for value in values {
                        tx.send(vec![OutputValue::Value(value)]).await?;
                    }
                    Ok(())
                }
            })),
        ))
        .unwrap()
}

async fn pull(engine: &Dispatcher, binding: BindingId, run: RunId) -> DispatchOutput {
    let mut request = DispatchRequest::new(binding, vec![]).with_run(run);
    request.simple_format = true;
    request.session = Some("s".into());
    engine.dispatch(request).await.unwrap()
}

// -----------------------------------------------------------------------------
// Finalization
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_three_chunks_then_terminal_sentinel() {
    let mut registry = BindingRegistry::new();
    let binding = yielding_binding(&mut registry, vec![json!("a"), json!("b"), json!("c")]);
    let engine = dispatcher(registry);

    let mut request = DispatchRequest::new(binding, vec![]).with_session("s");
    request.simple_format = true;
    let first = engine.dispatch(request).await.unwrap();
    assert!(first.is_generating);
    assert_eq!(first.outputs, vec![json!("a")]);
    let run = first.run.clone().expect("generator handle");
    assert_eq!(engine.active_runs(), 1);

    let second = pull(&engine, binding, run.clone()).await;
    assert!(second.is_generating);
    assert_eq!(second.outputs, vec![json!("b")]);

    let third = pull(&engine, binding, run.clone()).await;
    assert_eq!(third.outputs, vec![json!("c")]);

    let terminal = pull(&engine, binding, run.clone()).await;
    assert!(!terminal.is_generating);
    assert_eq!(terminal.outputs.len(), 1);
    assert_eq!(terminal.outputs[0][markers::TYPE_KEY], markers::FINISHED);

    // The pending run is gone after the terminal chunk.
    assert_eq!(engine.active_runs(), 0);
}

#[tokio::test]
async fn test_trigger_once_spans_whole_generator_run() {
    let mut registry = BindingRegistry::new();
    let binding = yielding_binding(&mut registry, vec![json!(1), json!(2)]);
    let engine = dispatcher(registry);

    let first = engine
        .dispatch(DispatchRequest::new(binding, vec![]).with_session("s"))
        .await
        .unwrap();
    assert!(first.is_generating);
    assert!(engine.is_pending(binding, Some("s")));

    // A fresh submission is refused until the run is exhausted.
    let rejected = engine
        .dispatch(DispatchRequest::new(binding, vec![]).with_session("s"))
        .await;
    assert!(matches!(rejected, Err(EngineError::Pending(_))));

    let run = first.run.clone().unwrap();
    pull(&engine, binding, run.clone()).await;
    let terminal = pull(&engine, binding, run).await;
    assert!(!terminal.is_generating);
    assert!(!engine.is_pending(binding, Some("s")));
}

// -----------------------------------------------------------------------------
// Diff mode
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_diff_mode_emits_deltas_after_baseline() {
    let mut registry = BindingRegistry::new();
    let binding = yielding_binding(
        &mut registry,
        vec![json!("Hello"), json!("Hello, world")],
    );
    let engine = dispatcher(registry);

    let first = engine
        .dispatch(DispatchRequest::new(binding, vec![]).with_session("s"))
        .await
        .unwrap();
    // First chunk is the baseline and passes through whole.
    assert_eq!(first.outputs, vec![json!("Hello")]);
    let run = first.run.clone().unwrap();

    let second = engine
        .dispatch(
            DispatchRequest::new(binding, vec![])
                .with_session("s")
                .with_run(run.clone()),
        )
        .await
        .unwrap();
    assert_eq!(second.outputs[0][markers::TYPE_KEY], markers::DIFF);
    let ops = second.outputs[0]["ops"].as_array().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["op"], "append");
    assert_eq!(ops[0]["value"], json!(", world"));

    // The terminal sentinel carries the last full value.
    let terminal = engine
        .dispatch(
            DispatchRequest::new(binding, vec![])
                .with_session("s")
                .with_run(run),
        )
        .await
        .unwrap();
    assert!(!terminal.is_generating);
    assert_eq!(terminal.outputs[0][markers::TYPE_KEY], markers::FINISHED);
    assert_eq!(terminal.outputs[0]["value"], json!("Hello, world"));
}

#[tokio::test]
async fn test_sessionless_chunks_pass_through_unmodified() {
    let mut registry = BindingRegistry::new();
    let binding = yielding_binding(&mut registry, vec![json!("x"), json!("xy")]);
    let engine = dispatcher(registry);

    // No session: streaming and diffing are disabled, raw chunks flow.
    let first = engine
        .dispatch(DispatchRequest::new(binding, vec![]))
        .await
        .unwrap();
    assert_eq!(first.outputs, vec![json!("x")]);
    let run = first.run.clone().unwrap();

    let second = engine
        .dispatch(DispatchRequest::new(binding, vec![]).with_run(run))
        .await
        .unwrap();
    assert_eq!(second.outputs, vec![json!("xy")]);
}

// -----------------------------------------------------------------------------
// Cancellation
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_request_cancel_tears_down_run() {
    let mut registry = BindingRegistry::new();
    let binding = yielding_binding(
        &mut registry,
        vec![json!(1), json!(2), json!(3), json!(4)],
    );
    let engine = dispatcher(registry);

    let mut request = DispatchRequest::new(binding, vec![]).with_session("s");
    request.simple_format = true;
    let first = engine.dispatch(request).await.unwrap();
    assert!(first.is_generating);
    assert_eq!(engine.active_runs(), 1);

    // Cancellation drops stream state immediately.
    engine.request_cancel(binding, Some("s"));
    assert_eq!(engine.active_runs(), 0);

    // Pulling the stale handle settles the stream with a terminal frame.
    let run = first.run.clone().unwrap();
    let settled = pull(&engine, binding, run).await;
    assert!(!settled.is_generating);
    assert_eq!(settled.outputs[0][markers::TYPE_KEY], markers::FINISHED);
}

#[tokio::test]
async fn test_time_limit_stops_long_runs() {
    let mut registry = BindingRegistry::new();
    let scope = RenderScope::new("main");
    let trigger = registry.add_node(&scope, Arc::new(Textbox));
    let out = registry.add_node(&scope, Arc::new(Textbox));
    let mut spec = BindingSpec::on(
        trigger,
        events::SUBMIT,
        vec![],
        vec![out],
        Some(BoundFunction::generator(|_args, tx| async move {
            tx.send(vec![OutputValue::Value(json!("first"))]).await?;
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                tx.send(vec![OutputValue::Value(json!("late"))]).await?;
            }
        })),
    );
    spec.streaming.time_limit = Some(Duration::from_millis(100));
    let binding = registry.register(spec).unwrap();
    let engine = dispatcher(registry);

    let mut request = DispatchRequest::new(binding, vec![]).with_session("s");
    request.simple_format = true;
    let first = engine.dispatch(request).await.unwrap();
    assert_eq!(first.outputs, vec![json!("first")]);

    // Past the limit the run winds down instead of yielding more chunks.
    let run = first.run.clone().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = pull(&engine, binding, run).await;
    assert!(!settled.is_generating);
}

#[tokio::test]
async fn test_close_session_drops_runs() {
    let mut registry = BindingRegistry::new();
    let binding = yielding_binding(&mut registry, vec![json!(1), json!(2)]);
    let engine = dispatcher(registry);

    let first = engine
        .dispatch(DispatchRequest::new(binding, vec![]).with_session("s"))
        .await
        .unwrap();
    assert!(first.is_generating);
    assert_eq!(engine.active_runs(), 1);

    engine.close_session("s");
    assert_eq!(engine.active_runs(), 0);
    assert!(engine.sessions().get("s").is_none());
}
