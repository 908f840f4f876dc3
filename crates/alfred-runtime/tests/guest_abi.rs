//! End-to-end tests for the guest ABI, using small WAT guests compiled
//! in-process. Each guest carries the required `memory`/`malloc`/`free`
//! exports plus the entry point under test.

use std::sync::Arc;
use std::time::Duration;

use alfred_core::events::{BroadcastBus, EventBus, EventRecorder};
use alfred_runtime::{GuestRuntime, GuestSandbox, GuestSpec, RuntimeError};

/// Shared allocator preamble: a bump allocator starting past the data
/// segments. Guests are ephemeral per call, so free is a no-op.
const ALLOC: &str = r#"
  (global $heap (mut i32) (i32.const 1024))
  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $size
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "free") (param i32 i32))
"#;

fn echo_tool_wat() -> String {
    format!(
        r#"(module
  (import "alfred_v1" "tool_result" (func $tool_result (param i32 i32)))
  (memory (export "memory") 1)
{ALLOC}
  (func (export "tool_execute") (param $ptr i32) (param $len i32)
    local.get $ptr
    local.get $len
    call $tool_result))"#
    )
}

fn silent_tool_wat() -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
{ALLOC}
  (func (export "tool_execute") (param i32 i32)))"#
    )
}

fn keep_original_hook_wat() -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
{ALLOC}
  (func (export "on_response_ready") (param i32 i32) (result i32 i32)
    i32.const 0
    i32.const 0))"#
    )
}

fn rewrite_hook_wat() -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
  (data (i32.const 16) "rewritten")
{ALLOC}
  (func (export "on_response_ready") (param i32 i32) (result i32 i32)
    i32.const 16
    i32.const 9))"#
    )
}

fn spin_tool_wat() -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
{ALLOC}
  (func (export "tool_execute") (param i32 i32)
    (loop $forever
      br $forever)))"#
    )
}

fn event_tool_wat() -> String {
    format!(
        r#"(module
  (import "alfred_v1" "emit_event" (func $emit (param i32 i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "custom.ping")
  (data (i32.const 32) "{{\"n\":1}}")
{ALLOC}
  (func (export "tool_execute") (param i32 i32)
    i32.const 16
    i32.const 11
    i32.const 32
    i32.const 7
    call $emit))"#
    )
}

fn config_tool_wat() -> String {
    format!(
        r#"(module
  (import "alfred_v1" "get_config" (func $get_config (param i32 i32) (result i32 i32)))
  (import "alfred_v1" "tool_result" (func $tool_result (param i32 i32)))
  (memory (export "memory") 1)
{ALLOC}
  (func (export "tool_execute") (param i32 i32)
    (call $get_config (i32.const 0) (i32.const 0))
    call $tool_result))"#
    )
}

fn wat_bytes(wat: &str) -> Vec<u8> {
    wat.as_bytes().to_vec()
}

fn tool_sandbox() -> GuestSandbox {
    GuestSandbox::new(None, None, &["tool".into()]).unwrap()
}

fn spec(name: &str, wat: String, sandbox: GuestSandbox) -> GuestSpec {
    GuestSpec {
        name: name.into(),
        wasm: wat_bytes(&wat),
        sandbox,
        config_json: None,
        bus: None,
    }
}

#[tokio::test]
async fn tool_result_round_trips_raw_bytes() {
    let runtime = GuestRuntime::new().unwrap();
    let loaded = runtime
        .load(spec("echo", echo_tool_wat(), tool_sandbox()))
        .await
        .unwrap();
    assert!(loaded.is_tool_provider);
    assert!(!loaded.is_hook_provider);

    // `{"x":1}` is not a structured ToolResult, so it comes back as raw
    // content.
    let result = runtime.invoke_tool("echo", br#"{"x":1}"#).await.unwrap();
    assert_eq!(result.content, r#"{"x":1}"#);
    assert!(!result.is_error);
}

#[tokio::test]
async fn structured_tool_result_is_parsed() {
    let runtime = GuestRuntime::new().unwrap();
    runtime
        .load(spec("echo", echo_tool_wat(), tool_sandbox()))
        .await
        .unwrap();

    let result = runtime
        .invoke_tool("echo", br#"{"content":"done","is_error":true}"#)
        .await
        .unwrap();
    assert_eq!(result.content, "done");
    assert!(result.is_error);
}

#[tokio::test]
async fn silent_guest_synthesizes_ok() {
    let runtime = GuestRuntime::new().unwrap();
    runtime
        .load(spec("silent", silent_tool_wat(), GuestSandbox::default()))
        .await
        .unwrap();

    let result = runtime.invoke_tool("silent", b"{}").await.unwrap();
    assert_eq!(result.content, "ok");
    assert!(!result.is_error);
}

#[tokio::test]
async fn transform_zero_zero_keeps_original() {
    let runtime = GuestRuntime::new().unwrap();
    let loaded = runtime
        .load(spec("keeper", keep_original_hook_wat(), GuestSandbox::default()))
        .await
        .unwrap();
    assert!(loaded.is_hook_provider);

    let out = runtime
        .invoke_transform("keeper", "on_response_ready", "original text")
        .await
        .unwrap();
    assert_eq!(out, "original text");
}

#[tokio::test]
async fn transform_returns_guest_buffer() {
    let runtime = GuestRuntime::new().unwrap();
    runtime
        .load(spec("rewriter", rewrite_hook_wat(), GuestSandbox::default()))
        .await
        .unwrap();

    let out = runtime
        .invoke_transform("rewriter", "on_response_ready", "original")
        .await
        .unwrap();
    assert_eq!(out, "rewritten");
}

#[tokio::test]
async fn missing_hook_is_a_no_op() {
    let runtime = GuestRuntime::new().unwrap();
    runtime
        .load(spec("echo", echo_tool_wat(), tool_sandbox()))
        .await
        .unwrap();

    runtime
        .invoke_hook("echo", "on_message_received", b"hello")
        .await
        .unwrap();
    let out = runtime
        .invoke_transform("echo", "on_response_ready", "kept")
        .await
        .unwrap();
    assert_eq!(out, "kept");
}

#[tokio::test]
async fn runaway_guest_times_out() {
    let runtime = GuestRuntime::new().unwrap();
    let sandbox = GuestSandbox::new(
        Some(16),
        Some(Duration::from_millis(100)),
        &["tool".into()],
    )
    .unwrap();
    runtime
        .load(spec("spinner", spin_tool_wat(), sandbox))
        .await
        .unwrap();

    let err = runtime.invoke_tool("spinner", b"{}").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn ungranted_capability_fails_at_load() {
    let runtime = GuestRuntime::new().unwrap();
    // event_tool imports emit_event but the sandbox grants no event_bus.
    let err = runtime
        .load(spec("pinger", event_tool_wat(), tool_sandbox()))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::PermissionDenied(_)), "got {err:?}");
}

#[tokio::test]
async fn granted_event_bus_publishes_to_host() {
    let runtime = GuestRuntime::new().unwrap();
    let bus: Arc<dyn EventBus> = Arc::new(BroadcastBus::new());
    let recorder = EventRecorder::new();
    let _sub = recorder.attach(bus.as_ref());

    let sandbox = GuestSandbox::new(None, None, &["event_bus".into()]).unwrap();
    runtime
        .load(GuestSpec {
            name: "pinger".into(),
            wasm: wat_bytes(&event_tool_wat()),
            sandbox,
            config_json: None,
            bus: Some(Arc::clone(&bus)),
        })
        .await
        .unwrap();

    let result = runtime.invoke_tool("pinger", b"{}").await.unwrap();
    assert_eq!(result.content, "ok");

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "custom.ping");
    assert_eq!(events[0].payload["n"], 1);
}

#[tokio::test]
async fn get_config_returns_injected_document() {
    let runtime = GuestRuntime::new().unwrap();
    runtime
        .load(GuestSpec {
            name: "configured".into(),
            wasm: wat_bytes(&config_tool_wat()),
            sandbox: tool_sandbox(),
            config_json: Some(r#"{"lang":"en"}"#.into()),
            bus: None,
        })
        .await
        .unwrap();

    // The guest copies the config verbatim into tool_result; it is not a
    // structured ToolResult, so it surfaces as raw content.
    let result = runtime.invoke_tool("configured", b"{}").await.unwrap();
    assert_eq!(result.content, r#"{"lang":"en"}"#);
}

#[tokio::test]
async fn missing_allocator_rejected() {
    let runtime = GuestRuntime::new().unwrap();
    let wat = r#"(module
  (memory (export "memory") 1)
  (func (export "tool_execute") (param i32 i32)))"#;
    let err = runtime
        .load(GuestSpec {
            name: "bare".into(),
            wasm: wat.as_bytes().to_vec(),
            sandbox: GuestSandbox::default(),
            config_json: None,
            bus: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidModule(_)), "got {err:?}");
}

#[tokio::test]
async fn unload_and_close() {
    let runtime = GuestRuntime::new().unwrap();
    runtime
        .load(spec("echo", echo_tool_wat(), tool_sandbox()))
        .await
        .unwrap();

    runtime.unload("echo").await.unwrap();
    let err = runtime.invoke_tool("echo", b"{}").await.unwrap_err();
    assert!(matches!(err, RuntimeError::ModuleNotFound(_)));

    let err = runtime.unload("echo").await.unwrap_err();
    assert!(matches!(err, RuntimeError::ModuleNotFound(_)));

    runtime.close().await;
}
