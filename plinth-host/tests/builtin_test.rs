//! Integration tests for the host services in the `plinth` namespace

mod common;

use common::{guest, live_allocs, open, runtime, IDENTITY};
use plinth_host::{ErrorKind, HostFunctionRegistry, Plugin, PluginConfig, PluginError};

const VAR_IMPORTS: &str = r#"
    (import "plinth" "var_get" (func $var_get (param i32 i32) (result i64)))
    (import "plinth" "var_set" (func $var_set (param i32 i32 i32 i32)))
"#;

/// `remember` stores its input under "k", `recall` returns it
const VARS: &str = r#"
    (data (i32.const 16) "k")
    (func (export "remember") (param i32 i32) (result i64)
        (call $var_set (i32.const 16) (i32.const 1) (local.get 0) (local.get 1))
        (i64.const 0))
    (func (export "recall") (param i32 i32) (result i64)
        (call $var_get (i32.const 16) (i32.const 1)))
"#;

fn vars_plugin(config: PluginConfig) -> Plugin {
    let runtime = runtime(HostFunctionRegistry::new());
    open(&runtime, &guest(VAR_IMPORTS, VARS), config)
}

#[test]
fn test_vars_persist_across_calls() {
    let mut plugin = vars_plugin(PluginConfig::default());

    assert!(plugin.call("recall", b"").expect("Call failed").is_empty());
    assert!(plugin.var("k").is_none());

    plugin.call("remember", b"hello").expect("Call failed");
    assert_eq!(plugin.call("recall", b"").expect("Call failed"), b"hello");
    assert_eq!(plugin.var("k"), Some(b"hello".as_slice()));

    // The var_get result block is released with the call
    assert_eq!(live_allocs(&mut plugin), 0);

    // Empty value removes the variable
    plugin.call("remember", b"").expect("Call failed");
    assert!(plugin.var("k").is_none());
}

#[test]
fn test_host_sets_vars_seen_by_guest() {
    let mut plugin = vars_plugin(PluginConfig::default());

    plugin.set_var("k", b"from host").expect("Failed to set var");
    assert_eq!(plugin.call("recall", b"").expect("Call failed"), b"from host");

    plugin.clear_vars();
    assert!(plugin.call("recall", b"").expect("Call failed").is_empty());

    plugin.close();
    assert!(plugin.var("k").is_none());
    assert!(matches!(
        plugin.set_var("k", b"late"),
        Err(PluginError::PluginClosedError)
    ));
}

#[test]
fn test_var_store_limit() {
    let mut plugin = vars_plugin(PluginConfig::new().with_max_var_bytes(8));

    let err = plugin.call("remember", b"way more than eight").unwrap_err();
    assert!(matches!(
        err,
        PluginError::HostFunctionError { ref function, .. } if function == "var_set"
    ));
    assert!(!plugin.is_closed());
    assert!(plugin.var("k").is_none());

    plugin.call("remember", b"short").expect("Call failed");
    assert_eq!(plugin.var("k"), Some(b"short".as_slice()));
    assert_eq!(live_allocs(&mut plugin), 0);
}

#[test]
fn test_guest_error_fails_call() {
    let wat = guest(
        r#"(import "plinth" "error_set" (func $error_set (param i32 i32)))"#,
        &format!(
            r#"{}
               (func (export "reject") (param i32 i32) (result i64)
                   (call $error_set (local.get 0) (local.get 1))
                   (i64.const 0))
               (func (export "reject_and_trap") (param i32 i32) (result i64)
                   (call $error_set (local.get 0) (local.get 1))
                   unreachable)"#,
            IDENTITY
        ),
    );
    let runtime = runtime(HostFunctionRegistry::new());
    let mut plugin = open(&runtime, &wat, PluginConfig::default());

    let err = plugin.call("reject", b"invalid order id").unwrap_err();
    match err {
        PluginError::GuestError { function, message } => {
            assert_eq!(function, "reject");
            assert_eq!(message, "invalid order id");
        }
        other => panic!("Unexpected error: {:?}", other),
    }

    // The reported message wins over the trap that follows it
    let err = plugin.call("reject_and_trap", b"bad input").unwrap_err();
    assert!(matches!(err, PluginError::GuestError { ref message, .. } if message == "bad input"));

    // Not sticky
    assert!(!plugin.is_closed());
    assert_eq!(plugin.call("identity", b"ok").expect("Call failed"), b"ok");
    assert_eq!(live_allocs(&mut plugin), 0);
}

#[test]
fn test_guest_error_in_raw_call() {
    let wat = r#"(module
        (import "plinth" "error_set" (func $error_set (param i32 i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "negative")
        (func (export "check") (param i32) (result i32)
            (if (i32.lt_s (local.get 0) (i32.const 0))
                (then (call $error_set (i32.const 0) (i32.const 8))))
            (local.get 0)))"#;
    let runtime = runtime(HostFunctionRegistry::new());
    let mut plugin = open(&runtime, wat, PluginConfig::default());

    let results = plugin
        .call_raw("check", &[plinth_host::Val::I32(3)])
        .expect("Raw call failed");
    assert_eq!(results[0].i32(), Some(3));

    let err = plugin.call_raw("check", &[plinth_host::Val::I32(-1)]).unwrap_err();
    assert!(matches!(err, PluginError::GuestError { ref message, .. } if message == "negative"));
}

#[test]
fn test_log_imports_link() {
    let wat = guest(
        r#"(import "plinth" "log_info" (func $log_info (param i32 i32)))
           (import "plinth" "log_error" (func $log_error (param i32 i32)))"#,
        r#"(func (export "shout") (param i32 i32) (result i64)
               (call $log_info (local.get 0) (local.get 1))
               (call $log_error (local.get 0) (local.get 1))
               (i64.const 0))"#,
    );
    let runtime = runtime(HostFunctionRegistry::new());
    let mut plugin = open(&runtime, &wat, PluginConfig::default());

    assert!(plugin.call("shout", b"hi").expect("Call failed").is_empty());

    // Out-of-range buffers are rejected, not read
    let wat = guest(
        r#"(import "plinth" "log_info" (func $log_info (param i32 i32)))"#,
        r#"(func (export "wild") (param i32 i32) (result i64)
               (call $log_info (i32.const 0xFFFF0000) (i32.const 16))
               (i64.const 0))"#,
    );
    let mut plugin = open(&runtime, &wat, PluginConfig::default());
    let err = plugin.call("wild", b"").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);
}

#[test]
fn test_builtin_signature_mismatch_fails_open() {
    let wat = guest(
        r#"(import "plinth" "var_get" (func $var_get (param i32) (result i32)))"#,
        "",
    );
    let runtime = runtime(HostFunctionRegistry::new());

    let err = runtime
        .open(wat.as_bytes(), PluginConfig::default())
        .unwrap_err();
    assert!(matches!(err, PluginError::InstantiationError(ref msg) if msg.contains("var_get")));
}

#[test]
fn test_unknown_builtin_is_unresolved() {
    let imports = r#"(import "plinth" "teleport" (func $teleport (param i32 i32) (result i64)))"#;
    let body = r#"(func (export "go") (param i32 i32) (result i64)
                      (call $teleport (local.get 0) (local.get 1)))"#;
    let runtime = runtime(HostFunctionRegistry::new());

    let err = runtime
        .open(guest(imports, body).as_bytes(), PluginConfig::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstantiationError);

    let mut plugin = open(
        &runtime,
        &guest(imports, body),
        PluginConfig::new().allow_unresolved_imports(true),
    );
    let err = plugin.call("go", b"x").unwrap_err();
    assert!(matches!(
        err,
        PluginError::UnknownImport { ref namespace, ref name }
            if namespace == "plinth" && name == "teleport"
    ));
}
