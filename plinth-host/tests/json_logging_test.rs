//! JSON log output; a separate test binary since the subscriber is
//! process-wide.

mod common;

use common::{guest, open, runtime};
use plinth_host::logging::{self, LogFormat};
use plinth_host::{HostFunctionRegistry, PluginConfig, GUEST_LOG_TARGET};

#[test]
fn test_guest_logs_as_json() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("plugin.jsonl");

    let config = PluginConfig::from_json(&format!(
        r#"{{ "logTarget": {}, "logLevel": "debug", "logFormat": "json" }}"#,
        serde_json::to_string(&path).expect("Failed to encode path")
    ))
    .expect("Failed to parse config");

    let wat = guest(
        r#"(import "plinth" "log_warn" (func $log_warn (param i32 i32)))"#,
        r#"(func (export "warn") (param i32 i32) (result i64)
               (call $log_warn (local.get 0) (local.get 1))
               (i64.const 0))"#,
    );
    let runtime = runtime(HostFunctionRegistry::new());

    // A module that fails to load leaves logging alone
    assert!(runtime.open(b"not wasm", config.clone()).is_err());
    assert!(logging::active().is_none());

    let mut plugin = open(&runtime, &wat, config);
    plugin.call("warn", b"disk almost full").expect("Call failed");
    plugin.close();

    let active = logging::active().expect("Logging not initialized");
    assert_eq!(active.format, LogFormat::Json);

    let contents = std::fs::read_to_string(&path).expect("Failed to read log file");
    let events: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).expect("Log line is not JSON"))
        .collect();

    let guest_event = events
        .iter()
        .find(|event| event["target"] == GUEST_LOG_TARGET)
        .expect("No guest log event");
    assert_eq!(guest_event["level"], "WARN");
    assert_eq!(guest_event["fields"]["message"], "disk almost full");
    assert_eq!(guest_event["fields"]["function"], "warn");

    // Host events share the file
    assert!(events
        .iter()
        .any(|event| event["fields"]["message"] == "Plugin opened"));
}
