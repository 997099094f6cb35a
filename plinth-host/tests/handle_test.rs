//! Integration tests for sharing a plugin between async tasks

mod common;

use common::{guest, open, runtime, IDENTITY};
use plinth_host::{HostFunctionRegistry, PluginConfig, PluginError, PluginHandle, Val};

#[tokio::test]
async fn test_concurrent_calls_are_serialized() {
    let runtime = runtime(HostFunctionRegistry::new());
    let handle = PluginHandle::new(open(&runtime, &guest("", IDENTITY), PluginConfig::default()));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let input = format!("task-{}", i);
                let out = handle.call("identity", input.clone()).await;
                (input, out)
            })
        })
        .collect();

    for task in tasks {
        let (input, out) = task.await.expect("Task panicked");
        assert_eq!(out.expect("Call failed"), input.into_bytes());
    }

    let live = handle
        .call_raw("live_allocs", Vec::new())
        .await
        .expect("Raw call failed");
    assert_eq!(live[0].i32(), Some(0));
}

#[tokio::test]
async fn test_close_through_handle() {
    let runtime = runtime(HostFunctionRegistry::new());
    let handle: PluginHandle = open(&runtime, &guest("", IDENTITY), PluginConfig::default()).into();

    assert!(handle.function_exists("identity").await);
    handle.close().await;
    assert!(handle.is_closed().await);

    let err = handle.call("identity", b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, PluginError::PluginClosedError));

    let err = handle
        .call_raw("live_allocs", vec![Val::I32(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::PluginClosedError));
}
