//! WAT fixtures shared by the integration tests
#![allow(dead_code)]

use plinth_host::{HostFunctionRegistry, Plugin, PluginConfig, Runtime};

/// Bump allocator exported as `plugin_alloc` / `plugin_dealloc`
///
/// - the heap starts at 1024 and grows memory on demand; `plugin_alloc`
///   returns 0 when `memory.grow` fails
/// - `$live` counts outstanding blocks (exported as `live_allocs`) and the
///   heap resets once it drops to zero
/// - setting `$poison` makes `plugin_dealloc` trap
pub const ALLOCATOR: &str = r#"
    (global $heap (mut i32) (i32.const 1024))
    (global $live (mut i32) (i32.const 0))
    (global $poison (mut i32) (i32.const 0))

    (func $alloc (export "plugin_alloc") (param $len i32) (result i32)
        (local $ptr i32)
        (local $end i32)
        (local.set $ptr (global.get $heap))
        (local.set $end (i32.add (local.get $ptr) (local.get $len)))
        (if (i32.gt_u (local.get $end) (i32.mul (memory.size) (i32.const 65536)))
            (then
                (if (i32.eq
                        (memory.grow
                            (i32.sub
                                (i32.div_u (i32.add (local.get $end) (i32.const 65535)) (i32.const 65536))
                                (memory.size)))
                        (i32.const -1))
                    (then (return (i32.const 0))))))
        (global.set $heap (local.get $end))
        (global.set $live (i32.add (global.get $live) (i32.const 1)))
        (local.get $ptr))

    (func $dealloc (export "plugin_dealloc") (param $ptr i32) (param $len i32)
        (if (global.get $poison) (then unreachable))
        (global.set $live (i32.sub (global.get $live) (i32.const 1)))
        (if (i32.eqz (global.get $live))
            (then (global.set $heap (i32.const 1024)))))

    (func (export "live_allocs") (result i32) (global.get $live))

    (func $pack (param $ptr i32) (param $len i32) (result i64)
        (i64.or
            (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
            (i64.extend_i32_u (local.get $len))))
"#;

/// Returns its input buffer unchanged
pub const IDENTITY: &str = r#"
    (func (export "identity") (param i32 i32) (result i64)
        (call $pack (local.get 0) (local.get 1)))
"#;

/// Assemble a guest: imports, one page of exported memory, the allocator,
/// then `body`
pub fn guest(imports: &str, body: &str) -> String {
    format!(
        r#"(module {} (memory (export "memory") 1) {} {})"#,
        imports, ALLOCATOR, body
    )
}

pub fn runtime(registry: HostFunctionRegistry) -> Runtime {
    Runtime::new(registry.into_shared()).expect("Failed to create runtime")
}

pub fn open(runtime: &Runtime, wat: &str, config: PluginConfig) -> Plugin {
    runtime
        .open(wat.as_bytes(), config)
        .expect("Failed to open plugin")
}

/// Outstanding guest allocations
pub fn live_allocs(plugin: &mut Plugin) -> i32 {
    let results = plugin
        .call_raw("live_allocs", &[])
        .expect("live_allocs failed");
    results[0].i32().expect("live_allocs returns i32")
}
