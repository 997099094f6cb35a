//! Host services every plugin can import from the `plinth` namespace
//!
//! | import | signature | effect |
//! |--------|-----------|--------|
//! | `error_set` | `(ptr, len)` | fail the current call with this message |
//! | `var_get` | `(key_ptr, key_len) -> i64` | packed copy of a variable, 0 if unset |
//! | `var_set` | `(key_ptr, key_len, ptr, len)` | store a variable; empty value removes it |
//! | `log_trace` .. `log_error` | `(ptr, len)` | emit a log event |
//!
//! Variables belong to one plugin instance and survive across calls.
//! Log events use the `plinth::guest` target, so they reach whatever
//! subscriber the host installed.

use crate::dispatch::StoreData;
use crate::error::{PluginError, Result};
use crate::logging::LogLevel;
use crate::module::FunctionImport;
use plinth_api::{Signature, ValType, BUILTIN_NAMESPACE, MEMORY_EXPORT};
use std::collections::HashMap;
use wasmtime::{Caller, Extern, Linker};

/// Target of log events emitted by guests
pub const GUEST_LOG_TARGET: &str = "plinth::guest";

/// Default ceiling for the variable store: 1 MiB
pub const DEFAULT_MAX_VAR_BYTES: u64 = 1 << 20;

/// Per-plugin variables, bounded by the total size of keys and values
#[derive(Debug)]
pub(crate) struct Vars {
    values: HashMap<String, Vec<u8>>,
    bytes: u64,
    limit: u64,
}

impl Vars {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            values: HashMap::new(),
            bytes: 0,
            limit,
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&[u8]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// Store `value` under `key`; an empty value removes the variable
    pub(crate) fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if value.is_empty() {
            self.remove(key);
            return Ok(());
        }

        let old = self.values.get(key).map_or(0, |v| entry_size(key, v));
        let total = self.bytes - old + entry_size(key, value);
        if total > self.limit {
            return Err(PluginError::host_function(
                "var_set",
                format!(
                    "variable `{}` would grow the store to {} bytes (limit {})",
                    key, total, self.limit
                ),
            ));
        }

        self.values.insert(key.to_string(), value.to_vec());
        self.bytes = total;
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: &str) {
        if let Some(value) = self.values.remove(key) {
            self.bytes -= entry_size(key, &value);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
        self.bytes = 0;
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

fn log_level(name: &str) -> Option<LogLevel> {
    Some(match name {
        "log_trace" => LogLevel::Trace,
        "log_debug" => LogLevel::Debug,
        "log_info" => LogLevel::Info,
        "log_warn" => LogLevel::Warn,
        "log_error" => LogLevel::Error,
        _ => return None,
    })
}

/// Signature of the built-in `name`, if there is one
pub fn signature(name: &str) -> Option<Signature> {
    use ValType::{I32, I64};
    Some(match name {
        "error_set" => Signature::new([I32, I32], []),
        "var_get" => Signature::new([I32, I32], [I64]),
        "var_set" => Signature::new([I32, I32, I32, I32], []),
        name if log_level(name).is_some() => Signature::new([I32, I32], []),
        _ => return None,
    })
}

/// Link the built-in `import` refers to
///
/// Returns `Ok(false)` when the namespace has no such function, leaving the
/// import to the unresolved-import handling.
pub(crate) fn link(linker: &mut Linker<StoreData>, import: &FunctionImport) -> Result<bool> {
    let Some(expected) = signature(&import.name) else {
        return Ok(false);
    };
    if import.signature != expected {
        return Err(PluginError::InstantiationError(format!(
            "built-in {}::{} has signature {}, module imports it as {}",
            BUILTIN_NAMESPACE, import.name, expected, import.signature
        )));
    }

    let name = import.name.as_str();
    let linked = match name {
        "error_set" => linker.func_wrap(
            BUILTIN_NAMESPACE,
            name,
            |mut caller: Caller<'_, StoreData>, ptr: i32, len: i32| -> anyhow::Result<()> {
                error_set(&mut caller, ptr, len).map_err(anyhow::Error::new)
            },
        ),
        "var_get" => linker.func_wrap(
            BUILTIN_NAMESPACE,
            name,
            |mut caller: Caller<'_, StoreData>, key_ptr: i32, key_len: i32| -> anyhow::Result<i64> {
                var_get(&mut caller, key_ptr, key_len).map_err(anyhow::Error::new)
            },
        ),
        "var_set" => linker.func_wrap(
            BUILTIN_NAMESPACE,
            name,
            |mut caller: Caller<'_, StoreData>,
             key_ptr: i32,
             key_len: i32,
             ptr: i32,
             len: i32|
             -> anyhow::Result<()> {
                var_set(&mut caller, (key_ptr, key_len), (ptr, len)).map_err(anyhow::Error::new)
            },
        ),
        _ => {
            let Some(level) = log_level(name) else {
                return Ok(false);
            };
            linker.func_wrap(
                BUILTIN_NAMESPACE,
                name,
                move |mut caller: Caller<'_, StoreData>, ptr: i32, len: i32| -> anyhow::Result<()> {
                    log(&mut caller, level, ptr, len).map_err(anyhow::Error::new)
                },
            )
        }
    };

    linked.map_err(|e| {
        PluginError::InstantiationError(format!(
            "Failed to link {}::{}: {:#}",
            BUILTIN_NAMESPACE, name, e
        ))
    })?;
    Ok(true)
}

/// Copy a guest buffer through the exported memory
///
/// Works during start functions too, before the allocator is known.
fn read_guest(caller: &mut Caller<'_, StoreData>, function: &str, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let Some(Extern::Memory(memory)) = caller.get_export(MEMORY_EXPORT) else {
        return Err(PluginError::host_function(
            function,
            format!("guest does not export `{}`", MEMORY_EXPORT),
        ));
    };
    let data = memory.data(&*caller);
    let start = ptr as u32 as usize;
    let len = len as u32 as usize;
    data.get(start..start + len)
        .map(<[u8]>::to_vec)
        .ok_or(PluginError::OutOfBounds {
            ptr: start as u64,
            len: len as u64,
            memory_size: data.len() as u64,
        })
}

fn read_key(caller: &mut Caller<'_, StoreData>, function: &str, ptr: i32, len: i32) -> Result<String> {
    String::from_utf8(read_guest(caller, function, ptr, len)?).map_err(|_| {
        PluginError::host_function(function, "variable name is not UTF-8")
    })
}

fn require_call(caller: &Caller<'_, StoreData>, function: &str) -> Result<()> {
    if caller.data().call.is_none() {
        return Err(PluginError::host_function(
            function,
            "called while no plugin call is in progress",
        ));
    }
    Ok(())
}

fn error_set(caller: &mut Caller<'_, StoreData>, ptr: i32, len: i32) -> Result<()> {
    require_call(caller, "error_set")?;
    let message = String::from_utf8_lossy(&read_guest(caller, "error_set", ptr, len)?).into_owned();
    tracing::debug!(
        function = caller.data().current_function(),
        message = %message,
        "Guest reported an error"
    );
    caller.data_mut().guest_error = Some(message);
    Ok(())
}

fn var_get(caller: &mut Caller<'_, StoreData>, key_ptr: i32, key_len: i32) -> Result<i64> {
    require_call(caller, "var_get")?;
    let key = read_key(caller, "var_get", key_ptr, key_len)?;
    let Some(value) = caller.data().vars.get(&key).map(<[u8]>::to_vec) else {
        return Ok(0);
    };

    // Handed out like a host function result: freed when the call ends
    let bridge = caller.data().bridge.clone().ok_or_else(|| {
        PluginError::host_function("var_get", "guest does not export an allocator")
    })?;
    let block = bridge.alloc_bytes(&mut *caller, &value)?;
    caller.data_mut().track(block);
    Ok(block.packed())
}

fn var_set(
    caller: &mut Caller<'_, StoreData>,
    (key_ptr, key_len): (i32, i32),
    (ptr, len): (i32, i32),
) -> Result<()> {
    let key = read_key(caller, "var_set", key_ptr, key_len)?;
    let value = read_guest(caller, "var_set", ptr, len)?;
    let vars = &mut caller.data_mut().vars;
    vars.set(&key, &value)?;
    tracing::trace!(key = %key, len = value.len(), total = vars.bytes(), "Guest variable set");
    Ok(())
}

fn log(caller: &mut Caller<'_, StoreData>, level: LogLevel, ptr: i32, len: i32) -> Result<()> {
    let bytes = read_guest(caller, "log", ptr, len)?;
    let message = String::from_utf8_lossy(&bytes);
    let function = caller.data().current_function();
    match level {
        LogLevel::Trace => tracing::trace!(target: GUEST_LOG_TARGET, function, "{}", message),
        LogLevel::Debug => tracing::debug!(target: GUEST_LOG_TARGET, function, "{}", message),
        LogLevel::Info => tracing::info!(target: GUEST_LOG_TARGET, function, "{}", message),
        LogLevel::Warn => tracing::warn!(target: GUEST_LOG_TARGET, function, "{}", message),
        LogLevel::Error => tracing::error!(target: GUEST_LOG_TARGET, function, "{}", message),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vars_track_size() {
        let mut vars = Vars::new(16);
        vars.set("count", b"1").expect("Failed to set var");
        assert_eq!(vars.get("count"), Some(b"1".as_slice()));
        assert_eq!(vars.bytes(), 6);

        // Replacing a value only counts the new size
        vars.set("count", b"12345").expect("Failed to set var");
        assert_eq!(vars.bytes(), 10);

        let err = vars.set("other", b"too long").unwrap_err();
        assert!(matches!(err, PluginError::HostFunctionError { ref function, .. } if function == "var_set"));
        assert_eq!(vars.bytes(), 10);

        vars.set("count", b"").expect("Failed to remove var");
        assert!(vars.get("count").is_none());
        assert_eq!(vars.bytes(), 0);
    }

    #[test]
    fn test_vars_clear() {
        let mut vars = Vars::new(DEFAULT_MAX_VAR_BYTES);
        vars.set("a", b"1").expect("Failed to set var");
        vars.set("b", b"2").expect("Failed to set var");
        vars.clear();
        assert!(vars.get("a").is_none());
        assert_eq!(vars.bytes(), 0);
    }

    #[test]
    fn test_builtin_signatures() {
        assert_eq!(signature("var_get"), Some(Signature::bytes()));
        assert_eq!(
            signature("log_warn"),
            Some(Signature::new([ValType::I32, ValType::I32], []))
        );
        assert!(signature("log_fatal").is_none());
        assert!(signature("myHostFunction1").is_none());
    }
}
