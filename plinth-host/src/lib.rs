//! plinth-host: Wasm plugin host runtime
//!
//! Loads WebAssembly modules, links host-implemented functions into them,
//! and calls their exports with byte payloads marshaled through guest
//! memory.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use plinth_host::{HostFunction, HostFunctionRegistry, PluginConfig, Runtime};
//!
//! let mut registry = HostFunctionRegistry::new();
//! registry.register(HostFunction::new("myHostFunction1", |input| {
//!     Ok([b"echo:".as_slice(), input].concat())
//! }))?;
//!
//! let runtime = Runtime::new(registry.into_shared())?;
//! let mut plugin = runtime.open(&std::fs::read("greet.wasm")?, PluginConfig::default())?;
//! assert_eq!(plugin.call("greet", b"Benjamin")?, b"echo:Benjamin");
//! ```
//!
//! Every plugin may also import the runtime's own services from the
//! `plinth` namespace: per-plugin variables, error reporting and logging
//! (see [`builtins`]).
//!
//! # Features
//!
//! - `wasi` (default): WASI preview1 support via `wasmtime-wasi`

pub mod builtins;
pub mod config;
pub mod current;
mod dispatch;
pub mod error;
pub mod limits;
pub mod logging;
pub mod memory;
pub mod module;
pub mod plugin;
pub mod registry;
pub mod runtime;
pub mod shared;

#[cfg(feature = "wasi")]
pub mod wasi;

pub use builtins::{DEFAULT_MAX_VAR_BYTES, GUEST_LOG_TARGET};
pub use config::{PluginConfig, WasiOptions, DEFAULT_MAX_MEMORY_PAGES};
pub use current::CurrentPlugin;
pub use error::{ErrorKind, PluginError, Result};
pub use logging::{LogConfig, LogFormat, LogLevel, LogTarget, LoggingError};
pub use memory::Block;
pub use module::{FunctionExport, FunctionImport, MemoryRequirement, ModuleInfo, WasmModule};
pub use plugin::Plugin;
pub use registry::{HostFunction, HostFunctionRegistry};
pub use runtime::Runtime;
pub use shared::PluginHandle;

pub use plinth_api::{
    pack_ptr_len, unpack_ptr_len, Signature, ValType, BUILTIN_NAMESPACE, DEFAULT_NAMESPACE,
    ERRNO_NOSYS, WASI_NAMESPACE,
};
pub use wasmtime::Val;
