//! Plugin instances

use crate::builtins;
use crate::config::PluginConfig;
use crate::dispatch::{self, Dispatcher, StoreData};
use crate::error::{PluginError, Result};
use crate::memory::MemoryBridge;
use crate::module::{ModuleInfo, WasmModule};
use crate::registry::HostFunctionRegistry;
use crate::runtime::EpochTicker;
use plinth_api::{BUILTIN_NAMESPACE, MEMORY_EXPORT, WASI_NAMESPACE};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use wasmtime::{Engine, Linker, Store, Val};

/// A live instance of a wasm module
///
/// Calls are serialized by `&mut self`. After [`close`](Self::close), or a
/// fatal fault (timeout, a trap while releasing call buffers), every
/// operation that touches the instance fails with
/// [`PluginError::PluginClosedError`].
pub struct Plugin {
    module: WasmModule,
    config: PluginConfig,
    live: Option<Live>,
    _ticker: Option<Arc<EpochTicker>>,
}

struct Live {
    store: Store<StoreData>,
    dispatcher: Dispatcher,
}

impl Plugin {
    pub(crate) fn instantiate(
        engine: &Engine,
        registry: &HostFunctionRegistry,
        module: WasmModule,
        config: PluginConfig,
        ticker: Option<Arc<EpochTicker>>,
    ) -> Result<Self> {
        if config.enable_wasi && !cfg!(feature = "wasi") {
            return Err(PluginError::UnsupportedFeature(
                "WASI support is not compiled into this host".to_string(),
            ));
        }

        let info = module.info();
        if !info.other_imports.is_empty() {
            return Err(PluginError::InstantiationError(format!(
                "non-function imports cannot be provided: {}",
                info.other_imports.join(", ")
            )));
        }

        let mut store = dispatch::new_store(engine, StoreData::new(&config))?;
        let mut linker: Linker<StoreData> = Linker::new(engine);

        #[cfg(feature = "wasi")]
        if config.enable_wasi {
            crate::wasi::shim::link(&mut linker, &mut store, engine, info)?;
        }

        // Only imported functions are linked, each once
        let mut linked = HashSet::new();
        for import in &info.imports {
            if config.enable_wasi && import.namespace == WASI_NAMESPACE {
                continue;
            }
            if !linked.insert((import.namespace.as_str(), import.name.as_str())) {
                continue;
            }
            if import.namespace == BUILTIN_NAMESPACE && builtins::link(&mut linker, import)? {
                continue;
            }

            match registry.resolve(&import.namespace, &import.name) {
                Ok(function) => {
                    if function.signature() != &import.signature {
                        return Err(PluginError::InstantiationError(format!(
                            "host function {} has signature {}, module imports it as {}",
                            function.qualified_name(),
                            function.signature(),
                            import.signature
                        )));
                    }
                    dispatch::link_host_function(&mut linker, engine, function)?;
                }
                Err(_) if config.allow_unresolved_imports => {
                    tracing::warn!(
                        namespace = %import.namespace,
                        name = %import.name,
                        "Unresolved import linked to a trapping stub"
                    );
                    dispatch::link_unresolved(&mut linker, engine, import)?;
                }
                Err(err) => return Err(PluginError::InstantiationError(err.to_string())),
            }
        }

        // Start functions run under the same deadline as calls
        store.data_mut().deadline = config.timeout().map(|t| Instant::now() + t);
        let instance = linker
            .instantiate(&mut store, module.inner())
            .map_err(|e| {
                let cause = dispatch::classify_error(&store, "<start>", e);
                PluginError::InstantiationError(cause.to_string())
            })?;
        store.data_mut().deadline = None;

        let bridge = MemoryBridge::from_instance(&mut store, &instance)?;
        if bridge.is_none() {
            tracing::debug!("Module does not export an allocator; bytes calls unavailable");
        }
        store.data_mut().bridge = bridge;

        tracing::info!(
            exports = info.exports.len(),
            imports = info.imports.len(),
            wasi = config.enable_wasi,
            max_memory_pages = config.max_memory_pages,
            "Plugin opened"
        );

        Ok(Self {
            module,
            config,
            live: Some(Live {
                store,
                dispatcher: Dispatcher::new(instance),
            }),
            _ticker: ticker,
        })
    }

    /// Call a bytes export: `(ptr: i32, len: i32) -> i64`
    ///
    /// # Errors
    ///
    /// - [`PluginError::UnknownExport`] / [`PluginError::ArgumentError`] if
    ///   `name` is missing or has another signature; the plugin is untouched
    /// - [`PluginError::OutOfMemory`] if guest memory cannot hold the input
    /// - [`PluginError::Trap`], [`PluginError::FuelExhausted`],
    ///   [`PluginError::HostFunctionError`] and friends for failures during
    ///   the call; the plugin stays callable
    /// - [`PluginError::Timeout`], or a trap in `plugin_dealloc` while
    ///   releasing call buffers; the plugin is closed
    pub fn call(&mut self, name: &str, input: &[u8]) -> Result<Vec<u8>> {
        self.with_live(name, |live| {
            live.dispatcher.call(&mut live.store, name, input)
        })
    }

    /// Call any export with raw wasm values
    pub fn call_raw(&mut self, name: &str, params: &[Val]) -> Result<Vec<Val>> {
        self.with_live(name, |live| {
            live.dispatcher.call_raw(&mut live.store, name, params)
        })
    }

    fn with_live<T>(&mut self, name: &str, f: impl FnOnce(&mut Live) -> Result<T>) -> Result<T> {
        let live = self.live.as_mut().ok_or(PluginError::PluginClosedError)?;
        let result = f(live);

        if live.store.data().poisoned {
            self.shutdown("guest buffer cleanup failed");
        } else if let Err(err) = &result {
            if err.is_fatal() {
                tracing::warn!(function = name, error = %err, "Fatal plugin error");
                self.shutdown("fatal error");
            }
        }
        result
    }

    /// Whether the module exports a function named `name`
    pub fn function_exists(&self, name: &str) -> bool {
        self.module.info().export(name).is_some()
    }

    pub fn module_info(&self) -> &ModuleInfo {
        self.module.info()
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.live.is_none()
    }

    /// Current size of the exported memory in pages
    pub fn memory_pages(&mut self) -> Result<u64> {
        let live = self.live.as_mut().ok_or(PluginError::PluginClosedError)?;
        let memory = live
            .dispatcher
            .instance()
            .get_memory(&mut live.store, MEMORY_EXPORT);
        Ok(memory.map_or(0, |memory| memory.size(&live.store)))
    }

    /// Value of a plugin variable, as set through `var_set` or
    /// [`set_var`](Self::set_var)
    ///
    /// Closed plugins have no variables.
    pub fn var(&self, key: &str) -> Option<&[u8]> {
        self.live.as_ref()?.store.data().vars.get(key)
    }

    /// Set a plugin variable; an empty value removes it
    ///
    /// # Errors
    ///
    /// - [`PluginError::HostFunctionError`] if the store would exceed
    ///   `max_var_bytes`
    /// - [`PluginError::PluginClosedError`]
    pub fn set_var(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let live = self.live.as_mut().ok_or(PluginError::PluginClosedError)?;
        live.store.data_mut().vars.set(key, value)
    }

    /// Drop every plugin variable
    pub fn clear_vars(&mut self) {
        if let Some(live) = self.live.as_mut() {
            live.store.data_mut().vars.clear();
        }
    }

    /// Release the instance; later calls fail with `PluginClosedError`
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        self.shutdown("closed by host");
    }

    fn shutdown(&mut self, reason: &str) {
        if self.live.take().is_some() {
            tracing::info!(reason, "Plugin closed");
        }
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("module", &self.module)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
