//! Runtime: engine, host function registry and plugin construction

use crate::config::PluginConfig;
use crate::error::{PluginError, Result};
use crate::module::{self, WasmModule};
use crate::plugin::Plugin;
use crate::registry::HostFunctionRegistry;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use wasmtime::{Config, Engine};

/// Interval between epoch increments; bounds how late a timeout fires
const EPOCH_TICK: Duration = Duration::from_millis(5);

/// Maximum wasm stack size (1 MiB)
const MAX_WASM_STACK: usize = 1024 * 1024;

/// Shared entry point for opening plugins
///
/// Owns the compilation engine and a frozen [`HostFunctionRegistry`]. A
/// runtime can open any number of plugins; each plugin gets its own store.
///
/// # Example
///
/// ```rust,ignore
/// let mut registry = HostFunctionRegistry::new();
/// registry.register(HostFunction::new("myHostFunction1", |input| {
///     Ok([b"echo:".as_slice(), input].concat())
/// }))?;
///
/// let runtime = Runtime::new(registry.into_shared())?;
/// let mut plugin = runtime.open(&wasm_bytes, PluginConfig::default())?;
/// let out = plugin.call("greet", b"Benjamin")?;
/// ```
pub struct Runtime {
    engine: Engine,
    registry: Arc<HostFunctionRegistry>,
    ticker: Mutex<Weak<EpochTicker>>,
}

impl Runtime {
    /// Create a runtime over a frozen registry
    pub fn new(registry: Arc<HostFunctionRegistry>) -> Result<Self> {
        let mut config = Config::new();

        // CPU limit; refilled before every call
        config.consume_fuel(true);

        // Wall-clock deadlines
        config.epoch_interruption(true);

        config.max_wasm_stack(MAX_WASM_STACK);

        // 32-bit linear memory only; shared memory has no meaning for a
        // single-threaded instance
        config.wasm_memory64(false);
        config.wasm_threads(false);

        let engine = Engine::new(&config).map_err(|e| {
            PluginError::InstantiationError(format!("Failed to create engine: {:#}", e))
        })?;

        tracing::debug!(host_functions = registry.len(), "Runtime created");
        Ok(Self {
            engine,
            registry,
            ticker: Mutex::new(Weak::new()),
        })
    }

    /// Runtime without host functions
    pub fn empty() -> Result<Self> {
        Self::new(Arc::new(HostFunctionRegistry::new()))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<HostFunctionRegistry> {
        &self.registry
    }

    /// Compile a module without instantiating it
    pub fn load(&self, bytes: &[u8]) -> Result<WasmModule> {
        module::load(&self.engine, bytes)
    }

    /// Compile and instantiate a plugin
    ///
    /// # Errors
    ///
    /// - [`PluginError::InvalidBinary`] / [`PluginError::UnsupportedFeature`]
    ///   from loading
    /// - [`PluginError::InstantiationError`] if imports cannot be resolved,
    ///   the memory limit is below the module's minimum, or a start
    ///   function fails
    /// - [`PluginError::Logging`] if the configured log file cannot be opened
    pub fn open(&self, bytes: &[u8], config: PluginConfig) -> Result<Plugin> {
        let module = self.load(bytes)?;
        self.instantiate(&module, config)
    }

    /// Read a `.wasm` or `.wat` file and open it
    pub fn open_file(&self, path: impl AsRef<Path>, config: PluginConfig) -> Result<Plugin> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            PluginError::ArgumentError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "Read plugin file");
        self.open(&bytes, config)
    }

    /// Instantiate an already compiled module
    ///
    /// Installs the process-wide log subscriber first when `config` carries
    /// log settings and none is active yet.
    pub fn instantiate(&self, module: &WasmModule, config: PluginConfig) -> Result<Plugin> {
        if let Some(log) = config.log_config() {
            crate::logging::ensure_initialized(log)?;
        }
        let ticker = match config.timeout_ms {
            Some(_) => Some(self.ticker()?),
            None => None,
        };
        Plugin::instantiate(&self.engine, &self.registry, module.clone(), config, ticker)
    }

    /// Shared epoch ticker, started on first use
    fn ticker(&self) -> Result<Arc<EpochTicker>> {
        let mut slot = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(ticker) = slot.upgrade() {
            return Ok(ticker);
        }
        let ticker = Arc::new(EpochTicker::start(self.engine.clone())?);
        *slot = Arc::downgrade(&ticker);
        Ok(ticker)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("host_functions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Background thread advancing the engine epoch
///
/// Plugins with a timeout hold an `Arc` to the ticker; the thread stops
/// once the last of them is dropped.
pub(crate) struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("plinth-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| {
                PluginError::InstantiationError(format!("Failed to start epoch ticker: {}", e))
            })?;

        tracing::debug!(tick_ms = EPOCH_TICK.as_millis() as u64, "Epoch ticker started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        tracing::debug!("Epoch ticker stopped");
    }
}
