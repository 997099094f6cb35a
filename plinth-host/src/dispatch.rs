//! Call dispatch
//!
//! Every call walks the same state machine:
//!
//! ```text
//! Idle ──► ArgsMarshaled ──► Invoking ──► ResultMarshaled ──► Idle
//!                 │               │
//!                 └──────► Failed ◄┘ ──► Idle
//! ```
//!
//! All guest blocks the host allocates during a call (the input buffer and
//! host function results) are tracked in the [`CallContext`] and released
//! when the call ends, whether it succeeded or not. If that release traps,
//! the store is marked poisoned and the owning [`Plugin`](crate::Plugin)
//! closes itself.
//!
//! Host functions are linked through [`Linker::func_new`]; the trampoline
//! marshals bytes, isolates panics, and maps callable errors onto
//! [`PluginError`].

use crate::builtins::Vars;
use crate::config::PluginConfig;
use crate::current::CurrentPlugin;
use crate::error::{PluginError, Result};
use crate::limits::MemoryLimiter;
use crate::memory::{Block, MemoryBridge};
use crate::module::{func_type, signature_of, FunctionImport};
use crate::registry::{Callable, HostFunction};
use plinth_api::{unpack_ptr_len, Signature, ValType, ALLOC_EXPORT, DEALLOC_EXPORT, MEMORY_EXPORT};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wasmtime::{
    AsContext, Caller, Engine, Func, Instance, Linker, Store, Trap, UpdateDeadline, Val,
};

/// Where a plugin is in the lifecycle of a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    Idle,
    ArgsMarshaled,
    Invoking,
    ResultMarshaled,
    Failed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ArgsMarshaled => "args-marshaled",
            Self::Invoking => "invoking",
            Self::ResultMarshaled => "result-marshaled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-call bookkeeping, alive only while a call is in progress
#[derive(Debug)]
pub(crate) struct CallContext {
    function: String,
    blocks: Vec<Block>,
}

impl CallContext {
    fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            blocks: Vec::new(),
        }
    }

    pub(crate) fn function(&self) -> &str {
        &self.function
    }

    /// Whether `block` lies inside a block this call already owns
    fn owns(&self, block: Block) -> bool {
        let start = block.ptr as u64;
        self.blocks.iter().any(|owned| {
            let owned_start = owned.ptr as u64;
            start >= owned_start && start < owned_start + owned.len as u64
        })
    }
}

/// Host state stored alongside each plugin instance
pub(crate) struct StoreData {
    pub(crate) limiter: MemoryLimiter,
    pub(crate) state: CallState,
    pub(crate) call: Option<CallContext>,
    pub(crate) bridge: Option<MemoryBridge>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) fuel_limit: Option<u64>,
    pub(crate) poisoned: bool,
    pub(crate) vars: Vars,
    /// Message left by the guest through `error_set` during this call
    pub(crate) guest_error: Option<String>,
    #[cfg(feature = "wasi")]
    pub(crate) wasi: wasmtime_wasi::preview1::WasiP1Ctx,
}

impl StoreData {
    pub(crate) fn new(config: &PluginConfig) -> Self {
        #[cfg(feature = "wasi")]
        let wasi = if config.enable_wasi {
            crate::wasi::context::build_ctx(&config.wasi)
        } else {
            crate::wasi::context::empty_ctx()
        };

        Self {
            limiter: MemoryLimiter::new(config.max_memory_bytes()),
            state: CallState::Idle,
            call: None,
            bridge: None,
            timeout: config.timeout(),
            deadline: None,
            fuel_limit: config.fuel_limit,
            poisoned: false,
            vars: Vars::new(config.max_var_bytes),
            guest_error: None,
            #[cfg(feature = "wasi")]
            wasi,
        }
    }

    /// Name of the export being called, or `<start>` during instantiation
    pub(crate) fn current_function(&self) -> &str {
        self.call
            .as_ref()
            .map(CallContext::function)
            .unwrap_or("<start>")
    }

    /// Hand `block` to the current call for release when it ends
    pub(crate) fn track(&mut self, block: Block) {
        if block.is_empty() {
            return;
        }
        if let Some(call) = self.call.as_mut() {
            call.blocks.push(block);
        }
    }

    fn transition(&mut self, next: CallState) {
        tracing::trace!(
            function = self.current_function(),
            from = %self.state,
            to = %next,
            "Call state"
        );
        self.state = next;
    }

    fn fuel(&self) -> u64 {
        self.fuel_limit.unwrap_or(u64::MAX)
    }
}

/// Create a store with limits, fuel and the deadline callback installed
pub(crate) fn new_store(engine: &Engine, data: StoreData) -> Result<Store<StoreData>> {
    let fuel = data.fuel();
    let mut store = Store::new(engine, data);
    store.limiter(|data| &mut data.limiter);
    store
        .set_fuel(fuel)
        .map_err(|e| PluginError::InstantiationError(format!("Failed to set fuel: {}", e)))?;
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(|ctx| check_deadline(ctx.data()));
    Ok(store)
}

fn check_deadline(data: &StoreData) -> anyhow::Result<UpdateDeadline> {
    match (data.deadline, data.timeout) {
        (Some(deadline), Some(timeout)) if Instant::now() >= deadline => {
            Err(anyhow::Error::new(PluginError::Timeout {
                function: data.current_function().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }))
        }
        _ => Ok(UpdateDeadline::Continue(1)),
    }
}

/// Map an error coming out of wasmtime onto [`PluginError`]
///
/// Order matters: errors raised by the host (host functions, the deadline
/// callback) pass through untouched; fuel and refused memory growth are
/// recognized next; anything else is a guest trap.
pub(crate) fn classify_error(
    store: impl AsContext<Data = StoreData>,
    function: &str,
    err: anyhow::Error,
) -> PluginError {
    let err = match err.downcast::<PluginError>() {
        Ok(plugin_error) => return plugin_error,
        Err(err) => err,
    };

    let context = store.as_context();
    let data = context.data();
    if let Some(trap) = err.downcast_ref::<Trap>() {
        match trap {
            Trap::OutOfFuel => return PluginError::FuelExhausted,
            Trap::Interrupt => {
                return PluginError::Timeout {
                    function: function.to_string(),
                    timeout_ms: data.timeout.map_or(0, |t| t.as_millis() as u64),
                }
            }
            _ => {}
        }
    }

    if let Some(requested) = data.limiter.refused_bytes() {
        return PluginError::OutOfMemory { requested };
    }

    PluginError::Trap {
        function: function.to_string(),
        message: format!("{:#}", err),
    }
}

/// Drives calls into one instance
pub(crate) struct Dispatcher {
    instance: Instance,
}

impl Dispatcher {
    pub(crate) fn new(instance: Instance) -> Self {
        Self { instance }
    }

    pub(crate) fn instance(&self) -> &Instance {
        &self.instance
    }

    fn export(&self, store: &mut Store<StoreData>, name: &str) -> Result<Func> {
        self.instance
            .get_func(&mut *store, name)
            .ok_or_else(|| PluginError::UnknownExport(name.to_string()))
    }

    /// Call a `(ptr, len) -> packed` export with `input`
    pub(crate) fn call(
        &self,
        store: &mut Store<StoreData>,
        name: &str,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let func = self.export(store, name)?;
        let typed = func.typed::<(i32, i32), i64>(&*store).map_err(|_| {
            PluginError::ArgumentError(format!(
                "export `{}` has signature {}, expected {}",
                name,
                signature_of(&func.ty(&*store)),
                Signature::bytes()
            ))
        })?;
        let bridge = store.data().bridge.clone().ok_or_else(|| {
            PluginError::ArgumentError(format!(
                "export `{}` cannot take bytes: module does not export `{}`, `{}` and `{}`",
                name, MEMORY_EXPORT, ALLOC_EXPORT, DEALLOC_EXPORT
            ))
        })?;

        self.begin(store, name)?;
        let result = invoke_bytes(store, &bridge, name, &typed, input);
        let result = surface_guest_error(store, name, result);
        finish(store, Some(&bridge), name, result)
    }

    /// Call any export with raw wasm values
    pub(crate) fn call_raw(
        &self,
        store: &mut Store<StoreData>,
        name: &str,
        params: &[Val],
    ) -> Result<Vec<Val>> {
        let func = self.export(store, name)?;
        let ty = func.ty(&*store);
        let signature = signature_of(&ty);
        let given: Vec<ValType> = params.iter().map(val_kind).collect();
        if given != signature.params {
            let given = given
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(PluginError::ArgumentError(format!(
                "export `{}` has signature {}, called with ({})",
                name, signature, given
            )));
        }

        self.begin(store, name)?;
        store.data_mut().transition(CallState::ArgsMarshaled);
        store.data_mut().transition(CallState::Invoking);

        let mut results = vec![Val::I32(0); ty.results().len()];
        let result = match func.call(&mut *store, params, &mut results) {
            Ok(()) => {
                store.data_mut().transition(CallState::ResultMarshaled);
                Ok(results)
            }
            Err(e) => Err(classify_error(&*store, name, e)),
        };
        let result = surface_guest_error(store, name, result);

        let bridge = store.data().bridge.clone();
        finish(store, bridge.as_ref(), name, result)
    }

    fn begin(&self, store: &mut Store<StoreData>, name: &str) -> Result<()> {
        if store.data().state != CallState::Idle {
            return Err(PluginError::ReentrancyError(name.to_string()));
        }

        let fuel = store.data().fuel();
        store.set_fuel(fuel).map_err(|e| PluginError::Trap {
            function: name.to_string(),
            message: format!("Failed to set fuel: {}", e),
        })?;
        store.set_epoch_deadline(1);

        let data = store.data_mut();
        data.call = Some(CallContext::new(name));
        data.guest_error = None;
        data.limiter.reset();
        data.deadline = data.timeout.map(|timeout| Instant::now() + timeout);
        tracing::trace!(function = name, "Call started");
        Ok(())
    }
}

fn invoke_bytes(
    store: &mut Store<StoreData>,
    bridge: &MemoryBridge,
    name: &str,
    typed: &wasmtime::TypedFunc<(i32, i32), i64>,
    input: &[u8],
) -> Result<Vec<u8>> {
    let input_block = bridge.alloc_bytes(&mut *store, input)?;
    store.data_mut().track(input_block);
    store.data_mut().transition(CallState::ArgsMarshaled);

    store.data_mut().transition(CallState::Invoking);
    let packed = typed
        .call(&mut *store, (input_block.ptr as i32, input_block.len as i32))
        .map_err(|e| classify_error(&*store, name, e))?;

    let (ptr, len) = unpack_ptr_len(packed);
    let output = bridge.read(&*store, ptr, len)?;

    // The output buffer belongs to the host now. Identity-style exports
    // hand back a block that is already tracked.
    let output_block = Block { ptr, len };
    let data = store.data_mut();
    if !data.call.as_ref().is_some_and(|call| call.owns(output_block)) {
        data.track(output_block);
    }
    data.transition(CallState::ResultMarshaled);
    Ok(output)
}

/// A message the guest left with `error_set` replaces a normal return or a
/// guest trap; host-side failures keep precedence
fn surface_guest_error<T>(store: &mut Store<StoreData>, name: &str, result: Result<T>) -> Result<T> {
    let Some(message) = store.data_mut().guest_error.take() else {
        return result;
    };
    match result {
        Ok(_) | Err(PluginError::Trap { .. }) => Err(PluginError::GuestError {
            function: name.to_string(),
            message,
        }),
        Err(e) => Err(e),
    }
}

/// Release tracked blocks and return to `Idle`
fn finish<T>(
    store: &mut Store<StoreData>,
    bridge: Option<&MemoryBridge>,
    name: &str,
    result: Result<T>,
) -> Result<T> {
    if result.is_err() {
        store.data_mut().transition(CallState::Failed);
    }

    // Cleanup runs guest code; give it a fresh budget
    let fuel = store.data().fuel();
    if let Err(e) = store.set_fuel(fuel) {
        tracing::warn!(function = name, error = %e, "Failed to refuel for cleanup");
    }
    store.set_epoch_deadline(1);
    store.data_mut().deadline = None;

    let blocks = store
        .data_mut()
        .call
        .as_mut()
        .map(|call| std::mem::take(&mut call.blocks))
        .unwrap_or_default();

    // Every tracked block gets a release attempt, even after a failure
    let mut cleanup_error = None;
    if let Some(bridge) = bridge {
        for block in blocks.into_iter().rev() {
            if let Err(e) = bridge.free(&mut *store, block) {
                tracing::warn!(
                    function = name,
                    ptr = block.ptr,
                    len = block.len,
                    error = %e,
                    "Failed to release call buffer"
                );
                if cleanup_error.is_none() {
                    cleanup_error = Some(e);
                }
            }
        }
    }

    let data = store.data_mut();
    data.call = None;
    data.transition(CallState::Idle);

    let Some(cleanup) = cleanup_error else {
        return result;
    };

    // The guest allocator trapped; its heap can no longer be trusted
    data.poisoned = true;
    match result {
        Ok(_) => {
            tracing::error!(
                function = name,
                error = %cleanup,
                "Cleanup failed; plugin will be closed"
            );
            Err(cleanup)
        }
        Err(e) => {
            tracing::error!(
                function = name,
                error = %e,
                cleanup_error = %cleanup,
                "Cleanup failed after a failed call; plugin will be closed"
            );
            Err(e)
        }
    }
}

fn val_kind(val: &Val) -> ValType {
    match val {
        Val::I32(_) => ValType::I32,
        Val::I64(_) => ValType::I64,
        Val::F32(_) => ValType::F32,
        Val::F64(_) => ValType::F64,
        Val::V128(_) => ValType::V128,
        Val::FuncRef(_) => ValType::FuncRef,
        Val::ExternRef(_) => ValType::ExternRef,
        _ => ValType::Ref,
    }
}

/// Link a registered host function under its namespace and name
pub(crate) fn link_host_function(
    linker: &mut Linker<StoreData>,
    engine: &Engine,
    function: Arc<HostFunction>,
) -> Result<()> {
    let ty = func_type(engine, function.signature())?;
    let namespace = function.namespace_str().to_string();
    let name = function.name().to_string();

    linker
        .func_new(&namespace, &name, ty, move |caller, params, results| {
            invoke_host(caller, &function, params, results).map_err(anyhow::Error::new)
        })
        .map_err(|e| {
            PluginError::InstantiationError(format!(
                "Failed to link {}::{}: {:#}",
                namespace, name, e
            ))
        })?;
    Ok(())
}

/// Link a stub that fails with `UnknownImport` when the guest calls it
pub(crate) fn link_unresolved(
    linker: &mut Linker<StoreData>,
    engine: &Engine,
    import: &FunctionImport,
) -> Result<()> {
    let ty = func_type(engine, &import.signature)?;
    let namespace = import.namespace.clone();
    let name = import.name.clone();

    linker
        .func_new(&import.namespace, &import.name, ty, move |_, _, _| {
            Err(anyhow::Error::new(PluginError::unknown_import(
                namespace.as_str(),
                name.as_str(),
            )))
        })
        .map_err(|e| {
            PluginError::InstantiationError(format!(
                "Failed to link stub for {}::{}: {:#}",
                import.namespace, import.name, e
            ))
        })?;
    Ok(())
}

fn invoke_host(
    caller: Caller<'_, StoreData>,
    function: &HostFunction,
    params: &[Val],
    results: &mut [Val],
) -> Result<()> {
    let name = function.name();
    if caller.data().call.is_none() {
        return Err(PluginError::host_function(
            name,
            "called while no plugin call is in progress",
        ));
    }
    tracing::trace!(
        function = %function.qualified_name(),
        caller = caller.data().current_function(),
        "Host function invoked"
    );

    match function.callable() {
        Callable::Bytes(callback) => {
            let bridge = caller.data().bridge.clone().ok_or_else(|| {
                PluginError::host_function(
                    name,
                    format!(
                        "guest does not export `{}`, `{}` and `{}`",
                        MEMORY_EXPORT, ALLOC_EXPORT, DEALLOC_EXPORT
                    ),
                )
            })?;
            let (ptr, len) = match params {
                [Val::I32(ptr), Val::I32(len)] => (*ptr as u32, *len as u32),
                _ => {
                    return Err(PluginError::host_function(
                        name,
                        "expected (ptr: i32, len: i32) arguments",
                    ))
                }
            };
            let input = bridge.read(&caller, ptr, len)?;

            let mut current = CurrentPlugin::new(caller, name);
            let output = guard(name, || callback(&mut current, &input))?;

            let mut caller = current.into_caller();
            let block = bridge.alloc_bytes(&mut caller, &output)?;
            caller.data_mut().track(block);
            if let Some(slot) = results.first_mut() {
                *slot = Val::I64(block.packed());
            }
        }
        Callable::Raw(callback) => {
            let mut current = CurrentPlugin::new(caller, name);
            guard(name, || callback(&mut current, params, results))?;
        }
    }
    Ok(())
}

/// Run a host callable, turning panics and foreign errors into
/// [`PluginError::HostFunctionError`]
fn guard<T>(function: &str, f: impl FnOnce() -> anyhow::Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(match err.downcast::<PluginError>() {
            Ok(plugin_error) => plugin_error,
            Err(err) => PluginError::host_function(function, format!("{:#}", err)),
        }),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(function, panic = %message, "Host function panicked");
            Err(PluginError::host_function(
                function,
                format!("panicked: {}", message),
            ))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
