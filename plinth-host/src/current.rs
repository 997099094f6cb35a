//! View of the calling plugin handed to host functions

use crate::dispatch::StoreData;
use crate::error::{PluginError, Result};
use crate::memory::{Block, MemoryBridge};
use plinth_api::{unpack_ptr_len, ALLOC_EXPORT, DEALLOC_EXPORT};
use wasmtime::Caller;

/// The plugin instance that invoked a host function
///
/// Gives host functions bounds-checked access to guest memory. Buffers
/// written through [`write`](Self::write) are owned by the current call and
/// released when it returns.
pub struct CurrentPlugin<'a> {
    caller: Caller<'a, StoreData>,
    function: String,
}

impl<'a> CurrentPlugin<'a> {
    pub(crate) fn new(caller: Caller<'a, StoreData>, function: &str) -> Self {
        Self {
            caller,
            function: function.to_string(),
        }
    }

    pub(crate) fn into_caller(self) -> Caller<'a, StoreData> {
        self.caller
    }

    /// Name of the host function being executed
    pub fn function_name(&self) -> &str {
        &self.function
    }

    /// Name of the export the host call came from
    pub fn export_name(&self) -> &str {
        self.caller.data().current_function()
    }

    /// Guest memory size in bytes, or 0 if the plugin exports no memory
    pub fn memory_size(&self) -> u64 {
        self.caller
            .data()
            .bridge
            .as_ref()
            .map_or(0, |bridge| bridge.size(&self.caller))
    }

    /// Copy `len` bytes at `ptr` out of guest memory
    pub fn read(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.bridge()?.read(&self.caller, ptr, len)
    }

    /// Read a buffer described by a packed `(ptr << 32) | len` value
    pub fn read_packed(&self, packed: i64) -> Result<Vec<u8>> {
        let (ptr, len) = unpack_ptr_len(packed);
        self.read(ptr, len)
    }

    /// Read a UTF-8 string out of guest memory
    pub fn read_str(&self, ptr: u32, len: u32) -> Result<String> {
        String::from_utf8(self.read(ptr, len)?).map_err(|e| {
            PluginError::host_function(&self.function, format!("guest string is not UTF-8: {}", e))
        })
    }

    /// Copy `bytes` into a fresh guest block
    ///
    /// The block stays valid until the current call returns.
    pub fn write(&mut self, bytes: &[u8]) -> Result<Block> {
        let bridge = self.bridge()?;
        let block = bridge.alloc_bytes(&mut self.caller, bytes)?;
        self.caller.data_mut().track(block);
        Ok(block)
    }

    /// Call back into the plugin
    ///
    /// Instances are not re-entrant: this always fails with
    /// [`PluginError::ReentrancyError`] while a host function is running.
    pub fn call(&mut self, export: &str, _input: &[u8]) -> Result<Vec<u8>> {
        tracing::warn!(
            function = %self.function,
            export,
            state = %self.caller.data().state,
            "Re-entrant call rejected"
        );
        Err(PluginError::ReentrancyError(export.to_string()))
    }

    fn bridge(&self) -> Result<MemoryBridge> {
        self.caller.data().bridge.clone().ok_or_else(|| {
            PluginError::host_function(
                &self.function,
                format!(
                    "guest does not export memory, `{}` and `{}`",
                    ALLOC_EXPORT, DEALLOC_EXPORT
                ),
            )
        })
    }
}

impl std::fmt::Debug for CurrentPlugin<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrentPlugin")
            .field("function", &self.function)
            .field("export", &self.export_name())
            .finish_non_exhaustive()
    }
}
