//! Memory bridge between host and guest
//!
//! Allocations go through the guest's own allocator exports
//! (`plugin_alloc` / `plugin_dealloc`) so host-written buffers never collide
//! with guest heap data. All ranges are bounds-checked against the current
//! memory size before any copy.

use crate::dispatch::StoreData;
use crate::error::{PluginError, Result};
use plinth_api::{pack_ptr_len, ALLOC_EXPORT, DEALLOC_EXPORT, MEMORY_EXPORT};
use wasmtime::{AsContext, AsContextMut, Extern, Instance, Memory, Store, TypedFunc};

/// A region of guest memory allocated by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub ptr: u32,
    pub len: u32,
}

impl Block {
    pub const EMPTY: Block = Block { ptr: 0, len: 0 };

    pub fn is_empty(&self) -> bool {
        self.ptr == 0 || self.len == 0
    }

    /// `(ptr << 32) | len`, as returned to guests
    pub fn packed(&self) -> i64 {
        pack_ptr_len(self.ptr, self.len)
    }
}

/// Handles to the guest's memory and allocator
#[derive(Clone)]
pub(crate) struct MemoryBridge {
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
}

impl MemoryBridge {
    /// Locate `memory`, `plugin_alloc` and `plugin_dealloc`
    ///
    /// Returns `Ok(None)` when the module does not take part in the bytes
    /// convention, and an error when the exports exist with the wrong types.
    pub(crate) fn from_instance(
        store: &mut Store<StoreData>,
        instance: &Instance,
    ) -> Result<Option<Self>> {
        let memory = match instance.get_export(&mut *store, MEMORY_EXPORT) {
            Some(Extern::Memory(memory)) => memory,
            Some(_) => {
                return Err(PluginError::InstantiationError(format!(
                    "export `{}` is not a memory",
                    MEMORY_EXPORT
                )))
            }
            None => return Ok(None),
        };

        if instance.get_func(&mut *store, ALLOC_EXPORT).is_none()
            || instance.get_func(&mut *store, DEALLOC_EXPORT).is_none()
        {
            return Ok(None);
        }

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut *store, ALLOC_EXPORT)
            .map_err(|e| {
                PluginError::InstantiationError(format!("{}: {:#}", ALLOC_EXPORT, e))
            })?;
        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut *store, DEALLOC_EXPORT)
            .map_err(|e| {
                PluginError::InstantiationError(format!("{}: {:#}", DEALLOC_EXPORT, e))
            })?;

        Ok(Some(Self {
            memory,
            alloc_fn,
            dealloc_fn,
        }))
    }

    /// Current memory size in bytes
    pub fn size(&self, store: impl AsContext) -> u64 {
        self.memory.data_size(&store) as u64
    }

    /// Allocate `len` bytes in guest memory
    ///
    /// A zero-length request returns [`Block::EMPTY`] without calling the
    /// guest.
    pub fn alloc(&self, mut store: impl AsContextMut<Data = StoreData>, len: usize) -> Result<Block> {
        if len == 0 {
            return Ok(Block::EMPTY);
        }
        let requested = len as u64;
        let len = i32::try_from(len).map_err(|_| PluginError::OutOfMemory { requested })?;

        let mut store = store.as_context_mut();
        match self.alloc_fn.call(&mut store, len) {
            Ok(0) => Err(PluginError::OutOfMemory { requested }),
            Ok(ptr) => {
                let block = Block {
                    ptr: ptr as u32,
                    len: len as u32,
                };
                self.check_bounds(&store, block.ptr, block.len)?;
                Ok(block)
            }
            Err(_) if store.data().limiter.denied() => Err(PluginError::OutOfMemory { requested }),
            Err(e) => Err(crate::dispatch::classify_error(&store, ALLOC_EXPORT, e)),
        }
    }

    /// Allocate a block and copy `bytes` into it
    ///
    /// The block is released again if the copy fails.
    pub fn alloc_bytes(
        &self,
        mut store: impl AsContextMut<Data = StoreData>,
        bytes: &[u8],
    ) -> Result<Block> {
        let block = self.alloc(&mut store, bytes.len())?;
        if let Err(e) = self.write(&mut store, block.ptr, bytes) {
            if let Err(free_err) = self.free(&mut store, block) {
                tracing::warn!(error = %free_err, "Failed to release block after write error");
            }
            return Err(e);
        }
        Ok(block)
    }

    /// Copy `bytes` into guest memory at `ptr`
    pub fn write(
        &self,
        mut store: impl AsContextMut<Data = StoreData>,
        ptr: u32,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let memory_size = self.size(&store);
        let out_of_bounds = || PluginError::OutOfBounds {
            ptr: ptr as u64,
            len: bytes.len() as u64,
            memory_size,
        };
        let len = u32::try_from(bytes.len()).map_err(|_| out_of_bounds())?;
        self.check_bounds(&store, ptr, len)?;
        self.memory
            .write(&mut store, ptr as usize, bytes)
            .map_err(|_| out_of_bounds())
    }

    /// Copy `len` bytes at `ptr` out of guest memory
    pub fn read(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.check_bounds(&store, ptr, len)?;
        let data = self.memory.data(&store);
        let start = ptr as usize;
        Ok(data[start..start + len as usize].to_vec())
    }

    /// Release a block through the guest deallocator
    pub fn free(&self, mut store: impl AsContextMut<Data = StoreData>, block: Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        let mut store = store.as_context_mut();
        self.dealloc_fn
            .call(&mut store, (block.ptr as i32, block.len as i32))
            .map_err(|e| crate::dispatch::classify_error(&store, DEALLOC_EXPORT, e))
    }

    fn check_bounds(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<()> {
        let memory_size = self.size(&store);
        let end = (ptr as u64) + (len as u64);
        if end > memory_size {
            return Err(PluginError::OutOfBounds {
                ptr: ptr as u64,
                len: len as u64,
                memory_size,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBridge").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_block() {
        assert!(Block::EMPTY.is_empty());
        assert_eq!(Block::EMPTY.packed(), 0);

        let block = Block { ptr: 1024, len: 5 };
        assert!(!block.is_empty());
        assert_eq!(plinth_api::unpack_ptr_len(block.packed()), (1024, 5));
    }
}
