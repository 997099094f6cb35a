//! plinth-pdk: Guest-side helpers for plinth plugins
//!
//! Build with `--target wasm32-unknown-unknown` (or `wasm32-wasip1` for
//! plugins using WASI). The host calls exports with `(ptr, len)` pointing at
//! an input buffer it allocated through `plugin_alloc`, and expects a packed
//! `(ptr << 32) | len` result.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plinth_pdk::prelude::*;
//!
//! export_allocator!();
//!
//! host_fn!("env", myHostFunction1);
//!
//! plugin_fn!(greet, |input| {
//!     let mut out = b"Hello, ".to_vec();
//!     out.extend_from_slice(&host::call(myHostFunction1, input));
//!     out
//! });
//!
//! plugin_fn!(count, |_input| {
//!     let n = var::get_string("n").and_then(|s| s.parse::<u64>().ok()).unwrap_or(0) + 1;
//!     var::set("n", n.to_string());
//!     log::info("counted");
//!     n.to_string().into_bytes()
//! });
//! ```
//!
//! `var`, `error` and `log` wrap the host's built-in `plinth` imports and
//! exist only on `wasm32` targets.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

pub use plinth_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    #[cfg(target_arch = "wasm32")]
    pub use crate::{error, log, var};
    pub use crate::{export_allocator, host, host_fn, memory, plugin_fn};
    pub use plinth_api::{pack_ptr_len, unpack_ptr_len, DEFAULT_NAMESPACE};
}

/// Guest allocator and buffer helpers
pub mod memory {
    use super::*;

    /// Allocate `size` bytes; returns 0 for non-positive sizes or failure
    #[inline]
    pub fn plugin_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        let Ok(layout) = Layout::from_size_align(size as usize, 1) else {
            return 0;
        };
        unsafe { alloc(layout) as i32 }
    }

    /// Release memory obtained from [`plugin_alloc`]
    ///
    /// Null pointers and non-positive sizes are ignored.
    #[inline]
    pub fn plugin_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        let Ok(layout) = Layout::from_size_align(size as usize, 1) else {
            return;
        };
        unsafe { dealloc(ptr as u32 as usize as *mut u8, layout) }
    }

    /// Copy the buffer at `ptr` into an owned vector
    ///
    /// # Safety
    /// `ptr` must point to `len` readable bytes, or be 0.
    pub unsafe fn read_input(ptr: i32, len: i32) -> Vec<u8> {
        if ptr == 0 || len <= 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(ptr as u32 as usize as *const u8, len as usize).to_vec()
    }

    /// Copy the buffer a packed value points at
    ///
    /// # Safety
    /// Same as [`read_input`].
    pub unsafe fn read_packed(packed: i64) -> Vec<u8> {
        let (ptr, len) = unpack_ptr_len(packed);
        read_input(ptr as i32, len as i32)
    }

    /// Move `bytes` into a fresh block and return it packed
    ///
    /// The host copies the block and releases it with `plugin_dealloc`.
    /// Empty output is returned as 0 without allocating.
    pub fn write_output(bytes: &[u8]) -> i64 {
        if bytes.is_empty() {
            return 0;
        }
        let ptr = plugin_alloc(bytes.len() as i32);
        if ptr == 0 {
            match Layout::from_size_align(bytes.len(), 1) {
                Ok(layout) => handle_alloc_error(layout),
                Err(_) => return 0,
            }
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr as u32 as usize as *mut u8,
                bytes.len(),
            );
        }
        pack_ptr_len(ptr as u32, bytes.len() as u32)
    }
}

/// Calling host functions
pub mod host {
    use super::memory;

    /// Signature of a bytes host function import
    pub type HostImport = unsafe extern "C" fn(i32, i32) -> i64;

    /// Call a bytes host function declared with [`host_fn!`](crate::host_fn)
    ///
    /// The result block belongs to the host and stays valid until the
    /// current export returns; this copies it out.
    pub fn call(import: HostImport, input: &[u8]) -> Vec<u8> {
        unsafe {
            let packed = import(input.as_ptr() as usize as i32, input.len() as i32);
            memory::read_packed(packed)
        }
    }
}

/// Imports from the host's built-in `plinth` namespace
#[cfg(target_arch = "wasm32")]
mod sys {
    #[link(wasm_import_module = "plinth")]
    extern "C" {
        pub fn error_set(ptr: i32, len: i32);
        pub fn var_get(key_ptr: i32, key_len: i32) -> i64;
        pub fn var_set(key_ptr: i32, key_len: i32, ptr: i32, len: i32);
        pub fn log_trace(ptr: i32, len: i32);
        pub fn log_debug(ptr: i32, len: i32);
        pub fn log_info(ptr: i32, len: i32);
        pub fn log_warn(ptr: i32, len: i32);
        pub fn log_error(ptr: i32, len: i32);
    }
}

/// Variables kept by the host across calls to the same plugin instance
#[cfg(target_arch = "wasm32")]
pub mod var {
    use super::{memory, sys};

    /// Bytes stored under `key`, if any
    pub fn get(key: &str) -> Option<Vec<u8>> {
        let packed = unsafe { sys::var_get(key.as_ptr() as i32, key.len() as i32) };
        if packed == 0 {
            return None;
        }
        Some(unsafe { memory::read_packed(packed) })
    }

    /// Value under `key` decoded as UTF-8; invalid text reads as `None`
    pub fn get_string(key: &str) -> Option<String> {
        get(key).and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Store `value` under `key`; an empty value removes it
    ///
    /// The host fails the current call if its variable store is full.
    pub fn set(key: &str, value: impl AsRef<[u8]>) {
        let value = value.as_ref();
        unsafe {
            sys::var_set(
                key.as_ptr() as i32,
                key.len() as i32,
                value.as_ptr() as i32,
                value.len() as i32,
            )
        }
    }

    pub fn remove(key: &str) {
        set(key, b"")
    }
}

/// Fail the current call with a message
#[cfg(target_arch = "wasm32")]
pub mod error {
    use super::sys;

    /// Record `message` as the call's error
    ///
    /// The export still returns normally; the host reports the call as
    /// failed with this message.
    pub fn set(message: &str) {
        unsafe { sys::error_set(message.as_ptr() as i32, message.len() as i32) }
    }
}

/// Log through the host's subscriber
#[cfg(target_arch = "wasm32")]
pub mod log {
    use super::sys;

    macro_rules! level {
        ($($name:ident => $import:ident),+ $(,)?) => {
            $(
                pub fn $name(message: &str) {
                    unsafe { sys::$import(message.as_ptr() as i32, message.len() as i32) }
                }
            )+
        };
    }

    level! {
        trace => log_trace,
        debug => log_debug,
        info => log_info,
        warn => log_warn,
        error => log_error,
    }
}

/// Export `plugin_alloc` and `plugin_dealloc`
#[macro_export]
macro_rules! export_allocator {
    () => {
        #[no_mangle]
        pub extern "C" fn plugin_alloc(size: i32) -> i32 {
            $crate::memory::plugin_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn plugin_dealloc(ptr: i32, size: i32) {
            $crate::memory::plugin_dealloc(ptr, size)
        }
    };
}

/// Export a bytes-in/bytes-out function
///
/// The handler must not capture anything.
///
/// ```rust,ignore
/// plugin_fn!(identity, |input| input.to_vec());
/// ```
#[macro_export]
macro_rules! plugin_fn {
    ($name:ident, $handler:expr) => {
        #[no_mangle]
        pub extern "C" fn $name(ptr: i32, len: i32) -> i64 {
            let handler: fn(&[u8]) -> Vec<u8> = $handler;
            let input = unsafe { $crate::memory::read_input(ptr, len) };
            $crate::memory::write_output(&handler(&input))
        }
    };
}

/// Declare bytes host function imports from a namespace
///
/// ```rust,ignore
/// host_fn!("env", myHostFunction1, log);
/// ```
#[macro_export]
macro_rules! host_fn {
    ($namespace:literal, $($name:ident),+ $(,)?) => {
        #[link(wasm_import_module = $namespace)]
        extern "C" {
            $(
                #[allow(non_snake_case)]
                fn $name(ptr: i32, len: i32) -> i64;
            )+
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_matches_host_layout() {
        let packed = pack_ptr_len(0x1234_5678, 0x100);
        assert_eq!(packed >> 32, 0x1234_5678);
        assert_eq!(packed & 0xFFFF_FFFF, 0x100);
    }

    #[test]
    fn test_alloc_edge_cases() {
        assert_eq!(memory::plugin_alloc(0), 0);
        assert_eq!(memory::plugin_alloc(-1), 0);
        // No-ops
        memory::plugin_dealloc(0, 16);
        memory::plugin_dealloc(1024, 0);
    }

    #[test]
    fn test_empty_buffers() {
        assert_eq!(memory::write_output(&[]), 0);
        assert!(unsafe { memory::read_input(0, 10) }.is_empty());
        assert!(unsafe { memory::read_packed(0) }.is_empty());
    }

    #[test]
    fn test_read_input_copies() {
        let data = b"Benjamin".to_vec();
        // Only meaningful where pointers fit in 32 bits
        if (data.as_ptr() as usize) <= u32::MAX as usize {
            let copy = unsafe { memory::read_input(data.as_ptr() as usize as i32, data.len() as i32) };
            assert_eq!(copy, data);
        }
    }
}
