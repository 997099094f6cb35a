//! plinth-api: Calling convention shared by plinth hosts and guests
//!
//! This crate defines the ABI between the host runtime and a wasm plugin.
//! Payloads cross the boundary as raw bytes; any encoding on top of them
//! belongs to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Import module used when a host function does not name one.
///
/// Rust guests built for `wasm32` place `extern "C"` imports here unless
/// `#[link(wasm_import_module = ...)]` says otherwise.
pub const DEFAULT_NAMESPACE: &str = "env";

/// Linear memory export every plugin must provide
pub const MEMORY_EXPORT: &str = "memory";

/// Guest allocator: `plugin_alloc(len: i32) -> i32`, returns 0 on failure
pub const ALLOC_EXPORT: &str = "plugin_alloc";

/// Guest deallocator: `plugin_dealloc(ptr: i32, len: i32)`
pub const DEALLOC_EXPORT: &str = "plugin_dealloc";

/// Import module for the host services built into every runtime
/// (variables, error reporting, logging)
pub const BUILTIN_NAMESPACE: &str = "plinth";

/// Import module for WASI preview1 system calls
pub const WASI_NAMESPACE: &str = "wasi_snapshot_preview1";

/// WASI errno returned by system calls the host does not implement
pub const ERRNO_NOSYS: i32 = 52;

/// Size of one wasm page in bytes
pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Pack a pointer and length into a single i64 value
///
/// The pointer lives in the high 32 bits, the length in the low 32 bits.
/// `pack_ptr_len(0, 0)` is the empty buffer.
#[inline]
pub fn pack_ptr_len(ptr: u32, len: u32) -> i64 {
    ((ptr as u64) << 32 | len as u64) as i64
}

/// Unpack ptr and len from a packed i64
#[inline]
pub fn unpack_ptr_len(packed: i64) -> (u32, u32) {
    let packed = packed as u64;
    ((packed >> 32) as u32, (packed & 0xFFFF_FFFF) as u32)
}

/// WebAssembly value types as seen across the host/guest boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
    /// Any other reference type (GC proposal)
    Ref,
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
            ValType::Ref => "ref",
        };
        f.write_str(name)
    }
}

/// Parameter and result types of a function
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature {
    /// Parameter types, in order
    pub params: Vec<ValType>,

    /// Result types, in order
    pub results: Vec<ValType>,
}

impl Signature {
    /// Create a signature from parameter and result types
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    /// The bytes-in/bytes-out convention: `(ptr: i32, len: i32) -> i64`
    pub fn bytes() -> Self {
        Self::new([ValType::I32, ValType::I32], [ValType::I64])
    }

    /// Whether this signature follows the bytes convention
    pub fn is_bytes(&self) -> bool {
        *self == Self::bytes()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[ValType]| {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({}) -> ({})", join(&self.params), join(&self.results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let packed = pack_ptr_len(0x1234_5678, 0x100);
        assert_eq!(unpack_ptr_len(packed), (0x1234_5678, 0x100));
    }

    #[test]
    fn test_pack_high_pointer() {
        // Pointers above 2 GiB set the sign bit of the packed value
        let packed = pack_ptr_len(0x8000_0010, 0xFFFF_FFFF);
        assert!(packed < 0);
        assert_eq!(unpack_ptr_len(packed), (0x8000_0010, 0xFFFF_FFFF));
    }

    #[test]
    fn test_empty_buffer_is_zero() {
        assert_eq!(pack_ptr_len(0, 0), 0);
        assert_eq!(unpack_ptr_len(0), (0, 0));
    }

    #[test]
    fn test_bytes_signature() {
        let sig = Signature::bytes();
        assert!(sig.is_bytes());
        assert_eq!(sig.to_string(), "(i32, i32) -> (i64)");

        let other = Signature::new([ValType::F64, ValType::F32], [ValType::I32]);
        assert!(!other.is_bytes());
        assert_eq!(other.to_string(), "(f64, f32) -> (i32)");
    }

    #[test]
    fn test_signature_serialization() {
        let sig = Signature::new([ValType::I32], [ValType::F64]);
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, r#"{"params":["i32"],"results":["f64"]}"#);

        let decoded: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, sig);
    }
}
