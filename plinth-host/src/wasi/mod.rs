//! WASI preview1 support
//!
//! Plugins built for `wasm32-wasip1` import system calls from
//! `wasi_snapshot_preview1`. When a plugin is opened with `enableWasi`, those
//! imports are served by `wasmtime-wasi`; the context only ever exposes
//! arguments, environment variables, clocks, randomness and (optionally)
//! inherited stdio.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  wasi_snapshot_preview1 imports                  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  implemented by wasmtime-wasi  ──►  linked as-is                 │
//! │                                                                  │
//! │  unknown, returns one i32      ──►  stub returning ENOSYS (52)   │
//! │                                                                  │
//! │  unknown, any other signature  ──►  UnsupportedFeature at open   │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No directories are preopened, so filesystem calls fail with the usual
//! WASI errno values rather than touching the host.

pub mod context;
pub(crate) mod shim;

pub use context::{build_ctx, empty_ctx, permission_summary};
