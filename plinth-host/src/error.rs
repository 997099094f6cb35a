//! Error types for the plugin runtime
//!
//! Every public operation returns either a value or a [`PluginError`].
//! Load and instantiation errors abort `open`; call-time errors fail a single
//! call and leave the plugin callable unless [`PluginError::is_fatal`] says
//! otherwise.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = PluginError> = std::result::Result<T, E>;

/// Errors raised by the plugin runtime
#[derive(Debug, Error)]
pub enum PluginError {
    /// Input is not a well-formed wasm module
    #[error("Invalid wasm binary: {0}")]
    InvalidBinary(String),

    /// Module needs a wasm feature or syscall the host does not provide
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Host function already registered: {namespace}::{name}")]
    DuplicateRegistration { namespace: String, name: String },

    #[error("Unknown import: {namespace}::{name}")]
    UnknownImport { namespace: String, name: String },

    #[error("Unknown export: {0}")]
    UnknownExport(String),

    /// Guest memory could not grow to satisfy an allocation; `requested`
    /// is the allocation size, or the refused memory size for guest growth
    #[error("Out of guest memory: {requested} bytes requested")]
    OutOfMemory { requested: u64 },

    #[error("Guest memory access out of bounds: ptr={ptr}, len={len}, memory_size={memory_size}")]
    OutOfBounds {
        ptr: u64,
        len: u64,
        memory_size: u64,
    },

    #[error("Instantiation failed: {0}")]
    InstantiationError(String),

    /// Export exists but does not fit the requested calling convention
    #[error("Argument error: {0}")]
    ArgumentError(String),

    /// A host callable failed or panicked
    #[error("Host function {function} failed: {message}")]
    HostFunctionError { function: String, message: String },

    #[error("Re-entrant call into {0} rejected")]
    ReentrancyError(String),

    #[error("Plugin is closed")]
    PluginClosedError,

    /// The guest failed the call through the `error_set` built-in
    #[error("Plugin {function} reported an error: {message}")]
    GuestError { function: String, message: String },

    /// Guest code trapped
    #[error("Guest trapped in {function}: {message}")]
    Trap { function: String, message: String },

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("Call to {function} exceeded its {timeout_ms}ms deadline")]
    Timeout { function: String, timeout_ms: u64 },

    #[error(transparent)]
    Logging(#[from] crate::logging::LoggingError),
}

/// Tag identifying a [`PluginError`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidBinary,
    UnsupportedFeature,
    DuplicateRegistration,
    UnknownImport,
    UnknownExport,
    OutOfMemory,
    OutOfBounds,
    InstantiationError,
    ArgumentError,
    HostFunctionError,
    ReentrancyError,
    PluginClosedError,
    GuestError,
    Trap,
    FuelExhausted,
    Timeout,
    Logging,
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidBinary(_) => ErrorKind::InvalidBinary,
            Self::UnsupportedFeature(_) => ErrorKind::UnsupportedFeature,
            Self::DuplicateRegistration { .. } => ErrorKind::DuplicateRegistration,
            Self::UnknownImport { .. } => ErrorKind::UnknownImport,
            Self::UnknownExport(_) => ErrorKind::UnknownExport,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Self::InstantiationError(_) => ErrorKind::InstantiationError,
            Self::ArgumentError(_) => ErrorKind::ArgumentError,
            Self::HostFunctionError { .. } => ErrorKind::HostFunctionError,
            Self::ReentrancyError(_) => ErrorKind::ReentrancyError,
            Self::PluginClosedError => ErrorKind::PluginClosedError,
            Self::GuestError { .. } => ErrorKind::GuestError,
            Self::Trap { .. } => ErrorKind::Trap,
            Self::FuelExhausted => ErrorKind::FuelExhausted,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Logging(_) => ErrorKind::Logging,
        }
    }

    /// Whether this error leaves the plugin closed
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PluginClosedError | Self::Timeout { .. })
    }

    pub(crate) fn host_function(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HostFunctionError {
            function: function.into(),
            message: message.into(),
        }
    }

    pub(crate) fn unknown_import(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownImport {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}
