//! Host function registry
//!
//! Maps `(namespace, name)` to host-implemented functions that guests import.
//! Registration takes `&mut self`; once every function is registered the
//! registry is frozen behind an [`Arc`] and handed to the
//! [`Runtime`](crate::Runtime), so it is read-only while plugins run.

use crate::current::CurrentPlugin;
use crate::error::{PluginError, Result};
use plinth_api::{Signature, BUILTIN_NAMESPACE, DEFAULT_NAMESPACE};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use wasmtime::Val;

/// Callable taking the guest's input bytes and returning output bytes
pub type BytesCallback =
    Arc<dyn Fn(&mut CurrentPlugin<'_>, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Callable operating directly on wasm values
pub type RawCallback =
    Arc<dyn Fn(&mut CurrentPlugin<'_>, &[Val], &mut [Val]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Callable {
    Bytes(BytesCallback),
    Raw(RawCallback),
}

/// A host-implemented function a guest can import
///
/// # Example
///
/// ```rust,ignore
/// let echo = HostFunction::new("myHostFunction1", |input| {
///     let mut out = b"echo:".to_vec();
///     out.extend_from_slice(input);
///     Ok(out)
/// });
/// ```
#[derive(Clone)]
pub struct HostFunction {
    namespace: String,
    name: String,
    signature: Signature,
    callable: Callable,
}

impl HostFunction {
    /// Bytes-in/bytes-out function in the default namespace
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self::with_context(name, move |_, input| f(input))
    }

    /// Bytes function that can also inspect the calling plugin
    pub fn with_context<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut CurrentPlugin<'_>, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.into(),
            signature: Signature::bytes(),
            callable: Callable::Bytes(Arc::new(f)),
        }
    }

    /// Function with an explicit signature working on raw wasm values
    ///
    /// `results` is pre-sized to the signature's result count.
    pub fn raw<F>(name: impl Into<String>, signature: Signature, f: F) -> Self
    where
        F: Fn(&mut CurrentPlugin<'_>, &[Val], &mut [Val]) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.into(),
            signature,
            callable: Callable::Raw(Arc::new(f)),
        }
    }

    /// Place the function in another import module
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn namespace_str(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn callable(&self) -> &Callable {
        &self.callable
    }

    /// `namespace::name`
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.namespace, self.name)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Table of host functions keyed by `(namespace, name)`
#[derive(Debug, Default, Clone)]
pub struct HostFunctionRegistry {
    functions: HashMap<(String, String), Arc<HostFunction>>,
}

impl HostFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function
    ///
    /// # Errors
    ///
    /// - [`PluginError::DuplicateRegistration`] if `(namespace, name)` is
    ///   taken. The earlier registration is kept.
    /// - [`PluginError::ArgumentError`] for the reserved `plinth` namespace
    pub fn register(&mut self, function: HostFunction) -> Result<()> {
        if function.namespace == BUILTIN_NAMESPACE {
            return Err(PluginError::ArgumentError(format!(
                "namespace `{}` is reserved for built-in host functions",
                BUILTIN_NAMESPACE
            )));
        }
        let key = (function.namespace.clone(), function.name.clone());
        if self.functions.contains_key(&key) {
            return Err(PluginError::DuplicateRegistration {
                namespace: key.0,
                name: key.1,
            });
        }

        tracing::debug!(
            function = %function.qualified_name(),
            signature = %function.signature,
            "Host function registered"
        );
        self.functions.insert(key, Arc::new(function));
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, function: HostFunction) -> Result<Self> {
        self.register(function)?;
        Ok(self)
    }

    /// Look up a host function
    ///
    /// # Errors
    ///
    /// [`PluginError::UnknownImport`] if nothing is registered under the name.
    pub fn resolve(&self, namespace: &str, name: &str) -> Result<Arc<HostFunction>> {
        self.functions
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| PluginError::unknown_import(namespace, name))
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.functions
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostFunction> {
        self.functions.values().map(|f| f.as_ref())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Freeze the registry for sharing between runtimes and plugins
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_api::ValType;

    fn echo(name: &str) -> HostFunction {
        HostFunction::new(name, |input| Ok(input.to_vec()))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HostFunctionRegistry::new();
        registry.register(echo("myHostFunction1")).unwrap();

        let function = registry.resolve("env", "myHostFunction1").unwrap();
        assert_eq!(function.name(), "myHostFunction1");
        assert_eq!(function.namespace_str(), DEFAULT_NAMESPACE);
        assert!(function.signature().is_bytes());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = HostFunctionRegistry::new();
        registry.register(echo("dup")).unwrap();

        let second = HostFunction::raw("dup", Signature::new([ValType::I32], []), |_, _, _| Ok(()));
        let err = registry.register(second).unwrap_err();
        assert!(matches!(
            err,
            PluginError::DuplicateRegistration { ref namespace, ref name }
                if namespace == "env" && name == "dup"
        ));

        // First registration intact
        let kept = registry.resolve("env", "dup").unwrap();
        assert!(kept.signature().is_bytes());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_name_in_other_namespace() {
        let registry = HostFunctionRegistry::new()
            .with(echo("log"))
            .unwrap()
            .with(echo("log").namespace("console"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("env", "log"));
        assert!(registry.contains("console", "log"));

        let mut names: Vec<_> = registry.iter().map(HostFunction::qualified_name).collect();
        names.sort();
        assert_eq!(names, vec!["console::log".to_string(), "env::log".to_string()]);
    }

    #[test]
    fn test_builtin_namespace_is_reserved() {
        let mut registry = HostFunctionRegistry::new();
        let err = registry.register(echo("var_get").namespace("plinth")).unwrap_err();
        assert!(matches!(err, PluginError::ArgumentError(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = HostFunctionRegistry::new();
        let err = registry.resolve("env", "missing").unwrap_err();
        assert!(matches!(err, PluginError::UnknownImport { .. }));
        assert!(registry.is_empty());
    }
}
