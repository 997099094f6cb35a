//! Async handle for sharing one plugin between tasks

use crate::error::{PluginError, Result};
use crate::plugin::Plugin;
use std::sync::Arc;
use tokio::sync::Mutex;
use wasmtime::Val;

/// Cloneable handle to a [`Plugin`] behind an async mutex
///
/// Calls queue on the mutex and run on the blocking thread pool, so guest
/// code never stalls the async executor. One call runs at a time.
#[derive(Clone)]
pub struct PluginHandle {
    plugin: Arc<Mutex<Plugin>>,
}

impl PluginHandle {
    pub fn new(plugin: Plugin) -> Self {
        Self {
            plugin: Arc::new(Mutex::new(plugin)),
        }
    }

    /// Call a bytes export
    pub async fn call(&self, name: impl Into<String>, input: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        let name = name.into();
        let input = input.into();
        let mut plugin = self.plugin.clone().lock_owned().await;

        let function = name.clone();
        tokio::task::spawn_blocking(move || plugin.call(&name, &input))
            .await
            .map_err(|e| PluginError::Trap {
                function,
                message: format!("call task failed: {}", e),
            })?
    }

    /// Call any export with raw wasm values
    pub async fn call_raw(&self, name: impl Into<String>, params: Vec<Val>) -> Result<Vec<Val>> {
        let name = name.into();
        let mut plugin = self.plugin.clone().lock_owned().await;

        let function = name.clone();
        tokio::task::spawn_blocking(move || plugin.call_raw(&name, &params))
            .await
            .map_err(|e| PluginError::Trap {
                function,
                message: format!("call task failed: {}", e),
            })?
    }

    pub async fn function_exists(&self, name: &str) -> bool {
        self.plugin.lock().await.function_exists(name)
    }

    pub async fn is_closed(&self) -> bool {
        self.plugin.lock().await.is_closed()
    }

    pub async fn close(&self) {
        self.plugin.lock().await.close();
    }
}

impl From<Plugin> for PluginHandle {
    fn from(plugin: Plugin) -> Self {
        Self::new(plugin)
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle").finish_non_exhaustive()
    }
}
