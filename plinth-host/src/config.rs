//! Plugin configuration recognized at open time

use crate::error::{PluginError, Result};
use crate::builtins::DEFAULT_MAX_VAR_BYTES;
use crate::logging::{LogConfig, LogFormat, LogLevel, LogTarget};
use serde::Deserialize;
use std::time::Duration;

/// Default growth ceiling for guest linear memory: 256 pages (16 MiB)
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 256;

/// Options for a single plugin instance
///
/// Every field is optional when deserializing; keys are camelCase:
///
/// ```json
/// { "enableWasi": true, "maxMemoryPages": 16, "logTarget": "stderr", "logLevel": "debug",
///   "logFormat": "json", "maxVarBytes": 4096 }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginConfig {
    /// Install the WASI shim
    pub enable_wasi: bool,

    /// Maximum number of 64 KiB pages guest memory may grow to
    pub max_memory_pages: u32,

    /// Where diagnostic logs are written
    ///
    /// With neither a target nor a level, logging is left untouched. A level
    /// alone logs to stderr.
    pub log_target: Option<LogTarget>,

    /// Minimum severity logged
    pub log_level: Option<LogLevel>,

    pub log_format: LogFormat,

    /// Ceiling for the plugin's variable store (keys plus values)
    pub max_var_bytes: u64,

    /// Fuel granted to each call (CPU limit); `None` is unlimited
    pub fuel_limit: Option<u64>,

    /// Wall-clock deadline per call, in milliseconds
    pub timeout_ms: Option<u64>,

    /// Link unresolved function imports to stubs that trap with
    /// `UnknownImport` when called, instead of failing `open`
    pub allow_unresolved_imports: bool,

    /// WASI context settings, used when `enable_wasi` is set
    pub wasi: WasiOptions,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable_wasi: false,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
            log_target: None,
            log_level: None,
            log_format: LogFormat::Compact,
            max_var_bytes: DEFAULT_MAX_VAR_BYTES,
            fuel_limit: None,
            timeout_ms: None,
            allow_unresolved_imports: false,
            wasi: WasiOptions::default(),
        }
    }
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PluginError::ArgumentError(format!("Invalid plugin config: {}", e)))
    }

    pub fn with_wasi(mut self, enable: bool) -> Self {
        self.enable_wasi = enable;
        self
    }

    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }

    pub fn with_log(mut self, target: impl Into<LogTarget>, level: LogLevel) -> Self {
        self.log_target = Some(target.into());
        self.log_level = Some(level);
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn with_max_var_bytes(mut self, bytes: u64) -> Self {
        self.max_var_bytes = bytes;
        self
    }

    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn allow_unresolved_imports(mut self, allow: bool) -> Self {
        self.allow_unresolved_imports = allow;
        self
    }

    pub fn with_wasi_options(mut self, options: WasiOptions) -> Self {
        self.wasi = options;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Memory ceiling in bytes
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_pages as u64 * plinth_api::WASM_PAGE_SIZE
    }

    pub(crate) fn log_config(&self) -> Option<LogConfig> {
        let target = match (&self.log_target, self.log_level) {
            (Some(target), _) => target.clone(),
            (None, Some(_)) => LogTarget::Stderr,
            (None, None) => return None,
        };
        let mut config = LogConfig::new(target).format(self.log_format);
        config.level = self.log_level;
        Some(config)
    }
}

/// Settings for the WASI context
///
/// The context never preopens directories; stdio is the only file surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WasiOptions {
    /// Program name (argv[0])
    pub program_name: String,

    /// Arguments after argv[0]
    pub args: Vec<String>,

    /// Environment variables visible to the guest
    pub env: Vec<(String, String)>,

    pub inherit_stdin: bool,
    pub inherit_stdout: bool,
    pub inherit_stderr: bool,
}

impl Default for WasiOptions {
    fn default() -> Self {
        Self {
            program_name: "plugin".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            inherit_stdin: false,
            inherit_stdout: true,
            inherit_stderr: true,
        }
    }
}

impl WasiOptions {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Close stdout and stderr for the guest
    pub fn silent(mut self) -> Self {
        self.inherit_stdout = false;
        self.inherit_stderr = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = PluginConfig::default();
        assert!(!config.enable_wasi);
        assert_eq!(config.max_memory_pages, DEFAULT_MAX_MEMORY_PAGES);
        assert_eq!(config.max_memory_bytes(), 16 * 1024 * 1024);
        assert!(config.log_config().is_none());
        assert!(config.timeout().is_none());
    }

    #[test]
    fn test_from_json() {
        let config = PluginConfig::from_json(
            r#"{
                "enableWasi": true,
                "maxMemoryPages": 4,
                "logTarget": "/var/log/plugin.log",
                "logLevel": "debug",
                "timeoutMs": 250,
                "wasi": { "args": ["--fast"], "env": [["MODE", "test"]] }
            }"#,
        )
        .unwrap();

        assert!(config.enable_wasi);
        assert_eq!(config.max_memory_pages, 4);
        assert_eq!(
            config.log_target,
            Some(LogTarget::File(PathBuf::from("/var/log/plugin.log")))
        );
        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.wasi.args, vec!["--fast".to_string()]);
        assert_eq!(config.wasi.env, vec![("MODE".into(), "test".into())]);
        // Untouched fields keep their defaults
        assert_eq!(config.wasi.program_name, "plugin");
        assert!(config.wasi.inherit_stdout);
    }

    #[test]
    fn test_from_json_rejects_bad_level() {
        let err = PluginConfig::from_json(r#"{ "logLevel": "loud" }"#).unwrap_err();
        assert!(matches!(err, PluginError::ArgumentError(_)));
    }

    #[test]
    fn test_log_config() {
        let config = PluginConfig::new().with_log("stdout", LogLevel::Warn);
        let log = config.log_config().unwrap();
        assert_eq!(log.target, LogTarget::Stdout);
        assert_eq!(log.level, Some(LogLevel::Warn));
        assert_eq!(log.format, LogFormat::Compact);
    }

    #[test]
    fn test_level_without_target_logs_to_stderr() {
        let config = PluginConfig::from_json(r#"{ "logLevel": "warn" }"#).unwrap();
        let log = config.log_config().unwrap();
        assert_eq!(log.target, LogTarget::Stderr);
        assert_eq!(log.level, Some(LogLevel::Warn));
    }

    #[test]
    fn test_json_log_format_and_var_limit() {
        let config = PluginConfig::from_json(
            r#"{ "logTarget": "stdout", "logFormat": "json", "maxVarBytes": 64 }"#,
        )
        .unwrap();
        assert_eq!(config.log_config().unwrap().format, LogFormat::Json);
        assert_eq!(config.max_var_bytes, 64);
        assert_eq!(PluginConfig::default().max_var_bytes, DEFAULT_MAX_VAR_BYTES);
    }
}
