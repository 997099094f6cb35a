//! WASI context construction from [`WasiOptions`]

use crate::config::WasiOptions;
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::WasiCtxBuilder;

/// Build a preview1 context granting what `options` asks for
///
/// argv[0] is the program name, followed by `options.args`.
pub fn build_ctx(options: &WasiOptions) -> WasiP1Ctx {
    let mut builder = WasiCtxBuilder::new();

    let mut argv = vec![options.program_name.clone()];
    argv.extend(options.args.iter().cloned());
    builder.args(&argv);

    for (key, value) in &options.env {
        builder.env(key, value);
    }

    if options.inherit_stdin {
        builder.inherit_stdin();
    }
    if options.inherit_stdout {
        builder.inherit_stdout();
    }
    if options.inherit_stderr {
        builder.inherit_stderr();
    }

    tracing::debug!(
        permissions = %permission_summary(options),
        "WASI context built"
    );
    builder.build_p1()
}

/// Context with no arguments, environment or stdio
pub fn empty_ctx() -> WasiP1Ctx {
    WasiCtxBuilder::new().build_p1()
}

/// One-line description of what a context built from `options` exposes
pub fn permission_summary(options: &WasiOptions) -> String {
    let mut parts = Vec::new();

    if !options.args.is_empty() {
        parts.push(format!("args: {}", options.args.len()));
    }

    if !options.env.is_empty() {
        let keys: Vec<_> = options.env.iter().map(|(k, _)| k.as_str()).collect();
        parts.push(format!("env: [{}]", keys.join(", ")));
    }

    let mut stdio = Vec::new();
    if options.inherit_stdin {
        stdio.push("stdin");
    }
    if options.inherit_stdout {
        stdio.push("stdout");
    }
    if options.inherit_stderr {
        stdio.push("stderr");
    }
    if !stdio.is_empty() {
        parts.push(format!("stdio: [{}]", stdio.join(", ")));
    }

    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_summary() {
        let options = WasiOptions::default()
            .arg("--verbose")
            .env("HOME", "/home/plugin");

        let summary = permission_summary(&options);
        assert!(summary.contains("args: 1"));
        assert!(summary.contains("HOME"));
        assert!(!summary.contains("/home/plugin"));
        assert!(summary.contains("stdout"));
        assert!(!summary.contains("stdin"));
    }

    #[test]
    fn test_silent_summary() {
        let options = WasiOptions::default().silent();
        assert_eq!(permission_summary(&options), "none");
    }
}
