//! Module loading and introspection
//!
//! Compiles wasm bytes (binary or WAT text) and records every import and
//! export signature. Loading never executes guest code.

use crate::error::{PluginError, Result};
use plinth_api::{Signature, ValType};
use serde::Serialize;
use wasmtime::{Engine, ExternType, FuncType, Module};

/// A function the module imports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionImport {
    pub namespace: String,
    pub name: String,
    pub signature: Signature,
}

/// A function the module exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionExport {
    pub name: String,
    pub signature: Signature,
}

/// Linear memory the module declares or imports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryRequirement {
    /// Initial size in pages
    pub minimum_pages: u64,

    /// Declared maximum in pages, if any
    pub maximum_pages: Option<u64>,

    /// Whether the memory comes from an import rather than the module
    pub imported: bool,
}

/// Signatures and memory layout of a compiled module
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleInfo {
    pub imports: Vec<FunctionImport>,
    pub exports: Vec<FunctionExport>,
    pub memories: Vec<MemoryRequirement>,

    /// Imports that are not functions (`namespace::name`), which the
    /// runtime cannot satisfy
    pub other_imports: Vec<String>,
}

impl ModuleInfo {
    fn from_module(module: &Module) -> Self {
        let mut info = ModuleInfo::default();

        for import in module.imports() {
            match import.ty() {
                ExternType::Func(ty) => info.imports.push(FunctionImport {
                    namespace: import.module().to_string(),
                    name: import.name().to_string(),
                    signature: signature_of(&ty),
                }),
                ExternType::Memory(ty) => {
                    info.memories.push(MemoryRequirement {
                        minimum_pages: ty.minimum(),
                        maximum_pages: ty.maximum(),
                        imported: true,
                    });
                    info.other_imports
                        .push(format!("{}::{}", import.module(), import.name()));
                }
                _ => info
                    .other_imports
                    .push(format!("{}::{}", import.module(), import.name())),
            }
        }

        for export in module.exports() {
            match export.ty() {
                ExternType::Func(ty) => info.exports.push(FunctionExport {
                    name: export.name().to_string(),
                    signature: signature_of(&ty),
                }),
                ExternType::Memory(ty) => info.memories.push(MemoryRequirement {
                    minimum_pages: ty.minimum(),
                    maximum_pages: ty.maximum(),
                    imported: false,
                }),
                _ => {}
            }
        }

        info
    }

    /// Look up an exported function
    pub fn export(&self, name: &str) -> Option<&FunctionExport> {
        self.exports.iter().find(|e| e.name == name)
    }

    /// Look up an imported function
    pub fn import(&self, namespace: &str, name: &str) -> Option<&FunctionImport> {
        self.imports
            .iter()
            .find(|i| i.namespace == namespace && i.name == name)
    }

    /// Exports callable with [`Plugin::call`](crate::Plugin::call)
    pub fn bytes_exports(&self) -> impl Iterator<Item = &FunctionExport> {
        self.exports.iter().filter(|e| e.signature.is_bytes())
    }
}

/// An immutable compiled module
#[derive(Clone)]
pub struct WasmModule {
    module: Module,
    info: ModuleInfo,
}

impl WasmModule {
    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }

    pub(crate) fn inner(&self) -> &Module {
        &self.module
    }
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Compile a module
///
/// # Errors
///
/// - [`PluginError::InvalidBinary`] if the bytes are neither a valid module
///   nor WAT text, even with every wasm proposal enabled
/// - [`PluginError::UnsupportedFeature`] if the module is valid but uses a
///   proposal the engine has disabled
pub fn load(engine: &Engine, bytes: &[u8]) -> Result<WasmModule> {
    // 1. Accept WAT text as well as binaries
    let binary = wat::parse_bytes(bytes).map_err(|e| PluginError::InvalidBinary(e.to_string()))?;

    // 2. Validate against the full feature set to separate malformed input
    //    from merely unsupported input
    wasmparser::Validator::new_with_features(wasmparser::WasmFeatures::all())
        .validate_all(&binary)
        .map_err(|e| PluginError::InvalidBinary(e.to_string()))?;

    // 3. Compile with the engine's own feature set
    let module = Module::from_binary(engine, &binary)
        .map_err(|e| PluginError::UnsupportedFeature(format!("{:#}", e)))?;

    let info = ModuleInfo::from_module(&module);
    tracing::debug!(
        imports = info.imports.len(),
        exports = info.exports.len(),
        "Module loaded"
    );

    Ok(WasmModule { module, info })
}

pub(crate) fn signature_of(ty: &FuncType) -> Signature {
    Signature::new(ty.params().map(val_type), ty.results().map(val_type))
}

pub(crate) fn val_type(ty: wasmtime::ValType) -> ValType {
    match ty {
        wasmtime::ValType::I32 => ValType::I32,
        wasmtime::ValType::I64 => ValType::I64,
        wasmtime::ValType::F32 => ValType::F32,
        wasmtime::ValType::F64 => ValType::F64,
        wasmtime::ValType::V128 => ValType::V128,
        ref ty if ty.is_funcref() => ValType::FuncRef,
        ref ty if ty.is_externref() => ValType::ExternRef,
        _ => ValType::Ref,
    }
}

/// Convert a signature into a wasmtime function type
///
/// Reference types other than `funcref`/`externref` have no host mapping.
pub(crate) fn func_type(engine: &Engine, signature: &Signature) -> Result<FuncType> {
    let convert = |ty: &ValType| -> Result<wasmtime::ValType> {
        Ok(match ty {
            ValType::I32 => wasmtime::ValType::I32,
            ValType::I64 => wasmtime::ValType::I64,
            ValType::F32 => wasmtime::ValType::F32,
            ValType::F64 => wasmtime::ValType::F64,
            ValType::V128 => wasmtime::ValType::V128,
            ValType::FuncRef => wasmtime::ValType::FUNCREF,
            ValType::ExternRef => wasmtime::ValType::EXTERNREF,
            ValType::Ref => {
                return Err(PluginError::UnsupportedFeature(format!(
                    "host signature {} uses an unsupported reference type",
                    signature
                )))
            }
        })
    };
    let params = signature
        .params
        .iter()
        .map(convert)
        .collect::<Result<Vec<_>>>()?;
    let results = signature
        .results
        .iter()
        .map(convert)
        .collect::<Result<Vec<_>>>()?;
    Ok(FuncType::new(engine, params, results))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAT: &str = r#"
        (module
            (import "env" "log" (func (param i32 i32)))
            (memory (export "memory") 1 4)
            (func (export "greet") (param i32 i32) (result i64) i64.const 0)
            (func (export "add") (param f64 f32) (result i32) i32.const 7)
        )
    "#;

    #[test]
    fn test_load_reports_signatures() {
        let engine = Engine::default();
        let module = load(&engine, WAT.as_bytes()).unwrap();
        let info = module.info();

        assert_eq!(info.imports.len(), 1);
        let log = info.import("env", "log").unwrap();
        assert_eq!(log.signature, Signature::new([ValType::I32, ValType::I32], []));

        assert!(info.export("greet").unwrap().signature.is_bytes());
        assert_eq!(
            info.export("add").unwrap().signature,
            Signature::new([ValType::F64, ValType::F32], [ValType::I32])
        );
        let bytes: Vec<_> = info.bytes_exports().map(|e| e.name.as_str()).collect();
        assert_eq!(bytes, vec!["greet"]);

        assert_eq!(
            info.memories,
            vec![MemoryRequirement {
                minimum_pages: 1,
                maximum_pages: Some(4),
                imported: false,
            }]
        );
        assert!(info.other_imports.is_empty());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let engine = Engine::default();
        let err = load(&engine, b"\0asm\x01\0\0\0\xff\xff").unwrap_err();
        assert!(matches!(err, PluginError::InvalidBinary(_)));

        let err = load(&engine, b"definitely not wasm").unwrap_err();
        assert!(matches!(err, PluginError::InvalidBinary(_)));
    }

    #[test]
    fn test_func_type_round_trip() {
        let engine = Engine::default();
        let sig = Signature::new([ValType::I64, ValType::F32], [ValType::F64]);
        let ty = func_type(&engine, &sig).unwrap();
        assert_eq!(signature_of(&ty), sig);

        let err = func_type(&engine, &Signature::new([ValType::Ref], [])).unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedFeature(_)));
    }
}
