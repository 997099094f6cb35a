//! Linking of `wasi_snapshot_preview1` imports

use crate::dispatch::StoreData;
use crate::error::{PluginError, Result};
use crate::module::{func_type, ModuleInfo};
use plinth_api::{ValType, ERRNO_NOSYS, WASI_NAMESPACE};
use wasmtime::{Engine, Linker, Store, Val};

/// Add the preview1 implementation plus ENOSYS stubs for the rest
///
/// Every WASI import of the module must be satisfied afterwards. Imports the
/// implementation lacks are stubbed when they return a single `i32` errno;
/// anything else is reported before instantiation.
pub(crate) fn link(
    linker: &mut Linker<StoreData>,
    store: &mut Store<StoreData>,
    engine: &Engine,
    info: &ModuleInfo,
) -> Result<()> {
    wasmtime_wasi::preview1::add_to_linker_sync(linker, |data: &mut StoreData| &mut data.wasi)
        .map_err(|e| {
            PluginError::InstantiationError(format!("Failed to add WASI to linker: {:#}", e))
        })?;

    for import in info.imports.iter().filter(|i| i.namespace == WASI_NAMESPACE) {
        if linker.get(&mut *store, WASI_NAMESPACE, &import.name).is_some() {
            continue;
        }

        if import.signature.results != [ValType::I32] {
            return Err(PluginError::UnsupportedFeature(format!(
                "WASI function {}::{} {} is not available",
                WASI_NAMESPACE, import.name, import.signature
            )));
        }

        tracing::warn!(
            function = %import.name,
            "WASI function not implemented; linking ENOSYS stub"
        );
        let ty = func_type(engine, &import.signature)?;
        linker
            .func_new(WASI_NAMESPACE, &import.name, ty, |_, _, results| {
                if let Some(errno) = results.first_mut() {
                    *errno = Val::I32(ERRNO_NOSYS);
                }
                Ok(())
            })
            .map_err(|e| {
                PluginError::InstantiationError(format!(
                    "Failed to link WASI stub {}: {:#}",
                    import.name, e
                ))
            })?;
    }

    Ok(())
}
