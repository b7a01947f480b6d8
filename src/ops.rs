//! Ops backing the sandbox bootstrap: console, module loading and the RPC
//! bridge of each render unit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use serde::Serialize;

use crate::loader::{chunk_source_url, file_source_url, BundleLoader, ResolvedModule};
use crate::rpc::{RpcInvoker, RpcRequest, RpcResponse};

/// Host-side half of a render unit.
pub struct UnitBridge {
    pub loader: BundleLoader,
    pub rpc: Rc<dyn RpcInvoker>,
}

/// Every live render unit, by id.
#[derive(Default)]
pub struct SandboxUnits {
    pub units: HashMap<String, UnitBridge>,
}

impl SandboxUnits {
    fn bridge(&self, unit: &str) -> Result<&UnitBridge, AnyError> {
        self.units
            .get(unit)
            .ok_or_else(|| deno_core::anyhow::anyhow!("Render unit {} is gone", unit))
    }
}

/// Timers may not read high resolution time.
pub struct SandboxPermissions;

impl deno_web::TimersPermission for SandboxPermissions {
    fn allow_hrtime(&mut self) -> bool {
        false
    }
}

#[op2(fast)]
pub fn op_console_log(#[string] msg: &str) {
    tracing::info!(target: "ssr_engine::sandbox", "{}", msg);
}

#[op2(fast)]
pub fn op_console_warn(#[string] msg: &str) {
    tracing::warn!(target: "ssr_engine::sandbox", "{}", msg);
}

#[op2(fast)]
pub fn op_console_error(#[string] msg: &str) {
    tracing::error!(target: "ssr_engine::sandbox", "{}", msg);
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    module: ResolvedModule,
    cache_key: String,
    source_url: String,
    /// Set for modules loaded from disk.
    filename: Option<String>,
    dirname: Option<String>,
}

#[op2]
#[serde]
pub fn op_ssr_resolve(
    state: &mut OpState,
    #[string] unit: &str,
    #[string] specifier: &str,
    #[string] referrer: &str,
) -> Result<ModuleInfo, AnyError> {
    let units = state.borrow::<SandboxUnits>();
    let referrer = (!referrer.is_empty()).then(|| Path::new(referrer));
    let module = units.bridge(unit)?.loader.resolve(specifier, referrer)?;

    let (source_url, filename, dirname) = match &module {
        ResolvedModule::Chunk(name) => (chunk_source_url(unit, name), None, None),
        ResolvedModule::Native(path) | ResolvedModule::Json(path) => (
            file_source_url(path),
            Some(path.to_string_lossy().into_owned()),
            path.parent().map(|dir| dir.to_string_lossy().into_owned()),
        ),
    };

    Ok(ModuleInfo {
        cache_key: module.cache_key(),
        source_url,
        module,
        filename,
        dirname,
    })
}

#[op2]
#[string]
pub fn op_ssr_load(
    state: &mut OpState,
    #[string] unit: &str,
    #[serde] module: ResolvedModule,
) -> Result<String, AnyError> {
    let units = state.borrow::<SandboxUnits>();
    Ok(units.bridge(unit)?.loader.load(&module)?)
}

/// Calls the unit's current invoker, so a replaced invoker takes effect for
/// code that is already running.
#[op2(async)]
#[serde]
pub async fn op_ssr_rpc(
    state: Rc<RefCell<OpState>>,
    #[string] unit: String,
    #[serde] request: RpcRequest,
) -> Result<RpcResponse, AnyError> {
    let rpc = {
        let state = state.borrow();
        Rc::clone(&state.borrow::<SandboxUnits>().bridge(&unit)?.rpc)
    };
    Ok(rpc.call(request).await?)
}

deno_core::extension!(
    ssr_sandbox,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_ssr_resolve,
        op_ssr_load,
        op_ssr_rpc,
    ],
    esm_entry_point = "ext:ssr_sandbox/bootstrap.js",
    esm = ["ext:ssr_sandbox/bootstrap.js" = "src/bootstrap.js"],
);
