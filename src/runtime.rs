//! Sandbox runtime - executes bundles in a single V8 isolate.
//!
//! Each [`RenderUnit`] is a unit object inside the isolate with its own module
//! cache, render function and bridge values. Sandboxed code gets only:
//! - console.log/info/debug/warn/error (forwarded to `tracing`)
//! - setTimeout/setInterval and their clear functions
//! - URL, URLSearchParams, TextEncoder, TextDecoder, atob, btoa
//! - `require` limited to the unit's bundle and its excluded dependencies
//! - `__rpc` and `__internalData` bridging to the host
//!
//! Every module runs against its own context object. Undeclared assignments
//! stay in that context and the JS built-ins it sees are the ones the realm
//! started with, so units cannot reach each other through globals.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use deno_core::{serde_v8, v8, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::bundle::{entry_chunk, Bundle, ExcludedDependencies};
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::loader::{chunk_source_url, BundleLoader};
use crate::ops::{ssr_sandbox, SandboxPermissions, SandboxUnits, UnitBridge};
use crate::rpc::RpcInvoker;
use crate::sourcemap::{SourceMapGuard, SourceMapLoader, SourceMapRegistry};

struct SandboxInner {
    runtime: Mutex<JsRuntime>,
    op_state: Rc<RefCell<OpState>>,
    source_maps: SourceMapRegistry,
    /// Units dropped since the runtime was last locked.
    released: RefCell<Vec<String>>,
}

impl SandboxInner {
    /// Locks the runtime and forgets every unit dropped in the meantime.
    async fn lock(&self) -> Result<MutexGuard<'_, JsRuntime>> {
        let mut runtime = self.runtime.lock().await;
        let released = self.released.take();
        if !released.is_empty() {
            {
                let mut state = self.op_state.borrow_mut();
                let units = state.borrow_mut::<SandboxUnits>();
                for id in &released {
                    units.units.remove(id);
                }
            }
            let ids = serde_json::to_string(&released)?;
            runtime
                .execute_script("<ssr>", format!("__ssr_sandbox__.release({})", ids))
                .map_err(render_error)?;
            tracing::debug!(count = released.len(), "Released render units");
        }
        Ok(runtime)
    }
}

/// One V8 isolate hosting every render unit of a service.
pub struct Sandbox {
    inner: Rc<SandboxInner>,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        let source_maps = SourceMapRegistry::new();

        // Configure V8 heap limits if specified
        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(SourceMapLoader::new(source_maps.clone()))),
            extensions: vec![
                deno_webidl::deno_webidl::init_ops_and_esm(),
                deno_console::deno_console::init_ops_and_esm(),
                deno_url::deno_url::init_ops_and_esm(),
                deno_web::deno_web::init_ops_and_esm::<SandboxPermissions>(
                    Arc::new(deno_web::BlobStore::default()),
                    None,
                ),
                ssr_sandbox::init_ops_and_esm(),
            ],
            create_params,
            ..Default::default()
        });

        if config.max_heap_size.is_some() {
            // Keep the limit so V8 fails the allocation instead of growing
            runtime.add_near_heap_limit_callback(|current, initial| {
                tracing::warn!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "Sandbox near heap limit"
                );
                current
            });
        }

        let op_state = runtime.op_state();
        {
            let mut state = op_state.borrow_mut();
            state.put(SandboxPermissions);
            state.put(SandboxUnits::default());
        }

        Self {
            inner: Rc::new(SandboxInner {
                runtime: Mutex::new(runtime),
                op_state,
                source_maps,
                released: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Evaluates the entry chunk of `bundle` and returns a unit ready to
    /// render. Fails with [`Error::InvalidBundle`] unless exactly one chunk
    /// is marked initial.
    pub async fn create_unit(
        &self,
        bundle: Bundle,
        excluded: ExcludedDependencies,
        context: Value,
        internal_data: Value,
        rpc: Rc<dyn RpcInvoker>,
    ) -> Result<RenderUnit> {
        let entry = entry_chunk(&bundle)?.0.to_string();
        let id = uuid::Uuid::new_v4().to_string();
        let source_maps = bundle
            .iter()
            .filter_map(|(name, chunk)| {
                let map = chunk.map.as_ref()?;
                Some((chunk_source_url(&id, name), Rc::from(map.as_bytes())))
            })
            .collect();

        let unit = RenderUnit {
            id,
            sandbox: Rc::clone(&self.inner),
            source_maps,
            state: Cell::new(UnitState::Constructed),
        };

        let mut runtime = self.inner.lock().await?;
        self.inner.op_state.borrow_mut().borrow_mut::<SandboxUnits>().units.insert(
            unit.id.clone(),
            UnitBridge {
                loader: BundleLoader::new(Rc::new(bundle), Rc::new(excluded)),
                rpc,
            },
        );

        let script = format!(
            "__ssr_sandbox__.createUnit({}, {}, {}, {})",
            serde_json::to_string(&unit.id)?,
            serde_json::to_string(&entry)?,
            serde_json::to_string(&context)?,
            serde_json::to_string(&internal_data)?,
        );
        let evaluated = {
            let _maps = unit.register_source_maps();
            runtime.execute_script("<ssr>", script)
        };
        drop(runtime);

        // A failed unit is dropped here and released on the next lock.
        evaluated.map_err(render_error)?;
        unit.state.set(UnitState::Ready);
        tracing::debug!(unit = %unit.id, entry = %entry, "Render unit ready");
        Ok(unit)
    }

    /// Number of units still registered with the runtime.
    #[cfg(test)]
    async fn unit_count(&self) -> Result<usize> {
        let mut runtime = self.inner.lock().await?;
        let count = runtime
            .execute_script("<ssr>", "__ssr_sandbox__.size()")
            .map_err(render_error)?;
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, count);
        serde_v8::from_v8(scope, local).map_err(|e| Error::Render(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Constructed,
    Ready,
    Rendering,
}

impl UnitState {
    fn name(self) -> &'static str {
        match self {
            UnitState::Constructed => "constructed",
            UnitState::Ready => "ready",
            UnitState::Rendering => "rendering",
        }
    }
}

/// Puts a rendering unit back into `Ready` however the render ends.
struct RenderingGuard<'a>(&'a Cell<UnitState>);

impl Drop for RenderingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(UnitState::Ready);
    }
}

#[derive(Debug, Deserialize)]
struct Thrown {
    message: String,
    stack: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenderOutcome {
    ok: bool,
    #[serde(default)]
    value: Value,
    error: Option<Thrown>,
}

/// A loaded bundle whose render function can be invoked repeatedly.
pub struct RenderUnit {
    id: String,
    sandbox: Rc<SandboxInner>,
    source_maps: Vec<(String, Rc<[u8]>)>,
    state: Cell<UnitState>,
}

impl RenderUnit {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> UnitState {
        self.state.get()
    }

    fn expect_ready(&self) -> Result<()> {
        match self.state.get() {
            UnitState::Ready => Ok(()),
            other => Err(Error::InvalidState(other.name())),
        }
    }

    fn register_source_maps(&self) -> Vec<SourceMapGuard> {
        self.source_maps
            .iter()
            .map(|(name, map)| self.sandbox.source_maps.register(name, Rc::clone(map)))
            .collect()
    }

    /// Calls the render function with the current context.
    pub async fn render(&self) -> Result<Value> {
        self.expect_ready()?;
        self.state.set(UnitState::Rendering);
        let _ready = RenderingGuard(&self.state);

        let mut runtime = self.sandbox.lock().await?;
        let _maps = self.register_source_maps();

        let script = format!(
            "__ssr_sandbox__.render({})",
            serde_json::to_string(&self.id)?
        );
        let promise = runtime.execute_script("<ssr>", script).map_err(render_error)?;
        let resolve = runtime.resolve(promise);
        let settled = runtime
            .with_event_loop_promise(Box::pin(resolve), PollEventLoopOptions::default())
            .await
            .map_err(|e| {
                if e.to_string().contains("still pending") {
                    Error::Render("Render function returned unresolved promise".into())
                } else {
                    render_error(e)
                }
            })?;

        let outcome: RenderOutcome = {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, settled);
            serde_v8::from_v8(scope, local).map_err(|e| Error::Render(e.to_string()))?
        };

        match outcome {
            RenderOutcome { ok: true, value, .. } => Ok(value),
            RenderOutcome {
                error: Some(thrown),
                ..
            } => Err(Error::Render(thrown.stack.unwrap_or(thrown.message))),
            RenderOutcome { error: None, .. } => {
                Err(Error::Render("Render function failed".into()))
            }
        }
    }

    /// Replaces the context of the next render and the internal data seen by
    /// sandboxed code. No module is evaluated again.
    pub async fn adjust(&self, context: Value, internal_data: Value) -> Result<()> {
        self.expect_ready()?;
        let mut runtime = self.sandbox.lock().await?;
        let script = format!(
            "__ssr_sandbox__.adjust({}, {}, {})",
            serde_json::to_string(&self.id)?,
            serde_json::to_string(&context)?,
            serde_json::to_string(&internal_data)?,
        );
        runtime.execute_script("<ssr>", script).map_err(render_error)?;
        Ok(())
    }

    /// Routes every later `__rpc` call of this unit to `rpc`, including calls
    /// made by code that is already running.
    pub fn update_rpc(&self, rpc: Rc<dyn RpcInvoker>) -> Result<()> {
        self.expect_ready()?;
        let mut state = self.sandbox.op_state.borrow_mut();
        let bridge = state
            .borrow_mut::<SandboxUnits>()
            .units
            .get_mut(&self.id)
            .ok_or(Error::InvalidState("released"))?;
        bridge.rpc = rpc;
        Ok(())
    }
}

impl Drop for RenderUnit {
    fn drop(&mut self) {
        self.sandbox.released.borrow_mut().push(self.id.clone());
    }
}

fn render_error(error: deno_core::error::AnyError) -> Error {
    Error::Render(error.to_string())
}
