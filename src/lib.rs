//! # SSR Engine
//!
//! Builds programs for server-side rendering and runs them in a deno_core
//! sandbox.
//!
//! - **Resolution pipeline**: helper, resource, asset, hypothetical-file and
//!   excluded-dependency providers intercept imports the compiler cannot
//!   resolve on its own
//! - **Build sessions**: one compilation per program and target through a
//!   pluggable [`BuildEngine`], with incremental compiler state reused per
//!   identifier
//! - **Sandbox**: bundles execute inside a V8 isolate with a custom
//!   `require`; render units re-render against new input without
//!   re-evaluating modules
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use ssr_engine::{ProcessEngine, Service, ServiceConfig};
//!
//! let engine = Rc::new(ProcessEngine::new("./compiler", vec![]));
//! let service = Service::new(ServiceConfig::default(), engine);
//!
//! let built = service.transpile(transpile_request, rpc.clone()).await?;
//! let html = service.render(render_request, rpc.clone()).await?;
//! let again = service.shallow_render(shallow_request, rpc).await?;
//! ```

mod bundle;
mod cache;
mod config;
mod engine;
mod error;
mod format;
mod loader;
mod ops;
mod resolve;
mod rpc;
mod runtime;
mod service;
mod session;
mod sourcemap;

pub use bundle::{entry_chunk, Bundle, BundleEntry, CacheBlob, ExcludedDependencies, Target};
pub use cache::{PendingBundle, SessionCache};
pub use config::{SandboxConfig, ServiceConfig, DEVELOPMENT_SESSION_TTL, PREPARATION_TTL};
pub use engine::{
    BuildConfig, BuildEngine, BuildHooks, CompiledChunk, CompilerOutput, ModuleRequest,
    ProcessEngine, Redirect, VirtualFs, VirtualWrite,
};
pub use error::{Error, Result};
pub use format::{format_message, select_error};
pub use resolve::{
    AssetProvider, ExcludedDependencyProvider, HelperConfig, HelperProvider, Helpers,
    HypotheticalFiles, HypotheticalFilesProvider, PipelineOptions, Provider, Resolution,
    ResolutionPipeline, ResourceProvider, SyntheticModule, HELPER_ROOT, RESOURCE_ROOT,
    RESOURCE_SCHEME,
};
pub use rpc::{RpcError, RpcFn, RpcInvoker, RpcRequest, RpcResponse};
pub use runtime::{RenderUnit, Sandbox, UnitState};
pub use service::{
    BundleRequest, Command, RenderRequest, Service, ShallowRenderRequest, TranspileRequest,
    TranspileResponse,
};
pub use session::{BuildOutput, BuildRequest, BuildSession, SessionInputs};
