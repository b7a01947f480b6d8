//! The four commands exposed to the host: `transpile`, `render`,
//! `shallowRender` and `bundle`.
//!
//! Compiler state, render units and pending client bundles live in the
//! [`SessionCache`] under the caller's identifier. The sandbox is created on
//! the first render.

use std::cell::OnceCell;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use futures::FutureExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::bundle::{Bundle, ExcludedDependencies, Target};
use crate::cache::SessionCache;
use crate::config::ServiceConfig;
use crate::engine::BuildEngine;
use crate::error::{Error, Result};
use crate::resolve::{Helpers, HypotheticalFiles};
use crate::rpc::RpcInvoker;
use crate::runtime::{RenderUnit, Sandbox};
use crate::session::{BuildRequest, BuildSession, SessionInputs};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspileRequest {
    pub identifier: String,
    #[serde(alias = "serverFile")]
    pub entry_file: PathBuf,
    #[serde(default)]
    pub helpers: Helpers,
    #[serde(default)]
    pub hypothetical_files: HypotheticalFiles,
    #[serde(default)]
    pub aliases: IndexMap<String, String>,
    #[serde(default)]
    pub extract_dependencies: bool,
    pub base_directory: Option<PathBuf>,
    pub public_path: Option<String>,
    /// Client entry built in the background when `prepare_client_bundle` is set.
    pub client_file: Option<PathBuf>,
    #[serde(default)]
    pub prepare_client_bundle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspileResponse {
    pub bundle: Bundle,
    pub dependencies: Vec<PathBuf>,
    pub excluded_dependencies: ExcludedDependencies,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub identifier: String,
    pub bundle: Bundle,
    #[serde(default, alias = "resolvedPaths")]
    pub excluded_dependencies: ExcludedDependencies,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub internal_data: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShallowRenderRequest {
    pub identifier: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub internal_data: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRequest {
    pub identifier: String,
    pub client_file: PathBuf,
    #[serde(default)]
    pub helpers: Helpers,
    #[serde(default)]
    pub hypothetical_files: HypotheticalFiles,
    #[serde(default)]
    pub aliases: IndexMap<String, String>,
    pub base_directory: Option<PathBuf>,
    pub public_path: Option<String>,
    pub externals: Option<Value>,
}

/// A decoded host command.
#[derive(Debug, Clone)]
pub enum Command {
    Transpile(TranspileRequest),
    Render(RenderRequest),
    ShallowRender(ShallowRenderRequest),
    Bundle(BundleRequest),
}

impl Command {
    pub fn parse(name: &str, payload: Value) -> Result<Self> {
        Ok(match name {
            "transpile" => Command::Transpile(serde_json::from_value(payload)?),
            "render" => Command::Render(serde_json::from_value(payload)?),
            "shallowRender" => Command::ShallowRender(serde_json::from_value(payload)?),
            "bundle" => Command::Bundle(serde_json::from_value(payload)?),
            other => return Err(Error::UnknownCommand(other.to_string())),
        })
    }
}

pub struct Service {
    config: ServiceConfig,
    engine: Rc<dyn BuildEngine>,
    sessions: Rc<SessionCache<Rc<RenderUnit>>>,
    sandbox: OnceCell<Sandbox>,
}

impl Service {
    pub fn new(config: ServiceConfig, engine: Rc<dyn BuildEngine>) -> Self {
        Self {
            sessions: Rc::new(SessionCache::from_config(&config)),
            config,
            engine,
            sandbox: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn sandbox(&self) -> &Sandbox {
        self.sandbox.get_or_init(|| {
            tracing::debug!(max_heap_size = ?self.config.sandbox.max_heap_size, "Starting sandbox");
            Sandbox::new(&self.config.sandbox)
        })
    }

    fn session(&self, inputs: SessionInputs) -> BuildSession {
        BuildSession::new(Rc::clone(&self.engine), &self.config, inputs)
    }

    /// Runs one command and encodes its result.
    pub async fn execute(&self, command: Command, rpc: Rc<dyn RpcInvoker>) -> Result<Value> {
        Ok(match command {
            Command::Transpile(request) => serde_json::to_value(self.transpile(request, rpc).await?)?,
            Command::Render(request) => self.render(request, rpc).await?,
            Command::ShallowRender(request) => {
                self.shallow_render(request, rpc).await?.unwrap_or(Value::Null)
            }
            Command::Bundle(request) => serde_json::to_value(self.bundle(request, rpc).await?)?,
        })
    }

    /// Builds the server bundle of a program. The render unit cached for the
    /// identifier is dropped since it runs an outdated bundle.
    pub async fn transpile(
        &self,
        request: TranspileRequest,
        rpc: Rc<dyn RpcInvoker>,
    ) -> Result<TranspileResponse> {
        self.sessions.purge_expired();
        let identifier = request.identifier.clone();
        drop(self.sessions.remove_render_unit(&identifier));

        let session = self.session(SessionInputs {
            helpers: request.helpers,
            hypothetical_files: request.hypothetical_files,
            aliases: request.aliases,
            rpc,
        });

        tracing::info!(identifier = %identifier, "Transpiling");
        let started = Instant::now();
        let output = session
            .run(
                Target::Server,
                BuildRequest {
                    entry: request.entry_file,
                    base_directory: request.base_directory.clone(),
                    public_path: request.public_path.clone(),
                    externals: None,
                    cache: self.sessions.cache_blob(&identifier, Target::Server),
                },
            )
            .await?;
        tracing::info!(
            identifier = %identifier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transpiled"
        );

        if let Some(blob) = output.cache {
            self.sessions.store_cache_blob(&identifier, Target::Server, blob);
        }

        if request.prepare_client_bundle {
            match request.client_file {
                Some(client_file) => self.prepare_client_bundle(
                    &identifier,
                    session,
                    BuildRequest {
                        entry: client_file,
                        base_directory: request.base_directory,
                        public_path: request.public_path,
                        ..Default::default()
                    },
                ),
                None => tracing::warn!(
                    identifier = %identifier,
                    "Client bundle preparation requested without a client file"
                ),
            }
        }

        Ok(TranspileResponse {
            bundle: output.bundle,
            dependencies: if request.extract_dependencies {
                output.dependencies
            } else {
                Vec::new()
            },
            excluded_dependencies: output.excluded,
        })
    }

    /// Starts the client build in the background unless one is already
    /// pending for `identifier`. Must run inside a `LocalSet`.
    fn prepare_client_bundle(&self, identifier: &str, session: BuildSession, request: BuildRequest) {
        let sessions = Rc::downgrade(&self.sessions);
        let owner = identifier.to_string();
        let pending = self.sessions.prepare_bundle(identifier, move || {
            client_build(sessions, owner, session, request)
                .map(|result| result.map_err(Rc::new))
                .boxed_local()
                .shared()
        });

        let identifier = identifier.to_string();
        tokio::task::spawn_local(async move {
            if let Err(e) = pending.await {
                tracing::warn!(identifier = %identifier, error = %e, "Client bundle preparation failed");
            }
        });
    }

    /// Builds a program for execution and renders it once. The unit is kept
    /// for shallow renders only when that first render succeeds.
    pub async fn render(&self, request: RenderRequest, rpc: Rc<dyn RpcInvoker>) -> Result<Value> {
        self.sessions.purge_expired();
        tracing::info!(identifier = %request.identifier, "Rendering");
        let started = Instant::now();

        let unit = self
            .sandbox()
            .create_unit(
                request.bundle,
                request.excluded_dependencies,
                request.context,
                request.internal_data,
                rpc,
            )
            .await?;
        let result = unit.render().await?;
        self.sessions
            .store_render_unit(&request.identifier, Rc::new(unit));

        tracing::info!(
            identifier = %request.identifier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rendered"
        );
        Ok(result)
    }

    /// Re-renders the cached unit against new input. `None` when no unit is
    /// cached for the identifier.
    pub async fn shallow_render(
        &self,
        request: ShallowRenderRequest,
        rpc: Rc<dyn RpcInvoker>,
    ) -> Result<Option<Value>> {
        self.sessions.purge_expired();
        let Some(unit) = self.sessions.render_unit(&request.identifier) else {
            tracing::info!(
                identifier = %request.identifier,
                "Shallow rendering impossible, identifier is unknown"
            );
            return Ok(None);
        };

        unit.update_rpc(rpc)?;
        unit.adjust(request.context, request.internal_data).await?;

        tracing::info!(identifier = %request.identifier, "Shallow rendering");
        let started = Instant::now();
        let result = unit.render().await?;
        tracing::info!(
            identifier = %request.identifier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Shallow rendered"
        );
        Ok(Some(result))
    }

    /// Returns the client bundle, joining a pending preparation if one was
    /// started by `transpile`.
    pub async fn bundle(&self, request: BundleRequest, rpc: Rc<dyn RpcInvoker>) -> Result<Bundle> {
        self.sessions.purge_expired();
        let identifier = request.identifier;

        if let Some(pending) = self.sessions.pending_bundle(&identifier) {
            tracing::info!(identifier = %identifier, "Waiting for bundle preparation");
            let started = Instant::now();
            let result = pending.await;
            drop(self.sessions.take_pending_bundle(&identifier));
            tracing::info!(
                identifier = %identifier,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Bundle preparation joined"
            );
            return result.map_err(|e| Rc::try_unwrap(e).unwrap_or_else(|e| Error::Compile(e.to_string())));
        }

        let session = self.session(SessionInputs {
            helpers: request.helpers,
            hypothetical_files: request.hypothetical_files,
            aliases: request.aliases,
            rpc,
        });
        tracing::info!(identifier = %identifier, "Bundling");
        let started = Instant::now();
        let bundle = client_build(
            Rc::downgrade(&self.sessions),
            identifier.clone(),
            session,
            BuildRequest {
                entry: request.client_file,
                base_directory: request.base_directory,
                public_path: request.public_path,
                externals: request.externals,
                cache: None,
            },
        )
        .await?;
        tracing::info!(
            identifier = %identifier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Bundled"
        );
        Ok(bundle)
    }
}

/// Client build reusing and refreshing the identifier's client cache blob.
async fn client_build(
    sessions: Weak<SessionCache<Rc<RenderUnit>>>,
    identifier: String,
    session: BuildSession,
    mut request: BuildRequest,
) -> Result<Bundle> {
    request.cache = sessions
        .upgrade()
        .and_then(|sessions| sessions.cache_blob(&identifier, Target::Client));
    let output = session.run(Target::Client, request).await?;
    if let (Some(sessions), Some(blob)) = (sessions.upgrade(), output.cache) {
        sessions.store_cache_blob(&identifier, Target::Client, blob);
    }
    Ok(output.bundle)
}
