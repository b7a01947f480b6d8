//! Virtual module resolution.
//!
//! Every import the compiler cannot resolve on its own is offered to a fixed,
//! ordered list of providers. The first provider that answers wins; a request
//! no provider claims falls through to the compiler's default resolution.

mod excluded;
mod helper;
mod hypothetical;
mod resource;

pub use excluded::ExcludedDependencyProvider;
pub use helper::{HelperConfig, HelperProvider, Helpers, EXTENSION_KEY, RPC_SUFFIX};
pub use hypothetical::{HypotheticalFiles, HypotheticalFilesProvider};
pub use resource::{
    AssetProvider, ResourceProvider, ASSET_EXTENSIONS, ASSET_URI_HELPER, COPY_RESOURCES_HELPER,
    RESOURCE_SCHEME, RESOURCE_URI_HELPER,
};

pub(crate) use excluded::node_resolve_options;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use async_trait::async_trait;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::bundle::{ExcludedDependencies, Target};
use crate::engine::{BuildHooks, ModuleRequest, Redirect, VirtualFs};
use crate::error::Result;
use crate::rpc::RpcInvoker;

/// Synthetic root of generated helper modules.
pub const HELPER_ROOT: &str = "/__helpers";

/// Synthetic root of generated resource modules.
pub const RESOURCE_ROOT: &str = "/__resources";

/// A provider's answer. Without `content` the filename is resolved through
/// the real filesystem; with it, the content is written to the engine's
/// virtual filesystem first (last write wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticModule {
    pub filename: String,
    pub content: Option<String>,
}

impl SyntheticModule {
    pub fn virtual_file(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: Some(content.into()),
        }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            filename: path.as_ref().to_string_lossy().into_owned(),
            content: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Module(SyntheticModule),
    /// Leave unbundled; loaded natively at render time.
    External(String),
}

/// The provider variants, consulted in the order they are registered.
pub enum Provider {
    Helper(HelperProvider),
    Resource(ResourceProvider),
    Asset(AssetProvider),
    Hypothetical(HypotheticalFilesProvider),
    Excluded(ExcludedDependencyProvider),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Helper(_) => "helper",
            Provider::Resource(_) => "resource",
            Provider::Asset(_) => "asset",
            Provider::Hypothetical(_) => "hypothetical",
            Provider::Excluded(_) => "excluded",
        }
    }

    pub async fn handle(&mut self, request: &ModuleRequest) -> Result<Option<Resolution>> {
        match self {
            Provider::Helper(provider) => provider.handle(request).await,
            Provider::Resource(provider) => provider.handle(request).await,
            Provider::Asset(provider) => provider.handle(request).await,
            Provider::Hypothetical(provider) => Ok(provider.handle(request)),
            Provider::Excluded(provider) => Ok(provider.handle(request)),
        }
    }

    async fn finalize(&mut self, target: Target) -> Result<()> {
        match self {
            Provider::Asset(provider) => provider.finalize(target).await,
            _ => Ok(()),
        }
    }
}

/// Inputs of the standard provider chain for one build.
pub struct PipelineOptions {
    pub target: Target,
    pub helpers: Helpers,
    pub hypothetical_files: HypotheticalFiles,
    pub aliases: IndexMap<String, String>,
    /// Dependency directories searched for excluded dependencies.
    pub resolution_roots: Vec<PathBuf>,
    pub rpc: Rc<dyn RpcInvoker>,
}

pub struct ResolutionPipeline {
    target: Target,
    providers: Vec<Provider>,
}

impl ResolutionPipeline {
    pub fn new(target: Target, providers: Vec<Provider>) -> Self {
        Self { target, providers }
    }

    /// helper, resource, asset, hypothetical, then (server only) excluded.
    pub fn standard(options: PipelineOptions) -> Self {
        let PipelineOptions {
            target,
            helpers,
            hypothetical_files,
            aliases,
            resolution_roots,
            rpc,
        } = options;

        let mut providers = Vec::with_capacity(5);
        let excluded = match target {
            Target::Server => Some(ExcludedDependencyProvider::new(
                resolution_roots,
                aliases.keys().cloned().collect(),
                hypothetical_files.keys().cloned().collect(),
                helpers.keys().cloned().collect(),
            )),
            Target::Client => None,
        };

        providers.push(Provider::Helper(HelperProvider::new(helpers)));
        providers.push(Provider::Resource(ResourceProvider::new(Rc::clone(&rpc))));
        providers.push(Provider::Asset(AssetProvider::new(rpc)));
        providers.push(Provider::Hypothetical(HypotheticalFilesProvider::new(
            hypothetical_files,
        )));
        if let Some(excluded) = excluded {
            providers.push(Provider::Excluded(excluded));
        }

        Self::new(target, providers)
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// First non-empty provider answer, if any.
    pub async fn handle(&mut self, request: &ModuleRequest) -> Result<Option<Resolution>> {
        for provider in &mut self.providers {
            if let Some(resolution) = provider.handle(request).await? {
                tracing::debug!(
                    provider = provider.name(),
                    specifier = %request.specifier,
                    "Resolved virtual module"
                );
                return Ok(Some(resolution));
            }
        }
        Ok(None)
    }

    /// Dependencies recorded by the excluded-dependency provider so far.
    pub fn excluded_dependencies(&self) -> ExcludedDependencies {
        self.providers
            .iter()
            .find_map(|provider| match provider {
                Provider::Excluded(excluded) => Some(excluded.excluded().clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[async_trait(?Send)]
impl BuildHooks for ResolutionPipeline {
    async fn resolve(
        &mut self,
        request: &ModuleRequest,
        fs: &mut dyn VirtualFs,
    ) -> Result<Option<Redirect>> {
        Ok(match self.handle(request).await? {
            Some(Resolution::Module(module)) => {
                if let Some(content) = &module.content {
                    fs.write_module(&module.filename, content);
                }
                Some(Redirect::Module(module.filename))
            }
            Some(Resolution::External(specifier)) => Some(Redirect::External(specifier)),
            None => None,
        })
    }

    async fn done(&mut self) -> Result<()> {
        let target = self.target;
        for provider in &mut self.providers {
            provider.finalize(target).await?;
        }
        Ok(())
    }
}

/// Stable 32 hex character digest used for synthetic filenames.
pub(crate) fn content_hash(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .take(16)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Quotes a string as a JS string literal.
pub(crate) fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::engine::VirtualWrite;
    use crate::rpc::{RpcFn, RpcRequest, RpcResponse};

    fn counting_rpc(uri: &'static str) -> (Rc<Cell<usize>>, Rc<dyn RpcInvoker>) {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let rpc = RpcFn(move |_request: RpcRequest| {
            let counter = Rc::clone(&counter);
            async move {
                counter.set(counter.get() + 1);
                Ok::<_, crate::error::Error>(RpcResponse::data(uri))
            }
        });
        (calls, Rc::new(rpc))
    }

    #[tokio::test]
    async fn test_first_match_short_circuits() {
        let (first_calls, first) = counting_rpc("/first.png");
        let (second_calls, second) = counting_rpc("/second.png");
        let mut pipeline = ResolutionPipeline::new(
            Target::Client,
            vec![
                Provider::Resource(ResourceProvider::new(first)),
                Provider::Resource(ResourceProvider::new(second)),
            ],
        );

        let request = ModuleRequest::new("resource://Site/Public/logo.png", "/app/src");
        let resolution = pipeline.handle(&request).await.unwrap().unwrap();

        let Resolution::Module(module) = resolution else {
            panic!("expected a synthetic module");
        };
        assert!(module.content.unwrap().contains("/first.png"));
        assert_eq!(first_calls.get(), 1);
        assert_eq!(second_calls.get(), 0);
    }

    #[tokio::test]
    async fn test_unclaimed_request_falls_through() {
        let (_, rpc) = counting_rpc("/x");
        let mut pipeline = ResolutionPipeline::standard(PipelineOptions {
            target: Target::Client,
            helpers: Helpers::new(),
            hypothetical_files: HypotheticalFiles::new(),
            aliases: IndexMap::new(),
            resolution_roots: vec![],
            rpc,
        });

        let mut writes: Vec<VirtualWrite> = Vec::new();
        let redirect = pipeline
            .resolve(&ModuleRequest::new("./component", "/app/src"), &mut writes)
            .await
            .unwrap();
        assert!(redirect.is_none());
        assert!(writes.is_empty());
    }

    #[tokio::test]
    async fn test_synthetic_content_is_written_before_redirect() {
        let (_, rpc) = counting_rpc("/x");
        let mut files = HypotheticalFiles::new();
        files.insert("fixture.js".into(), "export default 42;".into());
        let mut pipeline = ResolutionPipeline::standard(PipelineOptions {
            target: Target::Client,
            helpers: Helpers::new(),
            hypothetical_files: files,
            aliases: IndexMap::new(),
            resolution_roots: vec![],
            rpc,
        });

        let mut writes: Vec<VirtualWrite> = Vec::new();
        let redirect = pipeline
            .resolve(&ModuleRequest::new("fixture.js", "/app"), &mut writes)
            .await
            .unwrap();
        assert_eq!(redirect, Some(Redirect::Module("/fixture.js".into())));
        assert_eq!(
            writes,
            vec![VirtualWrite {
                filename: "/fixture.js".into(),
                content: "export default 42;".into(),
            }]
        );
    }

    #[test]
    fn test_client_chain_has_no_excluded_provider() {
        let (_, rpc) = counting_rpc("/x");
        let options = |target| PipelineOptions {
            target,
            helpers: Helpers::new(),
            hypothetical_files: HypotheticalFiles::new(),
            aliases: IndexMap::new(),
            resolution_roots: vec![],
            rpc: Rc::clone(&rpc),
        };

        let names = |pipeline: &ResolutionPipeline| {
            pipeline.providers.iter().map(Provider::name).collect::<Vec<_>>()
        };
        assert_eq!(
            names(&ResolutionPipeline::standard(options(Target::Client))),
            ["helper", "resource", "asset", "hypothetical"]
        );
        assert_eq!(
            names(&ResolutionPipeline::standard(options(Target::Server))),
            ["helper", "resource", "asset", "hypothetical", "excluded"]
        );
    }

    #[test]
    fn test_content_hash_is_stable() {
        let hash = content_hash("resource://Site/logo.svg");
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, content_hash("resource://Site/logo.svg"));
        assert_ne!(hash, content_hash("resource://Site/other.svg"));
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string("it's \"x\"\n"), r#""it's \"x\"\n""#);
    }
}
