//! One compilation of one program for one target.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::bundle::{entry_chunk, Bundle, BundleEntry, CacheBlob, ExcludedDependencies, Target};
use crate::config::ServiceConfig;
use crate::engine::{
    BuildConfig, BuildEngine, CompiledChunk, CompilerOutput, Mode, OutputConfig, ResolveConfig,
    BUNDLE_ROOT,
};
use crate::error::{Error, Result};
use crate::format::{format_message, select_error};
use crate::resolve::{
    Helpers, HypotheticalFiles, PipelineOptions, ResolutionPipeline, HELPER_ROOT, RESOURCE_ROOT,
};
use crate::rpc::RpcInvoker;

/// Build configuration overrides read from the program directory.
pub const OVERRIDE_FILE: &str = "ssr.config.json";

const DEPENDENCY_DIR: &str = "node_modules";
const SOURCE_MAP_DEVTOOL: &str = "cheap-module-source-map";

/// Per-program inputs shared by every build of one command.
#[derive(Clone)]
pub struct SessionInputs {
    pub helpers: Helpers,
    pub hypothetical_files: HypotheticalFiles,
    pub aliases: IndexMap<String, String>,
    pub rpc: Rc<dyn RpcInvoker>,
}

/// What to build.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub entry: PathBuf,
    pub base_directory: Option<PathBuf>,
    pub public_path: Option<String>,
    pub externals: Option<Value>,
    /// Compiler state of the previous build of the same program and target.
    pub cache: Option<CacheBlob>,
}

impl BuildRequest {
    pub fn new(entry: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            ..Default::default()
        }
    }

    /// The program directory: the explicit base directory or the entry's.
    pub fn program_directory(&self) -> PathBuf {
        self.base_directory.clone().unwrap_or_else(|| {
            self.entry
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"))
        })
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub bundle: Bundle,
    pub cache: Option<CacheBlob>,
    pub excluded: ExcludedDependencies,
    /// Source files and configuration files the build read.
    pub dependencies: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct BuildSession {
    engine: Rc<dyn BuildEngine>,
    production: bool,
    service_modules: PathBuf,
    inputs: SessionInputs,
}

impl BuildSession {
    pub fn new(engine: Rc<dyn BuildEngine>, config: &ServiceConfig, inputs: SessionInputs) -> Self {
        Self {
            engine,
            production: config.production,
            service_modules: config.service_modules.clone(),
            inputs,
        }
    }

    /// Dependency directories in search order: the program's, the service's,
    /// then every dependency directory an alias points into.
    pub fn resolution_roots(&self, program_directory: &Path) -> Vec<PathBuf> {
        let mut roots = vec![program_modules(program_directory), self.service_modules.clone()];
        for target in self.inputs.aliases.values() {
            if let Some(root) = dependency_root(Path::new(target)) {
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        roots
    }

    pub fn build_config(
        &self,
        target: Target,
        request: &BuildRequest,
        overrides: Option<Value>,
    ) -> BuildConfig {
        let minimize = self.production && target == Target::Client;
        BuildConfig {
            mode: if minimize {
                Mode::Production
            } else {
                Mode::Development
            },
            target,
            bail: true,
            devtool: (!self.production).then(|| SOURCE_MAP_DEVTOOL.to_string()),
            minimize,
            split_chunks: target == Target::Client,
            entry: request.entry.clone(),
            output: OutputConfig {
                path: BUNDLE_ROOT.to_string(),
                filename: "bundle.js".to_string(),
                chunk_filename: "[name].chunk.js".to_string(),
                public_path: request.public_path.clone(),
            },
            resolve: ResolveConfig {
                modules: self.resolution_roots(&request.program_directory()),
                alias: self.inputs.aliases.clone(),
            },
            externals: request.externals.clone(),
            overrides,
            cache: request.cache.clone(),
        }
    }

    pub async fn run(&self, target: Target, request: BuildRequest) -> Result<BuildOutput> {
        let program_directory = request.program_directory();
        let overrides = read_overrides(&program_directory).await?;
        let config = self.build_config(target, &request, overrides);

        let mut pipeline = ResolutionPipeline::standard(PipelineOptions {
            target,
            helpers: self.inputs.helpers.clone(),
            hypothetical_files: self.inputs.hypothetical_files.clone(),
            aliases: self.inputs.aliases.clone(),
            resolution_roots: config.resolve.modules.clone(),
            rpc: Rc::clone(&self.inputs.rpc),
        });

        tracing::debug!(
            entry = %request.entry.display(),
            target = target.as_str(),
            incremental = config.cache.is_some(),
            "Starting build"
        );
        let mut output = self.engine.run(config, &mut pipeline).await?;

        if let Some(error) = select_error(&output.errors) {
            return Err(Error::Compile(error));
        }
        for warning in &output.warnings {
            tracing::warn!("{}", format_message(warning));
        }

        let bundle = collect_bundle(&output)?;
        if target == Target::Server {
            entry_chunk(&bundle)?;
        }

        let mut dependencies = self.source_dependencies(&output);
        dependencies.extend(auxiliary_files(&program_directory, self.mode_name()).await);

        Ok(BuildOutput {
            bundle,
            cache: output.cache.take(),
            excluded: pipeline.excluded_dependencies(),
            dependencies,
        })
    }

    fn source_dependencies(&self, output: &CompilerOutput) -> Vec<PathBuf> {
        let mut dependencies: Vec<PathBuf> = Vec::new();
        for module in &output.modules {
            let synthetic = module.starts_with(HELPER_ROOT)
                || module.starts_with(RESOURCE_ROOT)
                || self.is_hypothetical(module);
            if synthetic || module.contains(&format!("/{}/", DEPENDENCY_DIR)) {
                continue;
            }
            let path = PathBuf::from(module);
            if !dependencies.contains(&path) {
                dependencies.push(path);
            }
        }
        dependencies
    }

    fn is_hypothetical(&self, module: &str) -> bool {
        self.inputs
            .hypothetical_files
            .keys()
            .any(|key| module == key || module.strip_prefix('/') == Some(key.as_str()))
    }

    fn mode_name(&self) -> &'static str {
        if self.production {
            "production"
        } else {
            "development"
        }
    }
}

/// The first dependency directory on `path`, matched by whole component.
fn dependency_root(path: &Path) -> Option<PathBuf> {
    let mut root = PathBuf::new();
    for component in path.components() {
        root.push(component);
        if component.as_os_str() == DEPENDENCY_DIR {
            return Some(root);
        }
    }
    None
}

fn program_modules(program_directory: &Path) -> PathBuf {
    if program_directory.ends_with(DEPENDENCY_DIR) {
        program_directory.to_path_buf()
    } else {
        program_directory.join(DEPENDENCY_DIR)
    }
}

async fn read_overrides(program_directory: &Path) -> Result<Option<Value>> {
    let path = program_directory.join(OVERRIDE_FILE);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(None);
    }
    let source = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| Error::io(&path, e))?;
    serde_json::from_str(&source)
        .map(Some)
        .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))
}

/// Configuration files read by the compiler that a caller should watch.
async fn auxiliary_files(program_directory: &Path, mode: &str) -> Vec<PathBuf> {
    let candidates = [
        OVERRIDE_FILE.to_string(),
        ".babelrc".to_string(),
        ".browserslistrc".to_string(),
        ".env".to_string(),
        format!(".env.{}", mode),
    ];

    let mut found = Vec::new();
    for name in candidates {
        let path = program_directory.join(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            found.push(path);
        }
    }
    found
}

/// Non-entry chunks first, each group by descending id.
fn ordered_chunks(chunks: &[CompiledChunk]) -> Vec<&CompiledChunk> {
    let mut ordered: Vec<&CompiledChunk> = chunks.iter().collect();
    ordered.sort_by(|a, b| a.entry.cmp(&b.entry).then(b.id.cmp(&a.id)));
    ordered
}

fn collect_bundle(output: &CompilerOutput) -> Result<Bundle> {
    let asset = |filename: &str| {
        output
            .assets
            .get(filename)
            .cloned()
            .ok_or_else(|| Error::Engine(format!("Compiler did not emit {}", filename)))
    };

    let mut bundle = Bundle::new();
    for (order, chunk) in ordered_chunks(&output.chunks).into_iter().enumerate() {
        if chunk.names.first().map_or(true, String::is_empty) {
            continue;
        }

        let map = chunk
            .files
            .iter()
            .find(|file| file.ends_with(".map"))
            .map(|file| asset(file))
            .transpose()?;

        for file in chunk.files.iter().filter(|file| !file.ends_with(".map")) {
            bundle.insert(
                file.clone(),
                BundleEntry {
                    code: asset(file)?,
                    map: map.clone(),
                    initial: chunk.initial,
                    order,
                },
            );
        }
    }
    Ok(bundle)
}
