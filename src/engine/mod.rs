//! The pluggable build engine.
//!
//! The compiler is a black box behind [`BuildEngine`]: it receives a
//! [`BuildConfig`], asks the attached [`BuildHooks`] about every import it
//! cannot resolve on its own, accepts synthesized files through [`VirtualFs`],
//! and finally yields a [`CompilerOutput`].

mod process;

pub use process::ProcessEngine;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bundle::{CacheBlob, Target};
use crate::error::Result;

/// Output directory inside the engine's in-memory filesystem.
pub const BUNDLE_ROOT: &str = "/__bundled";

/// An import the compiler is about to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequest {
    pub specifier: String,
    /// Directory or file the request was issued from.
    pub path: String,
}

impl ModuleRequest {
    pub fn new(specifier: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            path: path.into(),
        }
    }
}

/// What the compiler should do with an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Redirect {
    /// Continue normal resolution with this filename instead.
    Module(String),
    /// Do not bundle; emit a runtime `require` of this specifier.
    External(String),
}

/// The engine's virtual-file injection point.
pub trait VirtualFs {
    fn write_module(&mut self, filename: &str, content: &str);
}

/// A file written through [`VirtualFs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualWrite {
    pub filename: String,
    pub content: String,
}

impl VirtualFs for Vec<VirtualWrite> {
    fn write_module(&mut self, filename: &str, content: &str) {
        self.push(VirtualWrite {
            filename: filename.to_string(),
            content: content.to_string(),
        });
    }
}

/// The engine's module-resolution interception point.
#[async_trait(?Send)]
pub trait BuildHooks {
    /// `Ok(None)` lets the compiler resolve the request itself.
    async fn resolve(
        &mut self,
        request: &ModuleRequest,
        fs: &mut dyn VirtualFs,
    ) -> Result<Option<Redirect>>;

    /// Called once the compilation finished, before output is returned.
    async fn done(&mut self) -> Result<()>;
}

#[async_trait(?Send)]
pub trait BuildEngine {
    /// Runs one compilation. Hook failures abort the build and are returned
    /// as the build's error.
    async fn run(&self, config: BuildConfig, hooks: &mut dyn BuildHooks) -> Result<CompilerOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Production,
    Development,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    pub path: String,
    pub filename: String,
    pub chunk_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveConfig {
    /// Dependency directories in search order.
    pub modules: Vec<PathBuf>,
    pub alias: IndexMap<String, String>,
}

/// Everything one compilation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub mode: Mode,
    pub target: Target,
    /// Halt on the first hard error.
    pub bail: bool,
    pub devtool: Option<String>,
    pub minimize: bool,
    pub split_chunks: bool,
    pub entry: PathBuf,
    pub output: OutputConfig,
    pub resolve: ResolveConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub externals: Option<serde_json::Value>,
    /// Declarations from the program's override file, merged by the compiler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<serde_json::Value>,
    #[serde(default)]
    pub cache: Option<CacheBlob>,
}

/// One chunk as reported by the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledChunk {
    pub id: u64,
    #[serde(default)]
    pub names: Vec<String>,
    pub entry: bool,
    pub initial: bool,
    pub files: Vec<String>,
}

/// Result of one compilation. Non-empty `errors` means it failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOutput {
    pub chunks: Vec<CompiledChunk>,
    /// Emitted filename to source.
    pub assets: HashMap<String, String>,
    /// Resources of every module that took part in the build.
    pub modules: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub cache: Option<CacheBlob>,
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engine standing in for a real compiler.

    use std::cell::{Cell, RefCell};

    use super::*;

    /// Replays a fixed list of import requests through the hooks and then
    /// returns a prepared output, numbering cache blobs per run.
    #[derive(Default)]
    pub struct FakeEngine {
        pub requests: Vec<ModuleRequest>,
        pub output: CompilerOutput,
        pub configs: RefCell<Vec<BuildConfig>>,
        pub writes: RefCell<Vec<VirtualWrite>>,
        pub redirects: RefCell<Vec<Option<Redirect>>>,
        pub runs: Cell<usize>,
    }

    impl FakeEngine {
        pub fn with_output(output: CompilerOutput) -> Self {
            Self {
                output,
                ..Default::default()
            }
        }

        /// One initial chunk `bundle.js` with a source map.
        pub fn single_chunk(code: &str) -> Self {
            let mut assets = HashMap::new();
            assets.insert("bundle.js".to_string(), code.to_string());
            assets.insert("bundle.js.map".to_string(), "{\"version\":3}".to_string());
            Self::with_output(CompilerOutput {
                chunks: vec![CompiledChunk {
                    id: 0,
                    names: vec!["main".into()],
                    entry: true,
                    initial: true,
                    files: vec!["bundle.js".into(), "bundle.js.map".into()],
                }],
                assets,
                ..Default::default()
            })
        }
    }

    #[async_trait(?Send)]
    impl BuildEngine for FakeEngine {
        async fn run(
            &self,
            config: BuildConfig,
            hooks: &mut dyn BuildHooks,
        ) -> Result<CompilerOutput> {
            self.configs.borrow_mut().push(config);
            let run = self.runs.get() + 1;
            self.runs.set(run);

            for request in &self.requests {
                let mut fs = Vec::new();
                let redirect = hooks.resolve(request, &mut fs).await?;
                self.writes.borrow_mut().extend(fs);
                self.redirects.borrow_mut().push(redirect);
            }
            hooks.done().await?;

            let mut output = self.output.clone();
            output.cache = Some(CacheBlob(serde_json::json!({ "run": run })));
            Ok(output)
        }
    }
}
