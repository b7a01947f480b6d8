//! Module resolution for code running inside a render unit.
//!
//! Bundle chunks resolve in three steps: excluded dependency (loaded from
//! disk), chunk of the unit's bundle, otherwise not found. Modules loaded
//! from disk resolve their own requires Node-style against their directory.
//! Only `.js`, `.cjs` and `.json` files are ever read from disk.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use oxc_resolver::Resolver;
use serde::{Deserialize, Serialize};
use sugar_path::SugarPath;

use crate::bundle::{Bundle, ExcludedDependencies};
use crate::error::{Error, Result};
use crate::resolve::node_resolve_options;

/// A resolved `require` target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "camelCase")]
pub enum ResolvedModule {
    /// Chunk of the unit's bundle, by emitted filename.
    Chunk(String),
    /// CommonJS file on disk.
    Native(PathBuf),
    /// JSON file on disk.
    Json(PathBuf),
}

impl ResolvedModule {
    fn from_path(path: PathBuf) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Self::Json(path)),
            Some("js") | Some("cjs") => Ok(Self::Native(path)),
            _ => Err(Error::ModuleNotFound(format!(
                "{} (only .js, .cjs and .json files can be loaded)",
                path.display()
            ))),
        }
    }

    /// Key of the module in the unit's module cache.
    pub fn cache_key(&self) -> String {
        match self {
            Self::Chunk(name) => format!("chunk:{}", name),
            Self::Native(path) | Self::Json(path) => format!("file:{}", path.display()),
        }
    }
}

pub struct BundleLoader {
    bundle: Rc<Bundle>,
    excluded: Rc<ExcludedDependencies>,
    resolver: Resolver,
}

impl BundleLoader {
    pub fn new(bundle: Rc<Bundle>, excluded: Rc<ExcludedDependencies>) -> Self {
        Self {
            bundle,
            excluded,
            resolver: Resolver::new(node_resolve_options()),
        }
    }

    /// Resolves `specifier` as required by a bundle chunk (`referrer` is
    /// `None`) or by the module file at `referrer`.
    pub fn resolve(&self, specifier: &str, referrer: Option<&Path>) -> Result<ResolvedModule> {
        match referrer {
            None => self.resolve_from_bundle(specifier),
            Some(referrer) => self.resolve_from_file(specifier, referrer),
        }
    }

    fn resolve_from_bundle(&self, specifier: &str) -> Result<ResolvedModule> {
        if let Some(path) = self.excluded.get(specifier) {
            return ResolvedModule::from_path(path.clone());
        }

        let name = chunk_name(specifier);
        if self.bundle.contains_key(&name) {
            return Ok(ResolvedModule::Chunk(name));
        }

        Err(Error::ModuleNotFound(specifier.to_string()))
    }

    fn resolve_from_file(&self, specifier: &str, referrer: &Path) -> Result<ResolvedModule> {
        let directory = referrer.parent().unwrap_or_else(|| Path::new("/"));
        let resolution = self
            .resolver
            .resolve(directory, specifier)
            .map_err(|_| Error::ModuleNotFound(specifier.to_string()))?;
        ResolvedModule::from_path(resolution.full_path())
    }

    /// Source text of a resolved module.
    pub fn load(&self, module: &ResolvedModule) -> Result<String> {
        match module {
            ResolvedModule::Chunk(name) => self
                .bundle
                .get(name)
                .map(|entry| entry.code.clone())
                .ok_or_else(|| Error::ModuleNotFound(name.clone())),
            ResolvedModule::Native(path) | ResolvedModule::Json(path) => {
                std::fs::read_to_string(path).map_err(|e| Error::io(path, e))
            }
        }
    }
}

/// Script name a unit's chunk is evaluated under. Units never share one, so a
/// chunk's source map is looked up for the right unit.
pub fn chunk_source_url(unit: &str, chunk: &str) -> String {
    let raw = format!("ssr://{}/{}", unit, chunk);
    // Scripts are named by the parsed URL, so maps must be keyed the same way.
    url::Url::parse(&raw).map(String::from).unwrap_or(raw)
}

/// Script name of a module file evaluated from disk.
pub fn file_source_url(path: &Path) -> String {
    url::Url::from_file_path(path)
        .map(String::from)
        .unwrap_or_else(|()| path.display().to_string())
}

/// Bundle key for a chunk request: `./1.chunk.js` and `1.chunk.js` name the
/// same chunk.
fn chunk_name(specifier: &str) -> String {
    let normalized = Path::new(specifier).normalize();
    normalized
        .to_string_lossy()
        .trim_start_matches("./")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleEntry;
    use std::fs;
    use tempfile::tempdir;

    fn bundle(names: &[&str]) -> Rc<Bundle> {
        Rc::new(
            names
                .iter()
                .enumerate()
                .map(|(order, name)| {
                    (
                        name.to_string(),
                        BundleEntry {
                            code: format!("module.exports = {:?};", name),
                            map: None,
                            initial: order == names.len() - 1,
                            order,
                        },
                    )
                })
                .collect(),
        )
    }

    fn loader(names: &[&str], excluded: ExcludedDependencies) -> BundleLoader {
        BundleLoader::new(bundle(names), Rc::new(excluded))
    }

    #[test]
    fn test_chunks_resolve_by_normalized_name() {
        let loader = loader(&["1.chunk.js", "bundle.js"], ExcludedDependencies::new());

        for specifier in ["1.chunk.js", "./1.chunk.js"] {
            assert_eq!(
                loader.resolve(specifier, None).unwrap(),
                ResolvedModule::Chunk("1.chunk.js".into())
            );
        }
        assert_eq!(
            loader
                .load(&ResolvedModule::Chunk("1.chunk.js".into()))
                .unwrap(),
            "module.exports = \"1.chunk.js\";"
        );
    }

    #[test]
    fn test_excluded_dependency_wins_over_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("react.js");
        fs::write(&path, "module.exports = 'react';").unwrap();

        let mut excluded = ExcludedDependencies::new();
        excluded.insert("react".into(), path.clone());
        let loader = loader(&["react", "bundle.js"], excluded);

        let resolved = loader.resolve("react", None).unwrap();
        assert_eq!(resolved, ResolvedModule::Native(path));
        assert_eq!(loader.load(&resolved).unwrap(), "module.exports = 'react';");
    }

    #[test]
    fn test_unknown_module_is_not_found() {
        let loader = loader(&["bundle.js"], ExcludedDependencies::new());
        let err = loader.resolve("left-pad", None).unwrap_err();
        assert!(matches!(err, Error::ModuleNotFound(ref name) if name == "left-pad"));
        assert_eq!(err.to_string(), "Cannot find module 'left-pad'");
    }

    #[test]
    fn test_native_modules_resolve_relative_and_installed() {
        let dir = tempdir().unwrap();
        let package = dir.path().join("node_modules/dep");
        fs::create_dir_all(package.join("lib")).unwrap();
        fs::write(package.join("package.json"), r#"{"main":"lib/index.js"}"#).unwrap();
        fs::write(package.join("lib/index.js"), "require('./util');").unwrap();
        fs::write(package.join("lib/util.js"), "").unwrap();
        fs::write(package.join("lib/data.json"), "{\"a\":1}").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/other")).unwrap();
        fs::write(dir.path().join("node_modules/other/index.js"), "").unwrap();

        let loader = loader(&["bundle.js"], ExcludedDependencies::new());
        let referrer = package.join("lib/index.js");

        let util = loader.resolve("./util", Some(&referrer)).unwrap();
        assert!(matches!(util, ResolvedModule::Native(ref p) if p.ends_with("lib/util.js")));

        let data = loader.resolve("./data.json", Some(&referrer)).unwrap();
        assert!(matches!(data, ResolvedModule::Json(_)));
        assert_eq!(loader.load(&data).unwrap(), "{\"a\":1}");

        let other = loader.resolve("other", Some(&referrer)).unwrap();
        assert!(matches!(other, ResolvedModule::Native(ref p) if p.ends_with("other/index.js")));

        assert!(loader.resolve("./missing", Some(&referrer)).is_err());
    }

    #[test]
    fn test_only_script_and_json_files_load_from_disk() {
        let dir = tempdir().unwrap();
        let addon = dir.path().join("addon.node");
        fs::write(&addon, "").unwrap();

        let mut excluded = ExcludedDependencies::new();
        excluded.insert("addon".into(), addon);
        let loader = loader(&["bundle.js"], excluded);

        assert!(matches!(
            loader.resolve("addon", None),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_source_urls() {
        assert_eq!(chunk_source_url("u1", "bundle.js"), "ssr://u1/bundle.js");
        assert_eq!(chunk_source_url("u1", "a b.js"), "ssr://u1/a%20b.js");
        assert_eq!(
            file_source_url(Path::new("/app/node_modules/dep/index.js")),
            "file:///app/node_modules/dep/index.js"
        );
    }

    #[test]
    fn test_cache_keys_do_not_collide() {
        let chunk = ResolvedModule::Chunk("index.js".into());
        let file = ResolvedModule::Native(PathBuf::from("index.js"));
        assert_ne!(chunk.cache_key(), file.cache_key());
    }
}
