//! Scoped source maps for error stack translation.
//!
//! Several render units may execute chunks with the same filename, each with
//! its own map. A map is registered only while its chunk is being evaluated
//! or rendered, and the most recent registration for a filename wins.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use deno_core::anyhow::{anyhow, Error};
use deno_core::{
    ModuleLoadResponse, ModuleLoader, ModuleSpecifier, RequestedModuleType, ResolutionKind,
};

#[derive(Default)]
struct Registry {
    maps: RefCell<HashMap<String, Vec<(u64, Rc<[u8]>)>>>,
    next_token: Cell<u64>,
}

#[derive(Clone, Default)]
pub struct SourceMapRegistry {
    inner: Rc<Registry>,
}

impl SourceMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `map` the active map for `name` until the guard is dropped.
    pub fn register(&self, name: &str, map: Rc<[u8]>) -> SourceMapGuard {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        self.inner
            .maps
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push((token, map));
        SourceMapGuard {
            registry: Rc::clone(&self.inner),
            name: name.to_string(),
            token,
        }
    }

    pub fn active(&self, name: &str) -> Option<Rc<[u8]>> {
        self.inner
            .maps
            .borrow()
            .get(name)
            .and_then(|stack| stack.last())
            .map(|(_, map)| Rc::clone(map))
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.inner.maps.borrow().is_empty()
    }
}

#[must_use]
pub struct SourceMapGuard {
    registry: Rc<Registry>,
    name: String,
    token: u64,
}

impl Drop for SourceMapGuard {
    fn drop(&mut self) {
        let mut maps = self.registry.maps.borrow_mut();
        if let Some(stack) = maps.get_mut(&self.name) {
            stack.retain(|(token, _)| *token != self.token);
            if stack.is_empty() {
                maps.remove(&self.name);
            }
        }
    }
}

/// Module loader of the sandbox runtime.
///
/// Sandboxed code is classic scripts wired together by `require`, so ES
/// module imports are refused. The runtime asks the loader for the map of a
/// script whenever it formats a stack frame.
pub struct SourceMapLoader {
    registry: SourceMapRegistry,
}

impl SourceMapLoader {
    pub fn new(registry: SourceMapRegistry) -> Self {
        Self { registry }
    }
}

impl ModuleLoader for SourceMapLoader {
    fn resolve(
        &self,
        specifier: &str,
        _referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        Err(anyhow!(
            "Module imports are not available in the sandbox: {}",
            specifier
        ))
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        ModuleLoadResponse::Sync(Err(anyhow!(
            "Module imports are not available in the sandbox: {}",
            module_specifier
        )))
    }

    fn get_source_map(&self, file_name: &str) -> Option<Vec<u8>> {
        self.registry.active(file_name).map(|map| map.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(source: &str) -> Rc<[u8]> {
        Rc::from(source.as_bytes())
    }

    #[test]
    fn test_latest_registration_wins_until_dropped() {
        let registry = SourceMapRegistry::new();
        let outer = registry.register("bundle.js", map("outer"));
        let inner = registry.register("bundle.js", map("inner"));

        assert_eq!(&*registry.active("bundle.js").unwrap(), b"inner");
        drop(inner);
        assert_eq!(&*registry.active("bundle.js").unwrap(), b"outer");
        drop(outer);
        assert!(registry.active("bundle.js").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_out_of_order_release() {
        let registry = SourceMapRegistry::new();
        let first = registry.register("a.js", map("first"));
        let second = registry.register("a.js", map("second"));

        drop(first);
        assert_eq!(&*registry.active("a.js").unwrap(), b"second");
        drop(second);
        assert!(registry.active("a.js").is_none());
    }

    #[test]
    fn test_loader_serves_active_maps() {
        let registry = SourceMapRegistry::new();
        let loader = SourceMapLoader::new(registry.clone());
        let guard = registry.register("ssr://unit/bundle.js", map("{}"));

        assert_eq!(loader.get_source_map("ssr://unit/bundle.js").unwrap(), b"{}");
        assert!(loader.get_source_map("ssr://other/bundle.js").is_none());
        drop(guard);
        assert!(loader.get_source_map("ssr://unit/bundle.js").is_none());
    }

    #[test]
    fn test_loader_refuses_imports() {
        let loader = SourceMapLoader::new(SourceMapRegistry::new());
        let err = loader
            .resolve("./chunk.js", "ssr://unit/bundle.js", ResolutionKind::Import)
            .unwrap_err();
        assert!(err.to_string().contains("./chunk.js"));
    }
}
