use std::collections::HashSet;
use std::path::PathBuf;

use oxc_resolver::{ResolveOptions, Resolver};

use super::Resolution;
use crate::bundle::ExcludedDependencies;
use crate::engine::ModuleRequest;

/// Resolution rules for dependencies loaded natively at render time.
pub(crate) fn node_resolve_options() -> ResolveOptions {
    ResolveOptions {
        condition_names: vec!["node".into(), "require".into(), "default".into()],
        extensions: vec![".js".into(), ".cjs".into(), ".json".into()],
        main_fields: vec!["main".into()],
        ..Default::default()
    }
}

/// Leaves installed dependencies out of server bundles.
///
/// A bare specifier that is neither an alias, a hypothetical file nor a
/// helper namespace is looked up in the resolution roots. When found, it is
/// recorded with its absolute path and reported as external.
pub struct ExcludedDependencyProvider {
    roots: Vec<PathBuf>,
    aliases: Vec<String>,
    hypothetical: HashSet<String>,
    helpers: Vec<String>,
    resolver: Resolver,
    excluded: ExcludedDependencies,
}

impl ExcludedDependencyProvider {
    pub fn new(
        roots: Vec<PathBuf>,
        aliases: Vec<String>,
        hypothetical: HashSet<String>,
        helpers: Vec<String>,
    ) -> Self {
        Self {
            roots,
            aliases,
            hypothetical,
            helpers,
            resolver: Resolver::new(node_resolve_options()),
            excluded: ExcludedDependencies::new(),
        }
    }

    pub fn excluded(&self) -> &ExcludedDependencies {
        &self.excluded
    }

    pub fn handle(&mut self, request: &ModuleRequest) -> Option<Resolution> {
        let specifier = request.specifier.as_str();
        if !self.is_candidate(specifier) {
            return None;
        }

        // Each root is a dependency directory; resolving from inside it
        // finds packages installed directly below it first.
        let path = self
            .roots
            .iter()
            .find_map(|root| self.resolver.resolve(root, specifier).ok())?
            .full_path();

        tracing::debug!(specifier, path = %path.display(), "Excluding dependency from bundle");
        self.excluded.insert(specifier.to_string(), path);
        Some(Resolution::External(specifier.to_string()))
    }

    fn is_candidate(&self, specifier: &str) -> bool {
        if specifier.is_empty()
            || specifier.starts_with('.')
            || specifier.starts_with('/')
            || specifier.contains('!')
            || specifier.contains("://")
            || self.hypothetical.contains(specifier)
        {
            return false;
        }

        let under = |name: &String| {
            specifier == name
                || specifier
                    .strip_prefix(name.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        };
        !self.aliases.iter().any(under) && !self.helpers.iter().any(under)
    }
}
