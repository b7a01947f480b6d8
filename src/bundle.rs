//! Build artifacts exchanged between build sessions, the cache and the sandbox.

use std::collections::BTreeMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which environment a build targets. Cache blobs never cross targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    #[serde(rename = "async-node")]
    Server,
    #[serde(rename = "web")]
    Client,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Server => "async-node",
            Target::Client => "web",
        }
    }
}

/// One emitted chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub code: String,
    pub map: Option<String>,
    pub initial: bool,
    pub order: usize,
}

/// Emitted filename to chunk, kept in chunk order.
pub type Bundle = IndexMap<String, BundleEntry>;

/// Specifier to absolute path of dependencies left out of a server bundle.
pub type ExcludedDependencies = BTreeMap<String, PathBuf>;

/// Opaque, compiler-owned incremental build state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheBlob(pub serde_json::Value);

/// Returns the single chunk marked `initial`.
pub fn entry_chunk(bundle: &Bundle) -> Result<(&str, &BundleEntry)> {
    let mut initials = bundle.iter().filter(|(_, entry)| entry.initial);
    match (initials.next(), initials.next()) {
        (Some((name, entry)), None) => Ok((name.as_str(), entry)),
        _ => Err(Error::InvalidBundle(
            bundle.values().filter(|entry| entry.initial).count(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(initial: bool, order: usize) -> BundleEntry {
        BundleEntry {
            code: String::new(),
            map: None,
            initial,
            order,
        }
    }

    #[test]
    fn test_single_initial_chunk() {
        let mut bundle = Bundle::new();
        bundle.insert("1.chunk.js".into(), chunk(false, 0));
        bundle.insert("bundle.js".into(), chunk(true, 1));

        let (name, entry) = entry_chunk(&bundle).unwrap();
        assert_eq!(name, "bundle.js");
        assert_eq!(entry.order, 1);
    }

    #[test]
    fn test_rejects_missing_or_duplicate_initial() {
        let mut bundle = Bundle::new();
        bundle.insert("1.chunk.js".into(), chunk(false, 0));
        assert!(matches!(entry_chunk(&bundle), Err(Error::InvalidBundle(0))));

        bundle.insert("a.js".into(), chunk(true, 1));
        bundle.insert("b.js".into(), chunk(true, 2));
        assert!(matches!(entry_chunk(&bundle), Err(Error::InvalidBundle(2))));
    }

    #[test]
    fn test_target_tags() {
        assert_eq!(serde_json::to_string(&Target::Server).unwrap(), "\"async-node\"");
        assert_eq!(Target::Client.as_str(), "web");
    }
}
