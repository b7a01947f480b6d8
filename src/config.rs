//! Service-wide configuration.

use std::path::PathBuf;
use std::time::Duration;

/// How long session state survives outside production.
pub const DEVELOPMENT_SESSION_TTL: Duration = Duration::from_secs(600);

/// How long a started client bundle preparation may wait to be joined.
pub const PREPARATION_TTL: Duration = Duration::from_secs(60);

/// Configuration for the V8 sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
        }
    }
}

/// Configuration for the whole service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Production serves one long-lived build per process: nothing is cached
    /// and browser bundles are minified.
    pub production: bool,
    /// Dependency directory of the service itself, searched after the
    /// program's own dependency directory.
    pub service_modules: PathBuf,
    pub preparation_ttl: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            production: false,
            service_modules: PathBuf::from("node_modules"),
            preparation_ttl: PREPARATION_TTL,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// TTL of compiler caches and render units. Zero means never cached.
    pub fn session_ttl(&self) -> Duration {
        if self.production {
            Duration::ZERO
        } else {
            DEVELOPMENT_SESSION_TTL
        }
    }

    pub fn mode_name(&self) -> &'static str {
        if self.production {
            "production"
        } else {
            "development"
        }
    }
}
