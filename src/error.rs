//! Error taxonomy shared by the pipeline, build sessions and the sandbox.

use std::path::PathBuf;

/// Errors surfaced by the engine.
///
/// Configuration, compile and render errors are fatal to the single command
/// that produced them; nothing here poisons the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A helper was used in a way its configuration cannot satisfy.
    #[error("Cannot generate sub helper module {sub_path} for {helper}: {reason}")]
    HelperNotFound {
        helper: String,
        sub_path: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// First formatted compile error of a failed build.
    #[error("{0}")]
    Compile(String),

    /// The build engine itself failed (transport, crash, protocol).
    #[error("Build engine failure: {0}")]
    Engine(String),

    /// A bundle did not carry exactly one `initial` chunk.
    #[error("Invalid bundle: expected exactly one initial chunk, found {0}")]
    InvalidBundle(usize),

    #[error("Cannot find module '{0}'")]
    ModuleNotFound(String),

    /// The render entry point threw, rejected or never settled.
    #[error("{0}")]
    Render(String),

    /// A render unit operation was attempted outside the `Ready` state.
    #[error("Render unit is {0}, expected ready")]
    InvalidState(&'static str),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("RPC transport failure: {0}")]
    Rpc(String),

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
