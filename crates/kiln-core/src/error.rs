//! Errors of the engine API.

use crate::cache::CacheError;
use crate::settings::RootKind;
use std::path::PathBuf;

/// Errors returned by [`Engine`](crate::Engine).
///
/// Problems inside rule files, cache entries or individual jobs are not
/// errors at this level; they are logged and the offending entry is skipped.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} path {} does not exist or is not a directory", .path.display())]
    InvalidPath { kind: RootKind, path: PathBuf },

    #[error("{0} path is not set")]
    MissingPath(RootKind),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
