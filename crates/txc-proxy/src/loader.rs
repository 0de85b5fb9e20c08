use std::path::PathBuf;
use std::sync::Arc;

use txc_connector::{Api, resolve_library_path};
use txc_core::Result;

/// Source of connector export tables for proxy sessions.
pub trait ConnectorLoader: Send + Sync {
    fn load(&self) -> Result<Arc<Api>>;
}

/// Loads the real library from disk.
#[derive(Debug, Clone)]
pub struct DylibLoader {
    path: PathBuf,
}

impl DylibLoader {
    /// `path` is the library file or the directory holding it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConnectorLoader for DylibLoader {
    fn load(&self) -> Result<Arc<Api>> {
        Api::load(&resolve_library_path(&self.path)?)
    }
}

/// Serves an already loaded table, e.g. the in-process mock.
impl<F> ConnectorLoader for F
where
    F: Fn() -> Arc<Api> + Send + Sync,
{
    fn load(&self) -> Result<Arc<Api>> {
        Ok(self())
    }
}
