use std::sync::Arc;

use thiserror::Error;

/// An error that happens when loading a bitmap into the cache.
///
/// All requests waiting on the same load receive a clone of the same error. Errors are never
/// cached, the next request for the key will start a fresh load.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The loader returned an error.
    #[error("failed to load bitmap: {0:#}")]
    Failed(Arc<anyhow::Error>),
    /// The load was aborted before it produced a result.
    ///
    /// This happens when the loader panics or the runtime drops the load task.
    #[error("bitmap load was cancelled")]
    Cancelled,
}

impl LoadError {
    pub(crate) fn failed(error: anyhow::Error) -> Self {
        Self::Failed(Arc::new(error))
    }
}

impl From<futures::channel::oneshot::Canceled> for LoadError {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        Self::Cancelled
    }
}
