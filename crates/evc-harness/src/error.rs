//! Harness error type.

use evc_control::EvcError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid scenario graph: {0}")]
    Graph(String),
    #[error("harness setup: {0}")]
    Setup(String),
    #[error(transparent)]
    Controller(#[from] EvcError),
}

impl HarnessError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
