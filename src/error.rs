use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("failed to access config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no .gguf files found in directory: {0}")]
    CatalogEmpty(PathBuf),

    #[error("failed to scan model directory {path}: {source}")]
    CatalogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model index {index} (catalog has {len} models)")]
    InvalidIndex { index: i64, len: usize },

    #[error("failed to start model '{model}': {source}")]
    LoadFailed {
        model: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port left above base port {0}")]
    PortsExhausted(u16),

    #[error("failed to set up health probe client: {0}")]
    ProbeClient(#[from] reqwest::Error),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl SupervisorError {
    /// Errors the control API reports as a client mistake (400) rather than a server failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SupervisorError::InvalidIndex { .. })
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
