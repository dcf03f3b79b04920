//! User-facing error taxonomy for dashboard actions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DashboardError {
    /// No model configured, missing model files, malformed metadata.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unsupported URL, failed download, unreadable video.
    #[error("{0}")]
    Input(String),

    #[error("access denied")]
    Unauthorized,

    /// Duplicate usernames, removing the last admin, unknown users.
    #[error("{0}")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DashboardError>;

impl From<serde_json::Error> for DashboardError {
    fn from(e: serde_json::Error) -> Self {
        DashboardError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for DashboardError {
    fn from(e: serde_yaml::Error) -> Self {
        DashboardError::Serialization(e.to_string())
    }
}
