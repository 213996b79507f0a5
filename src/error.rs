use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

/// Every failure a backup, restore or tar-upload task can end with.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Missing or conflicting configuration, detected before any process starts.
    #[error("config error: {0}")]
    Config(String),

    /// Environment or instance is not fit for the requested task.
    #[error("precheck failed: {0}")]
    Precheck(String),

    /// An external tool exited nonzero. `message` carries the grepped log context.
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// Metadata files missing, part sequence broken, size mismatch.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Report endpoint or remote channel hiccup.
    #[error("transient error: {0}")]
    Transient(String),

    #[error("cleanup error: {0}")]
    Cleanup(String),

    #[error("backup timeout exceed")]
    Timeout,

    #[error("task cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("mysql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ini error: {0}")]
    Ini(#[from] ini::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tool not found: {0}")]
    Which(#[from] which::Error),
}

impl BackupError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        BackupError::Config(msg.into())
    }

    pub fn precheck<S: Into<String>>(msg: S) -> Self {
        BackupError::Precheck(msg.into())
    }

    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        BackupError::Integrity(msg.into())
    }

    pub fn tool<T: Into<String>, M: Into<String>>(tool: T, message: M) -> Self {
        BackupError::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        assert_eq!(BackupError::Timeout.to_string(), "backup timeout exceed");
    }

    #[test]
    fn test_tool_message() {
        let err = BackupError::tool("mydumper", "exit status: 2\nERROR: access denied");
        assert!(err.to_string().starts_with("mydumper failed: exit status: 2"));
        assert_eq!(BackupError::Transient("502".to_string()).to_string(), "transient error: 502");
    }
}
