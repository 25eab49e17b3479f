//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Only the variants that cross component
//! boundaries live here; per-item queue decode failures are logged and
//! skipped where they happen.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the controller.
#[derive(Error, Debug)]
pub enum Error {
    /// On-disk queue could not be opened or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The adapter connection could not be opened.
    #[error("connection error: {0}")]
    Connection(String),

    /// A power command failed even after a reconnect and retry.
    #[error("{command} to address {address} failed after reconnecting")]
    CommandFailed { command: &'static str, address: u8 },

    /// Every reopen attempt failed; the connection is in the `Failed` state.
    #[error("failed to open CEC connection after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// No self-restarts left for this lineage.
    #[error("restart budget exhausted")]
    RestartBudgetExhausted,

    /// The process image could not be replaced.
    #[error("restart failed: {0}")]
    RestartFailed(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file parse errors.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn restart_failed(msg: impl Into<String>) -> Self {
        Self::RestartFailed(msg.into())
    }
}
