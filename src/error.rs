//! Error types for the cluster store, registry and channels.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::cluster::ClusterId;

pub type StoreResult<T> = Result<T, StoreError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
pub type ChannelResult<T> = Result<T, ChannelError>;
pub type StartupResult<T> = Result<T, StartupError>;

/// Errors raised while loading or saving the persisted document.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The file exists but could not be parsed or migrated. The caller must
    /// not treat this as an empty store.
    #[error("corrupt document {}: {reason}", path.display())]
    CorruptDocument { path: PathBuf, reason: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cannot watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A single migration step rejected its input.
#[derive(Debug, Error)]
#[error("migration {version} ({name}) failed: {reason}")]
pub struct MigrationError {
    pub version: u32,
    pub name: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cluster {0} already exists")]
    DuplicateIdentifier(ClusterId),

    #[error("unknown cluster {0}")]
    UnknownCluster(ClusterId),

    #[error("invalid cluster record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("a handler is already registered on {0}")]
    HandlerAlreadyRegistered(String),

    #[error("no handler registered on {0}")]
    NoHandler(String),

    #[error("handler on {channel} failed: {message}")]
    Handler { channel: String, message: String },

    #[error("request on {0} timed out")]
    Timeout(String),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("coordinator detached")]
    Detached,

    #[error("transport error on {channel}: {message}")]
    Transport { channel: String, message: String },
}

/// Why a coordinator or presentation process could not start.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no data directory: set {} or provide a platform config dir", crate::config::DATA_DIR_ENV)]
    NoDataDir,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
