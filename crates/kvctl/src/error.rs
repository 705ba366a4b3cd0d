//! Controller error taxonomy
//!
//! Every fallible operation in the crate returns [`Error`]. The API layer only
//! looks at [`Error::kind`] to pick a status code.

use crate::config::ConfigError;
use crate::metadata::SlotRange;
use crate::node_client::ProbeError;
use crate::store::StoreError;

/// Controller error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),
    #[error("invalid migration: {0}")]
    InvalidMigration(String),
    #[error("slots {range} are not owned by shard {shard}")]
    SlotNotOwned { shard: usize, range: SlotRange },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse error classes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    Conflict,
    StoreTimeout,
    StoreUnavailable,
    ProbeFailure,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSpec(_)
            | Error::InvalidMigration(_)
            | Error::SlotNotOwned { .. }
            | Error::InvalidArgument(_)
            | Error::Config(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Probe(_) => ErrorKind::ProbeFailure,
            Error::Store(StoreError::Timeout(_)) => ErrorKind::StoreTimeout,
            Error::Store(StoreError::Unavailable(_)) => ErrorKind::StoreUnavailable,
            Error::Store(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreTimeout | ErrorKind::StoreUnavailable | ErrorKind::Conflict
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
