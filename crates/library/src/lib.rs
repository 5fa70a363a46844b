pub mod db;
pub mod index;
pub mod migrations;
pub mod playlist;
pub mod playlist_io;
pub mod scan;
pub mod search;
pub mod store;

pub use db::{SaveBatch, SearchHit, TrackDb};
pub use migrations::{Migration, Migrator};
pub use playlist::Playlist;
pub use scan::{ScanChange, ScanProgress, ScanStatus, ScanSummary, Scanner};
pub use search::{Query, QueryError, QueryErrorKind, QueryOptions};
pub use store::{LibraryRecord, SnapshotStore, DB_VERSION};

use std::path::PathBuf;

use common::track::TrackError;
use common::uri::UriError;
use redb::{CommitError, DatabaseError, StorageError, TableError, TransactionError};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("db error: {0}")]
    Redb(#[from] redb::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("database {path:?} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("database version {0} is newer than this build supports ({DB_VERSION})")]
    VersionTooNew(u32),
    #[error("no migration from database version {0}")]
    NoMigration(u32),
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Track(#[from] TrackError),
    #[error("playlist {path:?}: {reason}")]
    Playlist { path: PathBuf, reason: String },
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}
