use std::path::PathBuf;

use redb::{CommitError, DatabaseError, StorageError, TableError, TransactionError};

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Redb(redb::Error),
    Xml(quick_xml::Error),
    Config(serde_yaml::Error),
    /// Persisted data could not be decoded; the repository is unusable
    /// until the backing file is repaired or removed.
    StorageCorrupt { path: PathBuf, reason: String },
    InvalidArgument(String),
    InvalidPlaylist(String),
    NotInitialized(&'static str),
    Canceled,
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Xml(err) => write!(f, "xml error: {}", err),
            LibraryError::Config(err) => write!(f, "config error: {}", err),
            LibraryError::StorageCorrupt { path, reason } => {
                write!(f, "storage corrupt at {:?}: {}", path, reason)
            }
            LibraryError::InvalidArgument(value) => write!(f, "invalid argument: {}", value),
            LibraryError::InvalidPlaylist(value) => write!(f, "invalid playlist: {}", value),
            LibraryError::NotInitialized(what) => write!(f, "not initialized: {}", what),
            LibraryError::Canceled => write!(f, "operation canceled"),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
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

impl From<quick_xml::Error> for LibraryError {
    fn from(err: quick_xml::Error) -> Self {
        LibraryError::Xml(err)
    }
}

impl From<serde_yaml::Error> for LibraryError {
    fn from(err: serde_yaml::Error) -> Self {
        LibraryError::Config(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_decode_failures_surface_as_storage_corrupt() {
        let err = LibraryError::StorageCorrupt {
            path: PathBuf::from("/data/tracks.redb"),
            reason: "record t1: unexpected end of file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "storage corrupt at \"/data/tracks.redb\": record t1: unexpected end of file"
        );
        let io: LibraryError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(io, LibraryError::Io(_)));
    }
}
