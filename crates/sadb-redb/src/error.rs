//! Adapter error type.

use sadb_core::StoreError;
use thiserror::Error;

/// Failure inside the redb adapter.
///
/// Converted into [`StoreError::Backend`] at the store boundary so redb and
/// ciborium types never reach engine callers.
#[derive(Debug, Error)]
pub enum RedbStoreError {
    /// redb reported an error.
    #[error("database error: {0}")]
    Database(#[from] redb::Error),

    /// A record could not be encoded.
    #[error("failed to encode record: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    /// A stored record could not be decoded.
    #[error("failed to decode record: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

impl RedbStoreError {
    /// Whether retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(redb::Error::Io(_) | redb::Error::DatabaseAlreadyOpen))
    }
}

impl From<RedbStoreError> for StoreError {
    fn from(err: RedbStoreError) -> Self {
        let context = match &err {
            RedbStoreError::Database(_) => "redb",
            RedbStoreError::Encode(_) => "encode record",
            RedbStoreError::Decode(_) => "decode record",
        };
        if err.is_transient() {
            StoreError::transient(context, err)
        } else {
            StoreError::backend(context, err)
        }
    }
}

/// Map any redb error into a [`StoreError`].
pub(crate) fn db(err: impl Into<redb::Error>) -> StoreError {
    RedbStoreError::Database(err.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_failures_are_transient() {
        let err: StoreError = RedbStoreError::Database(redb::Error::Io(std::io::Error::other("disk"))).into();
        assert!(err.is_transient());

        let err: StoreError = db(redb::Error::Corrupted("bad page".to_owned()));
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("redb: database error"));
    }
}
