/// toykv errors. All except Internal and IO are part of the transaction
/// protocol and are expected during normal operation; clients react to them
/// (resolve the lock, retry with a new timestamp, or accept the commit).
/// Cloneable so that errors peeked from shared iterators can be propagated.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A rollback attempt found the transaction already committed at the
    /// given commit timestamp. The client must treat the txn as committed.
    AlreadyCommitted { commit_ts: u64 },
    /// An internal error: invalid key encodings, record marshaling failures,
    /// and other store corruption. Propagated without recovery.
    Internal(String),
    /// An input/output error from the backing store.
    IO(String),
    /// The key is locked by an in-flight transaction. Recoverable by
    /// resolving the lock, e.g. via cleanup or resolve_lock.
    Locked { key: Vec<u8>, primary: Vec<u8>, version: u64, ttl: u64 },
    /// The operation lost a conflict (e.g. a write conflict, or a commit of
    /// an unknown transaction) and may be retried with a new timestamp.
    Retryable(String),
}

/// toykv result type.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::AlreadyCommitted { commit_ts } => {
                write!(f, "transaction already committed at timestamp {}", commit_ts)
            }
            Error::Internal(message) | Error::IO(message) => write!(f, "{}", message),
            Error::Locked { key, version, .. } => {
                write!(f, "key {:x?} is locked by transaction {}", key, version)
            }
            Error::Retryable(message) => write!(f, "retryable error: {}", message),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}
