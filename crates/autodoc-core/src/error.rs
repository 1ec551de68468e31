//! Error types for Autodoc

use thiserror::Error;

/// Main error type for Autodoc operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Router auth token could not be obtained (fatal to peer construction)
    #[error("Auth error: {0}")]
    Auth(String),

    /// Router connection could not be established (fatal to peer construction)
    #[error("Router connection error: {0}")]
    RouterConnect(String),

    /// Router connection failed after it was established
    #[error("Router error: {0}")]
    Router(String),

    /// Document id is malformed or not openable by this identity
    #[error("Invalid document id: {0}")]
    InvalidDocumentId(String),

    /// Identity string is malformed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Counterpart public key is not discoverable
    #[error("Could not resolve public key for {identity}: {reason}")]
    KeyResolution {
        /// Identity whose key was requested
        identity: String,
        /// Why resolution failed
        reason: String,
    },

    /// Stored ciphertext is unreadable with the derived key
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Error from a storage adapter
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a document that has been closed
    #[error("Document closed: {0}")]
    DocumentClosed(String),

    /// Operation on a peer after `shutdown`
    #[error("Peer shut down: {0}")]
    PeerShutDown(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Only transient storage, I/O and router failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(_)
                | SyncError::StorageOp(_)
                | SyncError::Transaction(_)
                | SyncError::Commit(_)
                | SyncError::Io(_)
                | SyncError::Router(_)
        )
    }
}

impl From<automerge::AutomergeError> for SyncError {
    fn from(e: automerge::AutomergeError) -> Self {
        SyncError::Automerge(e.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
