use txrelay_base::db::{DbError, QueueError};
use txrelay_core::{ChainCommunicationError, TxHash};

/// Errors surfaced by the relay daemon's components.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A client request could not be understood
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// The transaction is already queued
    #[error("Transaction {0:?} is already queued")]
    Duplicate(TxHash),
    /// The node refused a submission
    #[error("Submission failed: {0}")]
    Submission(#[source] ChainCommunicationError),
    /// Queue storage is inconsistent
    #[error("Queue storage integrity: {0}")]
    BackendIntegrity(#[source] QueueError),
    /// The listening socket vanished or was replaced
    #[error("Socket state: {0}")]
    SocketState(String),
    /// Talking to the node failed
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
    /// Storage failure
    #[error(transparent)]
    Db(#[from] DbError),
    /// Queue operation failed
    #[error(transparent)]
    Queue(QueueError),
    /// Socket IO failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<QueueError> for RelayError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Duplicate(hash) => RelayError::Duplicate(hash),
            err if err.is_integrity() => RelayError::BackendIntegrity(err),
            QueueError::Db(err) => RelayError::Db(err),
            err => RelayError::Queue(err),
        }
    }
}

impl RelayError {
    /// The component that hit this error cannot keep running
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::BackendIntegrity(_) | RelayError::SocketState(_) | RelayError::Db(_)
        )
    }

    /// Label used for the `transactions_rejected` metric
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::InvalidInput(_) => "invalid_input",
            RelayError::Duplicate(_) => "duplicate",
            RelayError::Submission(_) => "submission",
            RelayError::BackendIntegrity(_) => "integrity",
            RelayError::SocketState(_) => "socket",
            RelayError::Chain(_) => "chain",
            RelayError::Db(_) | RelayError::Queue(_) => "storage",
            RelayError::Io(_) => "io",
        }
    }
}
