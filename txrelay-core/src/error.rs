use std::fmt::Debug;

use crate::{StatusSet, Transition, TxHash};

/// The result of interacting with a chain.
pub type ChainResult<T> = Result<T, ChainCommunicationError>;

/// Errors raised while encoding or decoding stored relay data.
#[derive(Debug, thiserror::Error)]
pub enum RelayProtocolError {
    /// IO error from a reader or writer
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// A JSON record could not be (de)serialized
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Fixed width value had the wrong number of bytes
    #[error("Expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// expected byte count
        expected: usize,
        /// received byte count
        actual: usize,
    },
}

/// Errors raised when talking to a chain node or signing for one.
#[derive(Debug, thiserror::Error)]
pub enum ChainCommunicationError {
    /// The node could not be reached or answered with garbage
    #[error("Transport error: {0}")]
    Transport(String),
    /// The node understood the request and refused the transaction
    #[error("Transaction rejected by node: {0}")]
    Rejected(String),
    /// The raw bytes are not a transaction this chain understands
    #[error("Invalid transaction encoding: {0}")]
    InvalidEncoding(String),
    /// Failed to produce a new signature
    #[error("Signer error: {0}")]
    Signer(String),
    /// No signer is configured but one was needed
    #[error("No signer available to re-sign {0:?}")]
    SignerUnavailable(TxHash),
    /// A custom error
    #[error("{0}")]
    CustomError(String),
}

impl ChainCommunicationError {
    /// Whether trying the same call again could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainCommunicationError::Transport(_))
    }

    /// Create a transport error from any error type.
    pub fn from_transport_err<E: Debug>(err: E) -> Self {
        Self::Transport(format!("{err:?}"))
    }

    /// Create a custom error from a string.
    pub fn from_other_str(err: &str) -> Self {
        Self::CustomError(err.to_owned())
    }
}

/// A status transition was attempted from a state that does not permit it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot apply {transition:?} to status {from:?}")]
pub struct InvalidTransition {
    /// flags held when the transition was attempted
    pub from: StatusSet,
    /// the rejected transition
    pub transition: Transition,
}

/// A stored flag set that no sequence of transitions can produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Status {0:?} is both final and obsolete")]
pub struct InvalidStatus(pub StatusSet);
