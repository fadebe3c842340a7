//! Core types and traits for the transaction relay.
//!
//! This crate knows nothing about storage, sockets or specific chains. It
//! defines the queue record and its status machine, sync cursors, the chain
//! and signer abstractions the relay talks through, and the fee escalation
//! rule used when resubmitting stuck transactions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use error::*;
pub use fee::*;
pub use traits::*;
pub use types::*;

mod error;
mod fee;
mod traits;
mod types;
