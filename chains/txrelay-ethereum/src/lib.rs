//! Ethereum support for the relay: a JSON-RPC backed [`ChainInterface`]
//! and a local key [`TransactionSigner`].
//!
//! [`ChainInterface`]: txrelay_core::ChainInterface
//! [`TransactionSigner`]: txrelay_core::TransactionSigner

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use codec::*;
pub use provider::*;
pub use signer::*;

mod codec;
mod provider;
mod signer;
