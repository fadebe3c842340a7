//! Test doubles for the relay: an in-memory chain, a signer that works with
//! it, and `mockall` mocks for failure injection.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

pub use mock_chain::*;
pub use mocks::*;

mod mock_chain;
mod mocks;
