//! The relay daemon: admits signed transactions over a unix socket, submits
//! them under per-sender limits, replaces stuck ones with higher fees and
//! finalizes them from synced blocks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod dispatcher;
mod error;
pub mod protocol;
mod relay;
mod retrier;
mod session;
mod source;
mod state_filter;

pub use client::*;
pub use dispatcher::{Dispatcher, InFlightCounter};
pub use error::RelayError;
pub use relay::Relayd;
pub use retrier::Retrier;
pub use session::*;
pub use source::*;
pub use state_filter::StateFilter;
