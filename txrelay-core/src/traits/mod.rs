pub use chain::*;
pub use encode::*;
pub use signer::*;

mod chain;
mod encode;
mod signer;
