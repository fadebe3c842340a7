use std::fmt::Debug;

use async_trait::async_trait;

use crate::{Address, ChainResult, DecodedTransaction, U256};

/// Produces new signatures for transactions the relay resubmits.
#[async_trait]
pub trait TransactionSigner: Send + Sync + Debug {
    /// The account this signer signs for
    fn address(&self) -> Address;

    /// Re-sign `tx` unchanged except for its fee, returning the raw bytes.
    async fn sign_with_fee(&self, tx: &DecodedTransaction, fee: U256) -> ChainResult<Vec<u8>>;
}
