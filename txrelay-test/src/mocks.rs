//! mockall doubles for expectation style tests: [`MockChainApi`] and
//! [`MockTxSigner`].

use async_trait::async_trait;
use mockall::mock;

use txrelay_core::{
    Address, Block, ChainInterface, ChainResult, DecodedTransaction, Receipt, TransactionSigner,
    TxHash, U256,
};

mock! {
    pub ChainApi {}

    #[async_trait]
    impl ChainInterface for ChainApi {
        fn decode_transaction(&self, raw: &[u8]) -> ChainResult<DecodedTransaction>;
        async fn latest_block_number(&self) -> ChainResult<u64>;
        async fn block_by_number(&self, height: u64) -> ChainResult<Option<Block>>;
        async fn transaction_receipt(&self, hash: TxHash) -> ChainResult<Option<Receipt>>;
        async fn send_raw_transaction(&self, raw: &[u8]) -> ChainResult<TxHash>;
        async fn gas_price(&self) -> ChainResult<U256>;
    }
}

mock! {
    pub TxSigner {}

    #[async_trait]
    impl TransactionSigner for TxSigner {
        fn address(&self) -> Address;
        async fn sign_with_fee(&self, tx: &DecodedTransaction, fee: U256) -> ChainResult<Vec<u8>>;
    }
}

impl std::fmt::Debug for MockChainApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockChainApi")
    }
}

impl std::fmt::Debug for MockTxSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockTxSigner")
    }
}
