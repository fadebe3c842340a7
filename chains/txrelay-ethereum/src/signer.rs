use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use tracing::debug;

use txrelay_core::{
    Address, ChainCommunicationError, ChainResult, DecodedTransaction, TransactionSigner, U256,
};

use crate::decode_signed_transaction;

/// Re-signs transactions with a locally held secp256k1 key.
#[derive(Debug, Clone)]
pub struct EthereumSigner {
    wallet: LocalWallet,
    chain_id: u64,
}

impl EthereumSigner {
    /// Build from a hex encoded private key, with or without `0x`.
    pub fn new(key: &str, chain_id: u64) -> ChainResult<Self> {
        let wallet = key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|err| ChainCommunicationError::Signer(format!("invalid signer key: {err}")))?
            .with_chain_id(chain_id);
        Ok(Self { wallet, chain_id })
    }
}

/// Set the fee of `tx` to `fee`. For EIP-1559 transactions `fee` is the max
/// fee and the tip grows by the same ratio, at least by one.
fn set_fee(tx: &mut TypedTransaction, fee: U256) {
    match tx {
        TypedTransaction::Eip1559(inner) => {
            let old_max = inner.max_fee_per_gas.unwrap_or_default();
            if let Some(tip) = inner.max_priority_fee_per_gas {
                let scaled = if old_max.is_zero() {
                    tip
                } else {
                    tip.saturating_mul(fee) / old_max
                };
                let bumped = if scaled > tip {
                    scaled
                } else {
                    tip.saturating_add(U256::one())
                };
                inner.max_priority_fee_per_gas = Some(bumped.min(fee));
            }
            inner.max_fee_per_gas = Some(fee);
        }
        _ => {
            tx.set_gas_price(fee);
        }
    }
}

#[async_trait]
impl TransactionSigner for EthereumSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_with_fee(&self, tx: &DecodedTransaction, fee: U256) -> ChainResult<Vec<u8>> {
        let (mut unsigned, signature) = decode_signed_transaction(&tx.raw)?;
        let sender = signature
            .recover(unsigned.sighash())
            .map_err(|err| ChainCommunicationError::InvalidEncoding(err.to_string()))?;
        if sender != self.wallet.address() {
            return Err(ChainCommunicationError::Signer(format!(
                "transaction is from {sender:?}, signer holds {:?}",
                self.wallet.address()
            )));
        }
        set_fee(&mut unsigned, fee);
        if unsigned.chain_id().is_none() {
            unsigned.set_chain_id(self.chain_id);
        }
        let signature = self
            .wallet
            .sign_transaction_sync(&unsigned)
            .map_err(|err| ChainCommunicationError::Signer(err.to_string()))?;
        debug!(hash = ?tx.hash, %fee, "Re-signed transaction");
        Ok(unsigned.rlp_signed(&signature).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Eip1559TransactionRequest;
    use txrelay_core::H160;

    use super::*;
    use crate::codec::tests::{legacy, signed, TEST_KEY};
    use crate::decode_raw_transaction;

    fn signer() -> EthereumSigner {
        EthereumSigner::new(&format!("0x{TEST_KEY}"), 31337).unwrap()
    }

    #[tokio::test]
    async fn resigned_legacy_keeps_everything_but_the_fee() {
        let original = decode_raw_transaction(&signed(legacy(5, 100))).unwrap();
        let raw = signer()
            .sign_with_fee(&original, U256::from(110u64))
            .await
            .unwrap();
        let resigned = decode_raw_transaction(&raw).unwrap();
        assert_eq!(resigned.sender, original.sender);
        assert_eq!(resigned.nonce, 5);
        assert_eq!(resigned.recipient, original.recipient);
        assert_eq!(resigned.fee, U256::from(110u64));
        assert_ne!(resigned.hash, original.hash);
    }

    #[tokio::test]
    async fn typed_transaction_tip_is_bumped() {
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(H160::repeat_byte(0x42))
            .gas(21_000u64)
            .max_fee_per_gas(100u64)
            .max_priority_fee_per_gas(10u64)
            .nonce(1u64)
            .chain_id(31337u64)
            .into();
        let original = decode_raw_transaction(&signed(tx)).unwrap();
        let raw = signer()
            .sign_with_fee(&original, U256::from(150u64))
            .await
            .unwrap();
        let (resigned, _) = decode_signed_transaction(&raw).unwrap();
        let TypedTransaction::Eip1559(inner) = resigned else {
            panic!("expected an EIP-1559 transaction");
        };
        assert_eq!(inner.max_fee_per_gas, Some(U256::from(150u64)));
        assert_eq!(inner.max_priority_fee_per_gas, Some(U256::from(15u64)));
    }

    #[tokio::test]
    async fn refuses_foreign_transactions() {
        let original = decode_raw_transaction(&signed(legacy(0, 1))).unwrap();
        let other = EthereumSigner::new(
            "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
            31337,
        )
        .unwrap();
        assert!(matches!(
            other.sign_with_fee(&original, U256::from(2u64)).await,
            Err(ChainCommunicationError::Signer(_))
        ));
    }

    #[test]
    fn rejects_bad_key() {
        assert!(EthereumSigner::new("zz", 1).is_err());
    }
}
