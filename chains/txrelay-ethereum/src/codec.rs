use ethers::types::{transaction::eip2718::TypedTransaction, Signature};
use ethers::utils::{keccak256, rlp::Rlp};

use txrelay_core::{ChainCommunicationError, ChainResult, DecodedTransaction, H256};

/// Parse a signed, RLP encoded (optionally EIP-2718 typed) transaction and
/// recover its sender.
pub fn decode_signed_transaction(raw: &[u8]) -> ChainResult<(TypedTransaction, Signature)> {
    TypedTransaction::decode_signed(&Rlp::new(raw))
        .map_err(|err| ChainCommunicationError::InvalidEncoding(err.to_string()))
}

/// Extract the fields the relay queues a transaction by.
pub fn decode_raw_transaction(raw: &[u8]) -> ChainResult<DecodedTransaction> {
    let (tx, signature) = decode_signed_transaction(raw)?;
    let sender = signature
        .recover(tx.sighash())
        .map_err(|err| ChainCommunicationError::InvalidEncoding(err.to_string()))?;
    let nonce = tx
        .nonce()
        .ok_or_else(|| ChainCommunicationError::InvalidEncoding("missing nonce".to_owned()))?;
    if nonce.bits() > 64 {
        return Err(ChainCommunicationError::InvalidEncoding(format!(
            "nonce {nonce} out of range"
        )));
    }
    Ok(DecodedTransaction::new(
        H256(keccak256(raw)),
        sender,
        tx.to().and_then(|to| to.as_address()).copied(),
        nonce.as_u64(),
        tx.gas_price().unwrap_or_default(),
        raw.to_vec(),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Eip1559TransactionRequest, TransactionRequest, U256};
    use txrelay_core::H160;

    use super::*;

    // anvil's first development key
    pub(crate) const TEST_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    pub(crate) fn wallet() -> LocalWallet {
        TEST_KEY.parse::<LocalWallet>().unwrap().with_chain_id(31337u64)
    }

    pub(crate) fn signed(tx: TypedTransaction) -> Vec<u8> {
        let wallet = wallet();
        let signature = wallet.sign_transaction_sync(&tx).unwrap();
        tx.rlp_signed(&signature).to_vec()
    }

    pub(crate) fn legacy(nonce: u64, gas_price: u64) -> TypedTransaction {
        TransactionRequest::new()
            .to(H160::repeat_byte(0x42))
            .value(1u64)
            .gas(21_000u64)
            .gas_price(gas_price)
            .nonce(nonce)
            .chain_id(31337u64)
            .into()
    }

    #[test]
    fn decodes_legacy_transaction() {
        let raw = signed(legacy(7, 1_000));
        let decoded = decode_raw_transaction(&raw).unwrap();
        assert_eq!(decoded.sender, wallet().address());
        assert_eq!(decoded.recipient, Some(H160::repeat_byte(0x42)));
        assert_eq!(decoded.nonce, 7);
        assert_eq!(decoded.fee, U256::from(1_000u64));
        assert_eq!(decoded.hash, H256(keccak256(&raw)));
    }

    #[test]
    fn decodes_typed_transaction() {
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(H160::repeat_byte(0x42))
            .gas(21_000u64)
            .max_fee_per_gas(500u64)
            .max_priority_fee_per_gas(2u64)
            .nonce(3u64)
            .chain_id(31337u64)
            .into();
        let decoded = decode_raw_transaction(&signed(tx)).unwrap();
        assert_eq!(decoded.nonce, 3);
        assert_eq!(decoded.fee, U256::from(500u64));
        assert_eq!(decoded.sender, wallet().address());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_raw_transaction(&[0xde, 0xad, 0xbe, 0xef]),
            Err(ChainCommunicationError::InvalidEncoding(_))
        ));
    }
}
