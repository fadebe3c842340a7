use chrono::{DateTime, Utc};
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::{serialize::hex_bytes, Address, InvalidTransition, Transition, TxHash, TxStatus, U256};

/// What the chain interface can tell about a raw signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct DecodedTransaction {
    /// content hash of `raw`
    pub hash: TxHash,
    /// recovered signer
    pub sender: Address,
    /// `None` for contract creation
    pub recipient: Option<Address>,
    /// sender scoped sequence number
    pub nonce: u64,
    /// fee level the transaction pays (gas price or max fee)
    pub fee: U256,
    /// signed wire bytes
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
}

/// Where a transaction was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct Confirmation {
    /// block height
    pub block_number: u64,
    /// position inside the block
    pub tx_index: u32,
}

/// A transaction held by the relay queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTransaction {
    /// unique key
    pub hash: TxHash,
    /// signer of the transaction
    pub sender: Address,
    /// destination, if any
    pub recipient: Option<Address>,
    /// immutable for a given hash
    pub nonce: u64,
    /// fee level paid
    pub fee: U256,
    /// signed wire bytes, immutable
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
    /// status flags
    pub status: TxStatus,
    /// admission time
    pub created_at: DateTime<Utc>,
    /// last dispatch attempt, successful or not
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// set once the syncer saw this hash in a block
    pub confirmation: Option<Confirmation>,
    /// the replacement that took over this nonce
    pub superseded_by: Option<TxHash>,
    /// the stale entry this one replaces
    pub replaces: Option<TxHash>,
}

impl QueuedTransaction {
    /// A freshly admitted entry.
    pub fn new(decoded: DecodedTransaction, now: DateTime<Utc>) -> Self {
        let DecodedTransaction {
            hash,
            sender,
            recipient,
            nonce,
            fee,
            raw,
        } = decoded;
        Self {
            hash,
            sender,
            recipient,
            nonce,
            fee,
            raw,
            status: TxStatus::queued(),
            created_at: now,
            last_attempt_at: None,
            confirmation: None,
            superseded_by: None,
            replaces: None,
        }
    }

    /// A replacement for `stale` signed with a higher fee.
    pub fn replacement(stale: &QueuedTransaction, decoded: DecodedTransaction, now: DateTime<Utc>) -> Self {
        let mut tx = Self::new(decoded, now);
        tx.replaces = Some(stale.hash);
        tx
    }

    /// The moment age thresholds are measured from.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_attempt_at.unwrap_or(self.created_at)
    }

    /// Apply a transition to the status, leaving `self` unchanged on error.
    pub fn transition(&mut self, transition: Transition) -> Result<(), InvalidTransition> {
        self.status = self.status.apply(transition)?;
        Ok(())
    }
}
