use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use txrelay_core::{
    keccak256, Address, Block, BlockTransaction, ChainCommunicationError, ChainInterface,
    ChainResult, DecodedTransaction, Receipt, TransactionSigner, TxHash, H160, H256, U256,
};

/// The wire format understood by [`MockChain`]: JSON, hashed with keccak256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeTransaction {
    pub sender: Address,
    pub recipient: Option<Address>,
    pub nonce: u64,
    pub fee: U256,
    /// distinguishes otherwise identical transactions
    pub memo: String,
}

impl FakeTransaction {
    pub fn new(sender: Address, nonce: u64, fee: u64) -> Self {
        Self {
            sender,
            recipient: Some(H160::repeat_byte(0xee)),
            nonce,
            fee: fee.into(),
            memo: String::new(),
        }
    }

    pub fn with_memo(mut self, memo: &str) -> Self {
        self.memo = memo.to_owned();
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    pub fn hash(&self) -> TxHash {
        keccak256(self.encode())
    }

    pub fn decode(raw: &[u8]) -> ChainResult<Self> {
        serde_json::from_slice(raw)
            .map_err(|err| ChainCommunicationError::InvalidEncoding(err.to_string()))
    }

    pub fn decoded(&self) -> DecodedTransaction {
        let raw = self.encode();
        DecodedTransaction::new(keccak256(&raw), self.sender, self.recipient, self.nonce, self.fee, raw)
    }
}

#[derive(Debug, Default)]
struct ChainState {
    blocks: Vec<Block>,
    receipts: HashMap<TxHash, Receipt>,
    mempool: Vec<DecodedTransaction>,
    submissions: Vec<TxHash>,
    mined_nonces: HashSet<(Address, u64)>,
    rejected_senders: HashMap<Address, String>,
    rejected_hashes: HashMap<TxHash, String>,
    reverting: HashSet<TxHash>,
    failing_block_fetches: HashSet<u64>,
    send_transport_failures: usize,
    gas_price: U256,
}

/// An in-memory chain with a mempool, scripted rejections and manual block
/// production. Block 0 exists and is empty.
#[derive(Debug)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        let state = ChainState {
            blocks: vec![Block {
                number: 0,
                hash: H256::zero(),
                transactions: vec![],
            }],
            gas_price: 1u64.into(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set_gas_price(&self, price: u64) {
        self.state.lock().gas_price = price.into();
    }

    /// Every submission the node refuses for `sender`
    pub fn reject_sender(&self, sender: Address, reason: &str) {
        self.state
            .lock()
            .rejected_senders
            .insert(sender, reason.to_owned());
    }

    pub fn reject_hash(&self, hash: TxHash, reason: &str) {
        self.state
            .lock()
            .rejected_hashes
            .insert(hash, reason.to_owned());
    }

    pub fn clear_rejections(&self) {
        let mut state = self.state.lock();
        state.rejected_senders.clear();
        state.rejected_hashes.clear();
    }

    /// Mine `hash` with a failed receipt
    pub fn revert(&self, hash: TxHash) {
        self.state.lock().reverting.insert(hash);
    }

    /// The next fetch of `height` fails with a transport error
    pub fn fail_block_fetch_once(&self, height: u64) {
        self.state.lock().failing_block_fetches.insert(height);
    }

    /// The next `count` submissions fail with a transport error
    pub fn fail_sends(&self, count: usize) {
        self.state.lock().send_transport_failures = count;
    }

    /// Hashes accepted by `send_raw_transaction`, in order
    pub fn submissions(&self) -> Vec<TxHash> {
        self.state.lock().submissions.clone()
    }

    pub fn mempool(&self) -> Vec<TxHash> {
        self.state.lock().mempool.iter().map(|tx| tx.hash).collect()
    }

    /// Put raw bytes in the mempool without going through submission checks
    pub fn include_raw(&self, raw: Vec<u8>) {
        if let Ok(tx) = decode(&raw) {
            self.state.lock().mempool.push(tx);
        }
    }

    /// Produce a block from the mempool and return its height.
    ///
    /// For each (sender, nonce) only the highest fee is mined, entries for
    /// nonces already mined are dropped.
    pub fn mine_block(&self) -> u64 {
        let mut state = self.state.lock();
        let number = state.blocks.len() as u64;
        let mut pool = std::mem::take(&mut state.mempool);
        pool.sort_by(|a, b| b.fee.cmp(&a.fee));

        let mut transactions = vec![];
        for tx in pool {
            if !state.mined_nonces.insert((tx.sender, tx.nonce)) {
                continue;
            }
            let index = transactions.len() as u32;
            let success = !state.reverting.contains(&tx.hash);
            state.receipts.insert(
                tx.hash,
                Receipt {
                    hash: tx.hash,
                    block_number: number,
                    index,
                    success,
                },
            );
            transactions.push(BlockTransaction {
                hash: tx.hash,
                index,
                sender: tx.sender,
            });
        }
        state.blocks.push(Block {
            number,
            hash: H256::from_low_u64_be(number + 1),
            transactions,
        });
        number
    }
}

fn decode(raw: &[u8]) -> ChainResult<DecodedTransaction> {
    let tx = FakeTransaction::decode(raw)?;
    Ok(DecodedTransaction::new(
        keccak256(raw),
        tx.sender,
        tx.recipient,
        tx.nonce,
        tx.fee,
        raw.to_vec(),
    ))
}

#[async_trait]
impl ChainInterface for MockChain {
    fn decode_transaction(&self, raw: &[u8]) -> ChainResult<DecodedTransaction> {
        decode(raw)
    }

    async fn latest_block_number(&self) -> ChainResult<u64> {
        Ok(self.state.lock().blocks.len() as u64 - 1)
    }

    async fn block_by_number(&self, height: u64) -> ChainResult<Option<Block>> {
        let mut state = self.state.lock();
        if state.failing_block_fetches.remove(&height) {
            return Err(ChainCommunicationError::Transport(format!(
                "connection reset fetching block {height}"
            )));
        }
        Ok(state.blocks.get(height as usize).cloned())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> ChainResult<Option<Receipt>> {
        Ok(self.state.lock().receipts.get(&hash).copied())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> ChainResult<TxHash> {
        let tx = decode(raw)?;
        let mut state = self.state.lock();
        if state.send_transport_failures > 0 {
            state.send_transport_failures -= 1;
            return Err(ChainCommunicationError::Transport("node unreachable".to_owned()));
        }
        if let Some(reason) = state
            .rejected_hashes
            .get(&tx.hash)
            .or_else(|| state.rejected_senders.get(&tx.sender))
        {
            return Err(ChainCommunicationError::Rejected(reason.clone()));
        }
        if state.mined_nonces.contains(&(tx.sender, tx.nonce)) {
            return Err(ChainCommunicationError::Rejected("nonce too low".to_owned()));
        }
        if state.mempool.iter().any(|pending| pending.hash == tx.hash) {
            return Err(ChainCommunicationError::Rejected("already known".to_owned()));
        }
        let hash = tx.hash;
        state.submissions.push(hash);
        state.mempool.push(tx);
        Ok(hash)
    }

    async fn gas_price(&self) -> ChainResult<U256> {
        Ok(self.state.lock().gas_price)
    }
}

/// Re-signs [`FakeTransaction`]s for one address.
#[derive(Debug)]
pub struct MockSigner {
    address: Address,
    fail: Mutex<bool>,
}

impl MockSigner {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            fail: Mutex::new(false),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl TransactionSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_with_fee(&self, tx: &DecodedTransaction, fee: U256) -> ChainResult<Vec<u8>> {
        if *self.fail.lock() {
            return Err(ChainCommunicationError::Signer("hardware wallet unplugged".to_owned()));
        }
        let mut fake = FakeTransaction::decode(&tx.raw)?;
        if fake.sender != self.address {
            return Err(ChainCommunicationError::Signer(format!(
                "cannot sign for {:?}",
                fake.sender
            )));
        }
        fake.fee = fee;
        Ok(fake.encode())
    }
}
