//! In-memory ledger for dry runs.
//!
//! Every transaction is mined immediately. Contract addresses are derived from the
//! sender and nonce the way the EVM derives them, so a simulated run produces the
//! same registry a real run from a fresh account would.

use std::sync::{Arc, Mutex, MutexGuard};

use alloy_core::primitives::{Address, B256, Bytes, keccak256};

use crate::{ChainClient, ClientError, TxReceipt, TxRequest};

type RevertRule = Arc<dyn Fn(&TxRequest) -> Option<String> + Send + Sync>;
type ReadRule = Arc<dyn Fn(Address, &Bytes) -> Option<Bytes> + Send + Sync>;

#[derive(Default)]
struct LedgerState {
    nonce: u64,
    sent: Vec<TxRequest>,
    receipts: Vec<TxReceipt>,
    transport_failures: usize,
}

/// A [`ChainClient`] that keeps all state in memory.
#[derive(Clone)]
pub struct SimulatedLedger {
    sender: Address,
    state: Arc<Mutex<LedgerState>>,
    revert_rule: Option<RevertRule>,
    read_rule: Option<ReadRule>,
}

impl std::fmt::Debug for SimulatedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedLedger")
            .field("sender", &self.sender)
            .field("transactions", &self.sent().len())
            .finish()
    }
}

impl SimulatedLedger {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            state: Arc::default(),
            revert_rule: None,
            read_rule: None,
        }
    }

    /// Mine transactions matched by `rule` as reverted, with the returned reason.
    pub fn with_revert_rule(
        mut self,
        rule: impl Fn(&TxRequest) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.revert_rule = Some(Arc::new(rule));
        self
    }

    /// Answer read calls with `rule`; unanswered reads return an empty result.
    pub fn with_read_rule(
        mut self,
        rule: impl Fn(Address, &Bytes) -> Option<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.read_rule = Some(Arc::new(rule));
        self
    }

    /// Fail the next `count` broadcasts with a transport error.
    pub fn fail_next_broadcasts(&self, count: usize) {
        self.lock().transport_failures = count;
    }

    /// Every transaction broadcast so far, in order.
    pub fn sent(&self) -> Vec<TxRequest> {
        self.lock().sent.clone()
    }

    pub fn receipts(&self) -> Vec<TxReceipt> {
        self.lock().receipts.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A poisoned lock only means another test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChainClient for SimulatedLedger {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<B256, ClientError> {
        let mut state = self.lock();
        if state.transport_failures > 0 {
            state.transport_failures -= 1;
            return Err(ClientError::Transport("simulated connection reset".to_string()));
        }

        let nonce = state.nonce;
        state.nonce += 1;

        let mut preimage = self.sender.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        let tx_hash = keccak256(&preimage);

        let revert = self.revert_rule.as_ref().and_then(|rule| rule(tx));
        let contract_address = match (tx.to, &revert) {
            (None, None) => Some(self.sender.create(nonce)),
            _ => None,
        };

        state.sent.push(tx.clone());
        state.receipts.push(TxReceipt {
            tx_hash,
            block_number: nonce + 1,
            success: revert.is_none(),
            contract_address,
            gas_used: 21_000 + tx.input.len() as u64 * 16,
        });

        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ClientError> {
        Ok(self
            .lock()
            .receipts
            .iter()
            .find(|r| r.tx_hash == tx_hash)
            .cloned())
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, ClientError> {
        Ok(self
            .read_rule
            .as_ref()
            .and_then(|rule| rule(to, &input))
            .unwrap_or_default())
    }
}
