//! Ledger boundary: signing, submitting, and observing transactions on one chain.

use std::{future::Future, time::Duration};

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_core::primitives::{Address, B256, Bytes, TxKind, U64, U128, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    ChainEndpoint, ClientError,
    rpc::{self, RpcResponseError},
};

/// A state-changing transaction to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
}

impl TxRequest {
    pub fn create(code: Bytes) -> Self {
        Self {
            to: None,
            input: code,
            value: U256::ZERO,
        }
    }

    pub fn call(to: Address, input: impl Into<Bytes>) -> Self {
        Self {
            to: Some(to),
            input: input.into(),
            value: U256::ZERO,
        }
    }
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
}

/// Operations the deployment core needs from a ledger.
///
/// Implementations sign with the chain's credential and must hand out
/// transactions in nonce order.
pub trait ChainClient: Send + Sync {
    /// Address transactions are sent from.
    fn sender(&self) -> Address;

    /// Sign and broadcast a transaction, returning its hash.
    fn send_transaction(
        &self,
        tx: &TxRequest,
    ) -> impl Future<Output = Result<B256, ClientError>> + Send;

    /// Receipt of a transaction, or `None` while it is pending.
    fn get_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<TxReceipt>, ClientError>> + Send;

    /// Read-only call against the latest state.
    fn call(
        &self,
        to: Address,
        input: Bytes,
    ) -> impl Future<Output = Result<Bytes, ClientError>> + Send;
}

/// Receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: U64,
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    contract_address: Option<Address>,
    gas_used: U64,
}

impl From<RpcReceipt> for TxReceipt {
    fn from(receipt: RpcReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.to(),
            // Pre-Byzantium receipts have no status; treat them as successful.
            success: receipt.status.is_none_or(|s| s == U64::from(1)),
            contract_address: receipt.contract_address,
            gas_used: receipt.gas_used.to(),
        }
    }
}

/// [`ChainClient`] over JSON-RPC with a local signing key.
///
/// Nonces are allocated locally under a lock so concurrent submissions from
/// the same credential stay strictly increasing.
#[derive(Debug)]
pub struct RpcChainClient {
    http: reqwest::Client,
    url: Url,
    chain_id: u64,
    signer: PrivateKeySigner,
    /// Gas limit as a percentage of the node's estimate.
    gas_multiplier_percent: u64,
    next_nonce: Mutex<Option<u64>>,
}

impl RpcChainClient {
    pub fn new(chain: &ChainEndpoint, gas_multiplier_percent: u64) -> anyhow::Result<Self> {
        let signer = chain
            .signing_key
            .signer()
            .with_context(|| format!("Invalid signing key for chain `{}`", chain.name))?;

        Ok(Self {
            http: rpc::create_client()?,
            url: chain.rpc_url.clone(),
            chain_id: chain.chain_id,
            signer,
            gas_multiplier_percent: gas_multiplier_percent.max(100),
            next_nonce: Mutex::new(None),
        })
    }

    /// Wait until the endpoint answers, then check it serves the configured chain.
    pub async fn connect(
        chain: &ChainEndpoint,
        gas_multiplier_percent: u64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Self::new(chain, gas_multiplier_percent)?;

        rpc::wait_until_ready(&chain.name, timeout, || async {
            client.remote_chain_id().await.map(|_| ())
        })
        .await?;

        let remote = client.remote_chain_id().await?;
        if remote != chain.chain_id {
            anyhow::bail!(
                "Chain `{}` expects chain id {}, but {} serves chain id {}",
                chain.name,
                chain.chain_id,
                chain.rpc_url,
                remote
            );
        }

        tracing::info!(
            chain = %chain.name,
            chain_id = remote,
            sender = %client.sender(),
            "Connected to chain"
        );
        Ok(client)
    }

    async fn remote_chain_id(&self) -> anyhow::Result<u64> {
        let id: U64 = rpc::json_rpc_call(&self.http, &self.url, "eth_chainId", vec![]).await?;
        Ok(id.to())
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, ClientError> {
        rpc::json_rpc_call(&self.http, &self.url, method, params)
            .await
            .map_err(|err| match err.downcast_ref::<RpcResponseError>() {
                Some(rpc_err) if rpc_err.is_revert() => ClientError::Reverted(rpc_err.to_string()),
                _ => ClientError::from(err),
            })
    }

    fn tx_object(&self, tx: &TxRequest) -> Value {
        let mut object = json!({
            "from": self.signer.address(),
            "data": tx.input,
            "value": tx.value,
        });
        if let Some(to) = tx.to {
            object["to"] = json!(to);
        }
        object
    }

    async fn pending_nonce(&self) -> Result<u64, ClientError> {
        let nonce: U64 = self
            .request(
                "eth_getTransactionCount",
                vec![json!(self.signer.address()), json!("pending")],
            )
            .await?;
        Ok(nonce.to())
    }

    fn sign(&self, tx: TxLegacy) -> Result<Vec<u8>, ClientError> {
        let signature = self
            .signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| ClientError::Transport(format!("failed to sign transaction: {e}")))?;
        Ok(TxEnvelope::Legacy(tx.into_signed(signature)).encoded_2718())
    }
}

impl ChainClient for RpcChainClient {
    fn sender(&self) -> Address {
        self.signer.address()
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<B256, ClientError> {
        // Estimation runs the transaction, so reverts surface here before anything is broadcast.
        let estimate: U64 = self
            .request("eth_estimateGas", vec![self.tx_object(tx)])
            .await?;
        let gas_limit = estimate.to::<u64>().saturating_mul(self.gas_multiplier_percent) / 100;
        let gas_price: U128 = self.request("eth_gasPrice", vec![]).await?;

        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => self.pending_nonce().await?,
        };

        let raw = self.sign(TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price: gas_price.to(),
            gas_limit,
            to: tx.to.map_or(TxKind::Create, TxKind::Call),
            value: tx.value,
            input: tx.input.clone(),
        })?;

        let sent: Result<B256, ClientError> = self
            .request(
                "eth_sendRawTransaction",
                vec![json!(format!("0x{}", hex::encode(&raw)))],
            )
            .await;

        match sent {
            Ok(tx_hash) => {
                *next_nonce = Some(nonce + 1);
                tracing::debug!(%tx_hash, nonce, gas_limit, "Transaction broadcast");
                Ok(tx_hash)
            }
            Err(err) => {
                // The node's view of the nonce is authoritative after a failed broadcast.
                *next_nonce = None;
                Err(err)
            }
        }
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ClientError> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        Ok(receipt.map(TxReceipt::from))
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, ClientError> {
        self.request(
            "eth_call",
            vec![json!({ "to": to, "data": input }), json!("latest")],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::test_chain;

    #[test]
    fn test_receipt_from_rpc_json() {
        let receipt: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": "0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b",
            "blockNumber": "0x1b4",
            "status": "0x1",
            "contractAddress": "0xdf6ee06a422048de8170225c2cf1570962d4c7ba",
            "gasUsed": "0x5208",
            "logs": []
        }))
        .expect("valid receipt");
        let receipt = TxReceipt::from(receipt);

        assert!(receipt.success);
        assert_eq!(receipt.block_number, 436);
        assert_eq!(receipt.gas_used, 21_000);
        assert!(receipt.contract_address.is_some());

        let reverted: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": "0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b",
            "blockNumber": "0x1",
            "status": "0x0",
            "contractAddress": null,
            "gasUsed": "0x1"
        }))
        .expect("valid receipt");
        assert!(!TxReceipt::from(reverted).success);
    }

    #[test]
    fn test_tx_object_omits_to_for_creation() {
        let client = RpcChainClient::new(&test_chain("mainnet", 1, 30101), 120).expect("client");
        let create = client.tx_object(&TxRequest::create(Bytes::from_static(&[0x60, 0x80])));
        assert!(create.get("to").is_none());
        assert_eq!(create["data"], json!("0x6080"));

        let call = client.tx_object(&TxRequest::call(Address::ZERO, Bytes::new()));
        assert_eq!(call["to"], json!(Address::ZERO));
    }

    #[test]
    fn test_signed_legacy_tx_is_eip155() {
        let client = RpcChainClient::new(&test_chain("fuse", 122, 30138), 120).expect("client");
        let raw = client
            .sign(TxLegacy {
                chain_id: Some(122),
                nonce: 0,
                gas_price: 10_000_000_000,
                gas_limit: 21_000,
                to: TxKind::Call(Address::ZERO),
                value: U256::ZERO,
                input: Bytes::new(),
            })
            .expect("signs");
        // Legacy transactions are RLP lists with no type prefix.
        assert!(raw[0] >= 0xc0);
    }

    #[test]
    fn test_gas_multiplier_is_at_least_one() {
        let client = RpcChainClient::new(&test_chain("mainnet", 1, 30101), 50).expect("client");
        assert_eq!(client.gas_multiplier_percent, 100);
    }
}
