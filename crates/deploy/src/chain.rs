//! Target ledgers taking part in a deployment.

use std::{collections::BTreeMap, fmt, sync::Arc};

use alloy_core::primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use derive_more::Deref;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::verify::ExplorerConfig;

/// Hex-encoded private key used to sign a chain's transactions.
///
/// The value never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Parse the key into a local signer.
    pub fn signer(&self) -> anyhow::Result<PrivateKeySigner> {
        if self.is_empty() {
            anyhow::bail!("Signing key is not set");
        }
        self.0
            .trim()
            .parse::<PrivateKeySigner>()
            .context("Failed to parse signing key")
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Static description of one target ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoint {
    /// Name of the chain in the descriptor (the `[chains.<name>]` key).
    #[serde(skip)]
    pub name: String,
    /// EVM chain id, used for transaction signing.
    pub chain_id: u64,
    /// Identifier of this chain on the messaging layer.
    pub eid: u32,
    /// JSON-RPC endpoint.
    pub rpc_url: Url,
    /// Credential used for every transaction on this chain.
    #[serde(default)]
    pub signing_key: SigningKey,
    /// Address of the local messaging endpoint contract.
    pub messaging_endpoint: Address,
    /// Block explorer used for source verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer: Option<ExplorerConfig>,
}

/// All chains known to a run, keyed by name.
///
/// Endpoints are shared by reference between the pipelines that operate on them.
#[derive(Debug, Clone, Default, Deref)]
pub struct ChainEndpointRegistry(BTreeMap<String, Arc<ChainEndpoint>>);

impl ChainEndpointRegistry {
    /// Build the registry, naming each endpoint after its key.
    pub fn new(chains: BTreeMap<String, ChainEndpoint>) -> Self {
        Self(
            chains
                .into_iter()
                .map(|(name, mut chain)| {
                    chain.name = name.clone();
                    (name, Arc::new(chain))
                })
                .collect(),
        )
    }

    /// Look up a chain by name.
    pub fn chain(&self, name: &str) -> anyhow::Result<&Arc<ChainEndpoint>> {
        self.0
            .get(name)
            .with_context(|| format!("Unknown chain `{}`", name))
    }

    /// Find the chain with the given messaging-layer identifier.
    pub fn by_eid(&self, eid: u32) -> Option<&Arc<ChainEndpoint>> {
        self.0.values().find(|chain| chain.eid == eid)
    }
}
