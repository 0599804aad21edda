//! Addresses produced by a deployment run, and their on-disk checkpoint.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::DeploymentStep;

/// Logical component name -> deployed address, for one chain.
///
/// Entries are only ever added. Invocation steps, which produce no address,
/// are tracked by name so a resumed run does not repeat them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, Address>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    completed_calls: BTreeSet<String>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Address> {
        self.contracts.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
    }

    /// Record a deployed component.
    ///
    /// Re-registering a name with the same address is a no-op; a different address is refused.
    pub fn register(&mut self, name: impl Into<String>, address: Address) -> Result<()> {
        let name = name.into();
        match self.contracts.get(&name) {
            Some(existing) if *existing != address => anyhow::bail!(
                "Component `{}` is already registered at {}, refusing to overwrite with {}",
                name,
                existing,
                address
            ),
            Some(_) => Ok(()),
            None => {
                self.contracts.insert(name, address);
                Ok(())
            }
        }
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed_calls.contains(step)
    }

    pub fn mark_completed(&mut self, step: impl Into<String>) {
        self.completed_calls.insert(step.into());
    }

    pub fn contracts(&self) -> impl Iterator<Item = (&str, Address)> {
        self.contracts.iter().map(|(name, addr)| (name.as_str(), *addr))
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

/// Hash of a chain's step graph.
///
/// Stored with each checkpoint so a resumed run can tell whether the steps changed
/// since the registry was written.
pub fn steps_hash(steps: &[DeploymentStep]) -> String {
    let json = serde_json::to_vec(steps).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

/// Registry snapshot persisted after each successful step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCheckpoint {
    pub chain: String,
    /// [`steps_hash`] of the graph that produced this registry.
    pub config_hash: String,
    /// Unix timestamp of the last write.
    pub updated_at: u64,
    /// Version of the tool that wrote the checkpoint.
    pub tool_version: String,
    pub registry: ContractRegistry,
}

impl RegistryCheckpoint {
    pub fn new(chain: impl Into<String>, config_hash: String, registry: ContractRegistry) -> Self {
        Self {
            chain: chain.into(),
            config_hash,
            updated_at: chrono::Utc::now().timestamp().max(0) as u64,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            registry,
        }
    }

    /// Write the checkpoint as formatted JSON.
    ///
    /// The file is replaced atomically so an interrupted write never truncates it.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(format!(
                "Failed to create checkpoint directory {}",
                parent.display()
            ))?;
        }

        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize registry checkpoint")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .context(format!("Failed to write registry checkpoint to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .context(format!("Failed to move registry checkpoint to {}", path.display()))?;

        Ok(())
    }

    /// Load a checkpoint, failing if the file is missing or malformed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Registry checkpoint does not exist: {}", path.display());
        }

        let content = std::fs::read_to_string(path).context(format!(
            "Failed to read registry checkpoint from {}",
            path.display()
        ))?;

        serde_json::from_str(&content).context("Failed to parse registry checkpoint JSON")
    }
}

/// Writes a chain's registry to `<dir>/<chain>.json` after every successful step.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    path: PathBuf,
    chain: String,
    config_hash: String,
}

impl Checkpointer {
    pub fn new(dir: &Path, chain: &str, steps: &[DeploymentStep]) -> Self {
        Self {
            path: Self::path_for(dir, chain),
            chain: chain.to_string(),
            config_hash: steps_hash(steps),
        }
    }

    pub fn path_for(dir: &Path, chain: &str) -> PathBuf {
        dir.join(format!("{}.json", chain))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist(&self, registry: &ContractRegistry) -> Result<()> {
        RegistryCheckpoint::new(&self.chain, self.config_hash.clone(), registry.clone())
            .save_to_file(&self.path)?;
        tracing::debug!(path = %self.path.display(), contracts = registry.len(), "Registry checkpoint saved");
        Ok(())
    }

    /// Load the registry of a previous run, if one was checkpointed.
    ///
    /// A checkpoint written for a different step graph is still used, with a warning:
    /// the idempotency check only looks at component names.
    pub fn resume(&self) -> Result<ContractRegistry> {
        if !self.path.exists() {
            tracing::info!(chain = %self.chain, "No registry checkpoint found, starting from scratch");
            return Ok(ContractRegistry::new());
        }

        let checkpoint = RegistryCheckpoint::load_from_file(&self.path)?;
        if checkpoint.config_hash != self.config_hash {
            tracing::warn!(
                chain = %self.chain,
                checkpoint_hash = %checkpoint.config_hash,
                current_hash = %self.config_hash,
                "Deployment steps changed since the checkpoint was written"
            );
        }

        tracing::info!(
            chain = %self.chain,
            contracts = checkpoint.registry.len(),
            path = %self.path.display(),
            "Resuming from registry checkpoint"
        );
        Ok(checkpoint.registry)
    }
}
