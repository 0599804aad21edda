//! Compiled contract artifacts.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::primitives::Bytes;
use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{DeployError, DeploymentStep};

/// Creation bytecode and source identity of one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub contract_name: String,
    /// Source file the contract is declared in, used for explorer verification.
    pub source_name: Option<String>,
    pub bytecode: Bytes,
}

/// Artifact file layout. Hardhat stores `bytecode` as a hex string, Foundry as `{ object }`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactFile {
    contract_name: Option<String>,
    source_name: Option<String>,
    bytecode: BytecodeField,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BytecodeField {
    Hex(Bytes),
    Object { object: Bytes },
}

impl Artifact {
    /// Load `<dir>/<name>.json`.
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{}.json", name));
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let file: ArtifactFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

        let bytecode = match file.bytecode {
            BytecodeField::Hex(code) | BytecodeField::Object { object: code } => code,
        };
        if bytecode.is_empty() {
            anyhow::bail!(
                "Artifact {} has no creation bytecode (abstract contract or interface?)",
                path.display()
            );
        }

        Ok(Self {
            contract_name: file.contract_name.unwrap_or_else(|| name.to_string()),
            source_name: file.source_name,
            bytecode,
        })
    }

    /// Creation code followed by the ABI-encoded constructor arguments.
    pub fn deploy_code(&self, constructor_args: &[u8]) -> Bytes {
        let mut code = self.bytecode.to_vec();
        code.extend_from_slice(constructor_args);
        code.into()
    }

    /// `path/To.sol:Name` identifier expected by block explorers.
    pub fn fully_qualified_name(&self) -> String {
        match &self.source_name {
            Some(source) => format!("{}:{}", source, self.contract_name),
            None => self.contract_name.clone(),
        }
    }
}

/// Artifacts needed by one chain's steps, loaded up front.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    dir: PathBuf,
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactStore {
    /// Load every artifact referenced by `steps`, plus the proxy artifact when a
    /// step deploys behind a proxy.
    ///
    /// A missing or unusable artifact fails here, before any transaction is sent.
    pub fn load_for_steps(
        dir: &Path,
        steps: &[DeploymentStep],
        proxy_artifact: &str,
    ) -> Result<Self, DeployError> {
        let mut store = Self {
            dir: dir.to_path_buf(),
            artifacts: BTreeMap::new(),
        };

        for step in steps {
            let Some(name) = step.kind.artifact() else {
                continue;
            };
            store.load_into(&step.name, name)?;
            if matches!(step.kind, crate::StepKind::DeployProxy { .. }) {
                store.load_into(&step.name, proxy_artifact)?;
            }
        }

        Ok(store)
    }

    /// Build a store from artifacts already in memory.
    pub fn from_artifacts(artifacts: impl IntoIterator<Item = (String, Artifact)>) -> Self {
        Self {
            dir: PathBuf::new(),
            artifacts: artifacts.into_iter().collect(),
        }
    }

    fn load_into(&mut self, step: &str, name: &str) -> Result<(), DeployError> {
        if self.artifacts.contains_key(name) {
            return Ok(());
        }
        let artifact = Artifact::load(&self.dir, name).map_err(|e| DeployError::Artifact {
            step: step.to_string(),
            artifact: name.to_string(),
            reason: format!("{e:#}"),
        })?;
        tracing::debug!(artifact = %name, size = artifact.bytecode.len(), "Loaded artifact");
        self.artifacts.insert(name.to_string(), artifact);
        Ok(())
    }

    pub fn get(&self, step: &str, name: &str) -> Result<&Artifact, DeployError> {
        self.artifacts.get(name).ok_or_else(|| DeployError::Artifact {
            step: step.to_string(),
            artifact: name.to_string(),
            reason: "artifact not loaded".to_string(),
        })
    }

    pub fn find(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }
}
