//! Best-effort source verification on Etherscan-compatible explorers.

use std::{future::Future, path::PathBuf, time::Duration};

use alloy_core::primitives::{Address, Bytes};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Artifact, ArtifactStore, ChainReport};

/// Explorer API of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerConfig {
    pub api_url: Url,
    #[serde(default)]
    pub api_key: String,
}

/// Compiler settings shared by every verification request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSettings {
    /// e.g. `v0.8.27+commit.40a35a09`.
    #[serde(default)]
    pub compiler_version: String,
    /// Standard JSON input the artifacts were compiled from.
    #[serde(default)]
    pub standard_json_input: Option<PathBuf>,
}

/// One deployed contract to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub chain: String,
    pub address: Address,
    /// `path/To.sol:Name`.
    pub contract_name: String,
    pub constructor_args: Bytes,
}

/// Submits verification requests.
pub trait Verifier: Send + Sync {
    /// Submit one request, returning the explorer's receipt identifier.
    fn verify(&self, request: &VerificationRequest) -> impl Future<Output = Result<String>> + Send;
}

/// Requests for every contract a chain run deployed, proxies included.
pub fn verification_requests(
    report: &ChainReport,
    artifacts: &ArtifactStore,
    proxy_artifact: &str,
) -> Vec<VerificationRequest> {
    let name_of = |artifact: &str| {
        artifacts
            .find(artifact)
            .map_or_else(|| artifact.to_string(), Artifact::fully_qualified_name)
    };

    let mut requests = Vec::new();
    for record in report.deployed() {
        let (Some(address), Some(artifact)) = (record.address, record.artifact.as_deref()) else {
            continue;
        };

        match record.implementation {
            Some(implementation) => {
                requests.push(VerificationRequest {
                    chain: report.chain.clone(),
                    address: implementation,
                    contract_name: name_of(artifact),
                    constructor_args: record.implementation_constructor_args.clone(),
                });
                requests.push(VerificationRequest {
                    chain: report.chain.clone(),
                    address,
                    contract_name: name_of(proxy_artifact),
                    constructor_args: record.constructor_args.clone(),
                });
            }
            None => requests.push(VerificationRequest {
                chain: report.chain.clone(),
                address,
                contract_name: name_of(artifact),
                constructor_args: record.constructor_args.clone(),
            }),
        }
    }
    requests
}

/// Submit every request, logging failures. Returns how many were accepted.
pub async fn verify_best_effort<V: Verifier>(verifier: &V, requests: &[VerificationRequest]) -> usize {
    let mut accepted = 0;
    for request in requests {
        match verifier.verify(request).await {
            Ok(guid) => {
                accepted += 1;
                tracing::info!(
                    chain = %request.chain,
                    contract = %request.contract_name,
                    address = %request.address,
                    %guid,
                    "Verification submitted"
                );
            }
            Err(err) => tracing::warn!(
                chain = %request.chain,
                contract = %request.contract_name,
                address = %request.address,
                error = %format!("{err:#}"),
                "Verification failed, continuing"
            ),
        }
    }
    accepted
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: String,
}

impl ExplorerResponse {
    fn into_result(self) -> Result<String> {
        if self.status == "1" {
            return Ok(self.result);
        }
        if self.result.to_lowercase().contains("already verified") {
            return Ok("already verified".to_string());
        }
        anyhow::bail!("Explorer rejected verification: {} ({})", self.result, self.message)
    }
}

/// [`Verifier`] for the Etherscan `verifysourcecode` API.
#[derive(Debug, Clone)]
pub struct EtherscanVerifier {
    http: reqwest::Client,
    explorer: ExplorerConfig,
    compiler_version: String,
    source: String,
}

impl EtherscanVerifier {
    pub fn new(explorer: ExplorerConfig, settings: &VerificationSettings) -> Result<Self> {
        let path = settings
            .standard_json_input
            .as_ref()
            .context("Verification requires `verification.standard_json_input`")?;
        if settings.compiler_version.is_empty() {
            anyhow::bail!("Verification requires `verification.compiler_version`");
        }
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read standard JSON input {}", path.display()))?;

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .context("Failed to create HTTP client")?,
            explorer,
            compiler_version: settings.compiler_version.clone(),
            source,
        })
    }

    fn form(&self, request: &VerificationRequest) -> Vec<(&'static str, String)> {
        vec![
            ("apikey", self.explorer.api_key.clone()),
            ("module", "contract".to_string()),
            ("action", "verifysourcecode".to_string()),
            ("contractaddress", request.address.to_string()),
            ("sourceCode", self.source.clone()),
            ("codeformat", "solidity-standard-json-input".to_string()),
            ("contractname", request.contract_name.clone()),
            ("compilerversion", self.compiler_version.clone()),
            // Field name as spelled by the Etherscan API.
            ("constructorArguements", hex::encode(&request.constructor_args)),
        ]
    }
}

impl Verifier for EtherscanVerifier {
    async fn verify(&self, request: &VerificationRequest) -> Result<String> {
        let response: ExplorerResponse = self
            .http
            .post(self.explorer.api_url.clone())
            .form(&self.form(request))
            .send()
            .await
            .with_context(|| format!("Failed to reach explorer {}", self.explorer.api_url))?
            .json()
            .await
            .context("Failed to parse explorer response")?;

        response.into_result()
    }
}
