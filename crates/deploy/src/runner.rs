//! Executes one deployment step against one chain.

use std::{future::Future, sync::Arc, sync::Mutex, time::Duration};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes},
};
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};

use crate::{
    ArtifactStore, ChainClient, ChainEndpoint, ClientError, DeployError, DeploymentStep,
    ResolvedArgs, StepKind, TxReceipt, TxRequest,
    step::{encode_call, encode_constructor},
};

/// Default proxy artifact, deployed as `ERC1967Proxy(address implementation, bytes data)`.
pub const DEFAULT_PROXY_ARTIFACT: &str = "ERC1967Proxy";

/// Constructor shape of the proxy artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProxyKind {
    /// `ERC1967Proxy(implementation, data)`. Upgrades are authorized by the
    /// implementation itself, so it must be UUPS.
    #[default]
    Uups,
    /// `TransparentUpgradeableProxy(implementation, initialOwner, data)`. The proxy
    /// creates its own admin contract, owned by the deployer.
    Transparent,
}

impl ProxyKind {
    /// ABI-encoded proxy constructor arguments.
    pub fn constructor_args(self, implementation: Address, owner: Address, init: &Bytes) -> Bytes {
        let mut values = vec![DynSolValue::Address(implementation)];
        if self == Self::Transparent {
            values.push(DynSolValue::Address(owner));
        }
        values.push(DynSolValue::Bytes(init.to_vec()));
        encode_constructor(&values)
    }
}

/// Submission and confirmation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerOptions {
    /// How long to wait for a broadcast transaction to be mined.
    pub confirmation_timeout: Duration,
    /// Retries after the first attempt, for transient failures only.
    pub max_retry_attempts: usize,
    /// First backoff delay; doubles on every retry.
    pub min_backoff: Duration,
    pub poll_interval: Duration,
    pub proxy_artifact: String,
    pub proxy_kind: ProxyKind,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(120),
            max_retry_attempts: 3,
            min_backoff: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            proxy_artifact: DEFAULT_PROXY_ARTIFACT.to_string(),
            proxy_kind: ProxyKind::default(),
        }
    }
}

/// What a settled step produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepOutput {
    /// Registered address: the contract, or the proxy for proxy deployments.
    pub address: Option<Address>,
    /// Implementation behind a proxy.
    pub implementation: Option<Address>,
    /// Receipts in submission order.
    pub receipts: Vec<TxReceipt>,
    /// Encoded constructor arguments of `address`.
    pub constructor_args: Bytes,
    /// Encoded constructor arguments of `implementation`.
    pub implementation_constructor_args: Bytes,
}

/// Executes steps on a single chain.
pub trait StepExecutor: Send + Sync {
    /// Address steps are signed by.
    fn deployer(&self) -> Address;

    /// Messaging endpoint of the chain.
    fn messaging_endpoint(&self) -> Address;

    /// Static checks run on every step before the first transaction.
    fn validate(&self, step: &DeploymentStep) -> Result<(), DeployError> {
        step.validate()
    }

    /// Submit the step's transaction(s) and wait for them to settle.
    fn execute(
        &self,
        step: &DeploymentStep,
        args: ResolvedArgs,
    ) -> impl Future<Output = Result<StepOutput, DeployError>> + Send;
}

/// [`StepExecutor`] backed by a [`ChainClient`].
///
/// Transient failures are retried with exponential backoff; reverts are not.
#[derive(Debug)]
pub struct StepRunner<C> {
    chain: Arc<ChainEndpoint>,
    client: C,
    artifacts: ArtifactStore,
    options: RunnerOptions,
}

impl<C: ChainClient> StepRunner<C> {
    pub fn new(
        chain: Arc<ChainEndpoint>,
        client: C,
        artifacts: ArtifactStore,
        options: RunnerOptions,
    ) -> Self {
        Self {
            chain,
            client,
            artifacts,
            options,
        }
    }

    pub fn chain(&self) -> &ChainEndpoint {
        &self.chain
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Submit one transaction on behalf of `label` and wait for a successful receipt.
    pub async fn submit(&self, label: &str, tx: TxRequest) -> Result<TxReceipt, DeployError> {
        let last_hash = Mutex::new(None);

        let receipt = (|| self.attempt(&tx, &last_hash))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(self.options.min_backoff)
                    .with_max_times(self.options.max_retry_attempts),
            )
            .sleep(tokio::time::sleep)
            .when(ClientError::is_transient)
            .notify(|err, delay| {
                tracing::warn!(
                    chain = %self.chain.name,
                    step = %label,
                    error = %err,
                    retry_in = ?delay,
                    "Transaction attempt failed, retrying"
                );
            })
            .await
            .map_err(|err| DeployError::from_client(label, err))?;

        if !receipt.success {
            return Err(DeployError::ExecutionReverted {
                step: label.to_string(),
                reason: format!("transaction {} reverted", receipt.tx_hash),
            });
        }

        tracing::debug!(
            chain = %self.chain.name,
            step = %label,
            tx_hash = %receipt.tx_hash,
            block = receipt.block_number,
            gas_used = receipt.gas_used,
            "Transaction confirmed"
        );
        Ok(receipt)
    }

    async fn attempt(
        &self,
        tx: &TxRequest,
        last_hash: &Mutex<Option<B256>>,
    ) -> Result<TxReceipt, ClientError> {
        // Once broadcast, a transaction holds its nonce until it is mined. Later
        // attempts keep waiting on it; sending again would take the next nonce and
        // execute the step twice.
        let previous = *last_hash.lock().unwrap_or_else(|p| p.into_inner());
        let tx_hash = match previous {
            Some(tx_hash) => {
                tracing::debug!(chain = %self.chain.name, %tx_hash, "Still waiting for pending transaction");
                tx_hash
            }
            None => {
                let tx_hash = self.client.send_transaction(tx).await?;
                *last_hash.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx_hash);
                tracing::debug!(chain = %self.chain.name, %tx_hash, "Waiting for confirmation");
                tx_hash
            }
        };

        self.wait_for_receipt(tx_hash).await
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ClientError> {
        let poll = async {
            loop {
                if let Some(receipt) = self.client.get_receipt(tx_hash).await? {
                    return Ok(receipt);
                }
                tokio::time::sleep(self.options.poll_interval).await;
            }
        };

        tokio::time::timeout(self.options.confirmation_timeout, poll)
            .await
            .map_err(|_| ClientError::Timeout {
                tx_hash,
                timeout: self.options.confirmation_timeout,
            })?
    }

    async fn create(
        &self,
        step: &str,
        artifact: &str,
        constructor_args: &Bytes,
    ) -> Result<(Address, TxReceipt), DeployError> {
        let code = self.artifacts.get(step, artifact)?.deploy_code(constructor_args);
        let receipt = self.submit(step, TxRequest::create(code)).await?;
        let address = receipt
            .contract_address
            .ok_or_else(|| DeployError::SubmissionFailed {
                step: step.to_string(),
                cause: format!("receipt of {} has no contract address", receipt.tx_hash),
            })?;
        Ok((address, receipt))
    }
}

impl<C: ChainClient> StepExecutor for StepRunner<C> {
    fn deployer(&self) -> Address {
        self.client.sender()
    }

    fn messaging_endpoint(&self) -> Address {
        self.chain.messaging_endpoint
    }

    fn validate(&self, step: &DeploymentStep) -> Result<(), DeployError> {
        step.validate()?;
        if let Some(artifact) = step.kind.artifact() {
            self.artifacts.get(&step.name, artifact)?;
        }
        if matches!(step.kind, StepKind::DeployProxy { .. }) {
            self.artifacts.get(&step.name, &self.options.proxy_artifact)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        step: &DeploymentStep,
        args: ResolvedArgs,
    ) -> Result<StepOutput, DeployError> {
        match &step.kind {
            StepKind::DeployPlain { artifact } => {
                let constructor_args = encode_constructor(&args.values);
                let (address, receipt) = self.create(&step.name, artifact, &constructor_args).await?;

                tracing::info!(chain = %self.chain.name, step = %step.name, %address, "Contract deployed");
                Ok(StepOutput {
                    address: Some(address),
                    receipts: vec![receipt],
                    constructor_args,
                    ..Default::default()
                })
            }
            StepKind::DeployProxy {
                artifact,
                initializer,
                ..
            } => {
                let init = encode_call(&step.name, initializer, &args.values)?;
                let implementation_args = encode_constructor(&args.constructor);

                let mut receipts = Vec::with_capacity(2);
                let implementation = match args.implementation {
                    Some(implementation) => {
                        tracing::info!(
                            chain = %self.chain.name,
                            step = %step.name,
                            %implementation,
                            "Reusing implementation from an earlier attempt"
                        );
                        implementation
                    }
                    None => {
                        let (implementation, receipt) =
                            self.create(&step.name, artifact, &implementation_args).await?;
                        tracing::debug!(chain = %self.chain.name, step = %step.name, %implementation, "Implementation deployed");
                        receipts.push(receipt);
                        implementation
                    }
                };

                let proxy_args = self.options.proxy_kind.constructor_args(
                    implementation,
                    self.client.sender(),
                    &init,
                );
                let (address, proxy_receipt) = self
                    .create(&step.name, &self.options.proxy_artifact, &proxy_args)
                    .await
                    .map_err(|err| DeployError::ProxyIncomplete {
                        step: step.name.clone(),
                        implementation,
                        source: Box::new(err),
                    })?;
                receipts.push(proxy_receipt);

                tracing::info!(
                    chain = %self.chain.name,
                    step = %step.name,
                    proxy = %address,
                    %implementation,
                    "Proxy deployed"
                );
                Ok(StepOutput {
                    address: Some(address),
                    implementation: Some(implementation),
                    receipts,
                    constructor_args: proxy_args,
                    implementation_constructor_args: implementation_args,
                })
            }
            StepKind::Invoke { target, function } => {
                let to = args.target.ok_or_else(|| DeployError::UnresolvedDependency {
                    step: step.name.clone(),
                    name: target.clone(),
                })?;
                let input = encode_call(&step.name, function, &args.values)?;
                let receipt = self.submit(&step.name, TxRequest::call(to, input)).await?;

                tracing::info!(chain = %self.chain.name, step = %step.name, %to, %function, "Call confirmed");
                Ok(StepOutput {
                    receipts: vec![receipt],
                    ..Default::default()
                })
            }
        }
    }
}
