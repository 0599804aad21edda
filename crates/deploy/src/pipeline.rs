//! Deploys and wires every chain of an environment.
//!
//! Each chain runs its own pipeline; pipelines share nothing but the run
//! context. Wiring starts once all deployments have settled, and a chain whose
//! deployment failed is not wired.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use futures::future::join_all;

use crate::{
    ArtifactStore, ChainClient, ChainEndpoint, ChainPairWiring, ChainReport, Checkpointer,
    ContractRegistry, DeploymentOrchestrator, DeploymentStep, EnvironmentReport, EtherscanVerifier,
    Failure, MessagingConfigurator, PlannedStep, RpcChainClient, RunContext, RunFailure,
    SimulatedLedger, StepRunner, WiringReport,
    environment::Environment,
    orchestrator,
    verify::{verification_requests, verify_best_effort},
};

/// Which parts of the pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Deploy,
    Wire,
    All,
}

impl Stage {
    pub fn deploys(self) -> bool {
        matches!(self, Self::Deploy | Self::All)
    }

    pub fn wires(self) -> bool {
        matches!(self, Self::Wire | Self::All)
    }
}

/// Opens a [`ChainClient`] for a chain.
pub trait Connector: Send + Sync {
    type Client: ChainClient;

    fn connect(&self, chain: &ChainEndpoint) -> impl Future<Output = Result<Self::Client>> + Send;
}

/// Connects over JSON-RPC with the chain's signing key.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    pub gas_multiplier_percent: u64,
    pub timeout: Duration,
}

impl RpcConnector {
    pub fn from_context(ctx: &RunContext) -> Self {
        Self {
            gas_multiplier_percent: ctx.options.gas_multiplier,
            timeout: Duration::from_secs(ctx.options.connect_timeout),
        }
    }
}

impl Connector for RpcConnector {
    type Client = RpcChainClient;

    async fn connect(&self, chain: &ChainEndpoint) -> Result<RpcChainClient> {
        RpcChainClient::connect(chain, self.gas_multiplier_percent, self.timeout).await
    }
}

/// Hands out one in-memory ledger per chain, reused across stages.
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    ledgers: Arc<Mutex<BTreeMap<String, SimulatedLedger>>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `ledger` for `chain` instead of a fresh one.
    pub fn with_ledger(self, chain: &str, ledger: SimulatedLedger) -> Self {
        self.ledgers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(chain.to_string(), ledger);
        self
    }

    pub fn ledger(&self, chain: &str) -> Option<SimulatedLedger> {
        self.ledgers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(chain)
            .cloned()
    }
}

impl Connector for SimulatedConnector {
    type Client = SimulatedLedger;

    async fn connect(&self, chain: &ChainEndpoint) -> Result<SimulatedLedger> {
        let sender = if chain.signing_key.is_empty() {
            Address::ZERO
        } else {
            chain.signing_key.signer()?.address()
        };

        let mut ledgers = self.ledgers.lock().unwrap_or_else(|p| p.into_inner());
        let ledger = ledgers
            .entry(chain.name.clone())
            .or_insert_with(|| SimulatedLedger::new(sender))
            .clone();
        tracing::debug!(chain = %chain.name, %sender, "Using simulated ledger");
        Ok(ledger)
    }
}

/// One chain's runner, steps, and starting registry.
struct ChainPipeline<C> {
    runner: StepRunner<C>,
    steps: Vec<DeploymentStep>,
    checkpointer: Checkpointer,
    registry: ContractRegistry,
}

impl<C: ChainClient> ChainPipeline<C> {
    fn name(&self) -> &str {
        &self.runner.chain().name
    }

    async fn deploy(&self, ctx: &RunContext) -> Result<ChainReport, RunFailure> {
        let mut orchestrator = DeploymentOrchestrator::new(self.name(), &self.runner)
            .with_max_in_flight(ctx.options.max_in_flight)
            .with_cancellation(ctx.cancel.clone());
        if ctx.persist {
            orchestrator = orchestrator.with_checkpoint(self.checkpointer.clone());
        }

        let report = orchestrator.run(&self.steps, self.registry.clone()).await?;
        if ctx.options.verify {
            self.verify(ctx, &report).await;
        }
        Ok(report)
    }

    async fn verify(&self, ctx: &RunContext, report: &ChainReport) {
        let Some(explorer) = self.runner.chain().explorer.clone() else {
            tracing::info!(chain = %self.name(), "No explorer configured, skipping verification");
            return;
        };
        let requests =
            verification_requests(report, self.runner.artifacts(), &ctx.options.proxy_artifact);
        if requests.is_empty() {
            return;
        }

        match EtherscanVerifier::new(explorer, &ctx.verification) {
            Ok(verifier) => {
                let accepted = verify_best_effort(&verifier, &requests).await;
                tracing::info!(chain = %self.name(), accepted, total = requests.len(), "Verification finished");
            }
            Err(err) => {
                tracing::warn!(chain = %self.name(), error = %format!("{err:#}"), "Verification unavailable")
            }
        }
    }

    /// Configure every pair local to this chain, in order, stopping at the first failure.
    async fn wire(
        &self,
        ctx: &RunContext,
        pairs: Vec<&ChainPairWiring>,
        registry: &ContractRegistry,
    ) -> Vec<Result<WiringReport, Failure>> {
        let configurator =
            MessagingConfigurator::new(&self.runner).with_cancellation(ctx.cancel.clone());
        let mut outcomes = Vec::with_capacity(pairs.len());

        for wiring in pairs {
            if ctx.cancel.is_cancelled() {
                outcomes.push(Err(Failure::new(wiring.label(), "run cancelled")));
                break;
            }

            let outcome = match ctx.chains.chain(&wiring.remote) {
                Ok(remote) => configurator
                    .configure_pair(remote, wiring, registry)
                    .await
                    .map_err(|err| Failure::from_error(wiring.label(), &err)),
                Err(err) => Err(Failure::new(wiring.label(), format!("{err:#}"))),
            };

            let failed = outcome.is_err();
            outcomes.push(outcome);
            if failed {
                break;
            }
        }
        outcomes
    }
}

async fn prepare<K: Connector>(
    ctx: &RunContext,
    environment: &Environment,
    connector: &K,
    name: &str,
    stage: Stage,
) -> Result<ChainPipeline<K::Client>> {
    let chain = ctx.chains.chain(name)?.clone();
    let steps = environment.steps_for(name).to_vec();

    let artifacts = if stage.deploys() {
        ArtifactStore::load_for_steps(&ctx.artifacts_dir, &steps, &ctx.options.proxy_artifact)?
    } else {
        ArtifactStore::default()
    };

    let checkpointer = Checkpointer::new(&ctx.outdata, name, &steps);
    let registry = if ctx.options.resume || !stage.deploys() {
        checkpointer.resume()?
    } else {
        if checkpointer.path().exists() {
            tracing::warn!(
                chain = %name,
                path = %checkpointer.path().display(),
                "Existing registry checkpoint ignored, pass --resume to reuse it"
            );
        }
        ContractRegistry::new()
    };

    let client = connector
        .connect(&chain)
        .await
        .with_context(|| format!("Failed to connect to chain `{}`", name))?;

    Ok(ChainPipeline {
        runner: StepRunner::new(chain, client, artifacts, ctx.options.runner_options()),
        steps,
        checkpointer,
        registry,
    })
}

/// Run `stage` for every chain of `environment`.
///
/// Failures are collected in the report; one chain failing never stops another.
pub async fn run_environment<K: Connector>(
    ctx: &RunContext,
    environment: &Environment,
    connector: &K,
    stage: Stage,
) -> EnvironmentReport {
    let mut report = EnvironmentReport::new(&environment.name);

    let prepared = join_all(
        environment
            .chains
            .iter()
            .map(|name| prepare(ctx, environment, connector, name, stage)),
    )
    .await;

    let mut pipelines = Vec::new();
    for (name, result) in environment.chains.iter().zip(prepared) {
        match result {
            Ok(pipeline) => pipelines.push(pipeline),
            Err(err) => {
                tracing::error!(chain = %name, error = %format!("{err:#}"), "Chain setup failed");
                report.failures.push(Failure::new(name, format!("{err:#}")));
            }
        }
    }

    let mut registries: BTreeMap<String, ContractRegistry> = BTreeMap::new();
    if stage.deploys() {
        let outcomes = join_all(pipelines.iter().map(|p| p.deploy(ctx))).await;
        for (pipeline, outcome) in pipelines.iter().zip(outcomes) {
            match outcome {
                Ok(chain_report) => {
                    registries.insert(pipeline.name().to_string(), chain_report.registry.clone());
                    report.chains.push(chain_report);
                }
                Err(RunFailure { error, report: partial }) => {
                    tracing::error!(chain = %pipeline.name(), error = %error, "Deployment failed");
                    report.failures.push(Failure::from_error(pipeline.name(), &error));
                    report.chains.push(partial);
                }
            }
        }
    } else {
        for pipeline in &pipelines {
            registries.insert(pipeline.name().to_string(), pipeline.registry.clone());
        }
    }

    if stage.wires() {
        let mut groups: BTreeMap<&str, Vec<&ChainPairWiring>> = BTreeMap::new();
        for wiring in &environment.wiring {
            groups.entry(wiring.local.as_str()).or_default().push(wiring);
        }

        let mut runs = Vec::new();
        for (local, pairs) in groups {
            let pipeline = pipelines.iter().find(|p| p.name() == local);
            match (pipeline, registries.get(local)) {
                (Some(pipeline), Some(registry)) => runs.push(pipeline.wire(ctx, pairs, registry)),
                _ => {
                    for wiring in pairs {
                        tracing::warn!(pair = %wiring.label(), "Skipping wiring, local chain did not deploy");
                        report.failures.push(Failure::new(
                            wiring.label(),
                            format!("skipped: chain `{}` did not deploy", local),
                        ));
                    }
                }
            }
        }

        for outcome in join_all(runs).await.into_iter().flatten() {
            match outcome {
                Ok(wiring) => report.wiring.push(wiring),
                Err(failure) => report.failures.push(failure),
            }
        }
    }

    tracing::info!(
        environment = %environment.name,
        transactions = report.transactions(),
        failures = report.failures.len(),
        "Environment run finished"
    );
    report
}

/// Execution order of every chain's steps against its checkpointed registry.
pub fn plan_environment(
    ctx: &RunContext,
    environment: &Environment,
) -> Result<Vec<(String, Vec<PlannedStep>)>> {
    environment
        .deployments
        .iter()
        .map(|deployment| {
            let checkpointer = Checkpointer::new(&ctx.outdata, &deployment.chain, &deployment.steps);
            let registry = checkpointer.resume()?;
            let planned = orchestrator::plan(&deployment.steps, &registry)
                .with_context(|| format!("Invalid step graph for chain `{}`", deployment.chain))?;
            Ok((deployment.chain.clone(), planned))
        })
        .collect()
}
