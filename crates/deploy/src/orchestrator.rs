//! Runs a chain's deployment graph in dependency order.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
};

use alloy_core::primitives::{Address, B256, Bytes};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    ArgContext, Checkpointer, ContractRegistry, DeployError, DeploymentStep, StepExecutor,
    StepOutput,
};

/// Final status of one step in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Deployed,
    Invoked,
    /// Settled by a previous run.
    Skipped,
    Failed,
    NotAttempted,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub kind: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tx_hashes: Vec<B256>,
    #[serde(skip)]
    pub constructor_args: Bytes,
    #[serde(skip)]
    pub implementation_constructor_args: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-step statuses and the accumulated registry of one chain's run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub chain: String,
    /// In input order.
    pub steps: Vec<StepRecord>,
    pub registry: ContractRegistry,
    /// Transactions submitted during this run.
    pub transactions: usize,
}

impl ChainReport {
    fn new(chain: &str, steps: &[DeploymentStep], registry: ContractRegistry) -> Self {
        Self {
            chain: chain.to_string(),
            steps: steps
                .iter()
                .map(|step| StepRecord {
                    name: step.name.clone(),
                    kind: step.kind.label(),
                    status: StepStatus::NotAttempted,
                    artifact: step.kind.artifact().map(str::to_string),
                    address: None,
                    implementation: None,
                    tx_hashes: Vec::new(),
                    constructor_args: Bytes::new(),
                    implementation_constructor_args: Bytes::new(),
                    error: None,
                })
                .collect(),
            registry,
            transactions: 0,
        }
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Steps that deployed a contract during this run.
    pub fn deployed(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.status == StepStatus::Deployed)
    }

    fn fail(&mut self, idx: usize, err: &DeployError) {
        let record = &mut self.steps[idx];
        record.status = StepStatus::Failed;
        record.error = Some(err.to_string());
    }
}

/// A run that stopped early, with everything settled before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: DeployError,
    pub report: ChainReport,
}

/// A step in execution order, as [`plan`] sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    pub kind: &'static str,
    /// Already settled according to the registry; a run would skip it.
    pub settled: bool,
}

/// Dependency edges between the steps of one graph.
#[derive(Debug)]
struct StepGraph {
    dependents: Vec<Vec<usize>>,
    indegree: Vec<usize>,
}

impl StepGraph {
    /// Dependencies name either a step of the graph or the component it produces.
    /// Names outside the graph must already be in the registry.
    fn build(steps: &[DeploymentStep], registry: &ContractRegistry) -> Result<Self, DeployError> {
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, step) in steps.iter().enumerate() {
            let names = std::iter::once(step.name.as_str()).chain(step.produces_name());
            for name in names {
                match index.insert(name, idx) {
                    Some(other) if other != idx => {
                        return Err(DeployError::DuplicateStep(name.to_string()));
                    }
                    _ => {}
                }
            }
        }

        let mut graph = Self {
            dependents: vec![Vec::new(); steps.len()],
            indegree: vec![0; steps.len()],
        };
        for (idx, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                match index.get(dep.as_str()) {
                    Some(&from) => {
                        graph.dependents[from].push(idx);
                        graph.indegree[idx] += 1;
                    }
                    None if registry.contains(dep) || registry.is_completed(dep) => {}
                    None => {
                        return Err(DeployError::UnresolvedDependency {
                            step: step.name.clone(),
                            name: dep.clone(),
                        });
                    }
                }
            }
        }

        Ok(graph)
    }

    fn roots(&self) -> BinaryHeap<Reverse<usize>> {
        self.indegree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect()
    }

    /// Mark `idx` settled, queueing dependents whose last dependency it was.
    fn release(&self, idx: usize, indegree: &mut [usize], ready: &mut BinaryHeap<Reverse<usize>>) {
        for &next in &self.dependents[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    /// Kahn's algorithm; among ready steps the earliest in input order goes first.
    fn order(&self, steps: &[DeploymentStep]) -> Result<Vec<usize>, DeployError> {
        let mut indegree = self.indegree.clone();
        let mut ready = self.roots();
        let mut order = Vec::with_capacity(steps.len());

        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            self.release(idx, &mut indegree, &mut ready);
        }

        if order.len() < steps.len() {
            let stuck = indegree
                .iter()
                .enumerate()
                .filter(|(_, degree)| **degree > 0)
                .map(|(idx, _)| steps[idx].name.clone())
                .collect();
            return Err(DeployError::CyclicDependency { steps: stuck });
        }
        Ok(order)
    }
}

/// Execution order of `steps`, marking the ones `registry` already settles.
pub fn plan(
    steps: &[DeploymentStep],
    registry: &ContractRegistry,
) -> Result<Vec<PlannedStep>, DeployError> {
    let graph = StepGraph::build(steps, registry)?;
    Ok(graph
        .order(steps)?
        .into_iter()
        .map(|idx| PlannedStep {
            name: steps[idx].name.clone(),
            kind: steps[idx].kind.label(),
            settled: steps[idx].is_settled(registry),
        })
        .collect())
}

/// Deploys one chain's step graph through a [`StepExecutor`].
///
/// Steps already present in the registry are skipped, so a failed run can be
/// resumed by passing its report's registry back in.
#[derive(Debug)]
pub struct DeploymentOrchestrator<'a, E> {
    chain: String,
    executor: &'a E,
    max_in_flight: usize,
    cancel: CancellationToken,
    checkpoint: Option<Checkpointer>,
}

impl<'a, E: StepExecutor> DeploymentOrchestrator<'a, E> {
    pub fn new(chain: impl Into<String>, executor: &'a E) -> Self {
        Self {
            chain: chain.into(),
            executor,
            max_in_flight: 1,
            cancel: CancellationToken::new(),
            checkpoint: None,
        }
    }

    /// Maximum number of independent steps executing at once.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Persist the registry after every settled step.
    pub fn with_checkpoint(mut self, checkpoint: Checkpointer) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub async fn run(
        &self,
        steps: &[DeploymentStep],
        registry: ContractRegistry,
    ) -> Result<ChainReport, RunFailure> {
        let mut report = ChainReport::new(&self.chain, steps, registry);

        // Graph and validation errors surface before any transaction.
        let prepared = StepGraph::build(steps, &report.registry).and_then(|graph| {
            graph.order(steps)?;
            steps
                .iter()
                .try_for_each(|step| self.executor.validate(step))?;
            Ok(graph)
        });
        let graph = match prepared {
            Ok(graph) => graph,
            Err(error) => return Err(RunFailure { error, report }),
        };

        tracing::info!(chain = %self.chain, steps = steps.len(), "Starting deployment run");

        let mut indegree = graph.indegree.clone();
        let mut ready = graph.roots();
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<DeployError> = None;

        loop {
            while failure.is_none() && in_flight.len() < self.max_in_flight {
                let Some(Reverse(idx)) = ready.pop() else {
                    break;
                };
                let step = &steps[idx];

                if step.is_settled(&report.registry) {
                    self.skip(&mut report, idx, step);
                    graph.release(idx, &mut indegree, &mut ready);
                    continue;
                }

                if self.cancel.is_cancelled() {
                    tracing::warn!(chain = %self.chain, step = %step.name, "Run cancelled");
                    failure = Some(DeployError::Cancelled {
                        step: step.name.clone(),
                    });
                    break;
                }

                let ctx = ArgContext {
                    registry: &report.registry,
                    deployer: self.executor.deployer(),
                    messaging_endpoint: self.executor.messaging_endpoint(),
                };
                let args = match step.resolve(&ctx) {
                    Ok(args) => args,
                    Err(err) => {
                        report.fail(idx, &err);
                        failure = Some(err);
                        break;
                    }
                };

                tracing::info!(chain = %self.chain, step = %step.name, kind = step.kind.label(), "Executing step");
                let executor = self.executor;
                in_flight.push(async move { (idx, executor.execute(step, args).await) });
            }

            let Some((idx, result)) = in_flight.next().await else {
                break;
            };

            let settled = result.and_then(|output| self.settle(&mut report, idx, &steps[idx], output));
            match settled {
                Ok(()) => graph.release(idx, &mut indegree, &mut ready),
                Err(err) => {
                    tracing::error!(chain = %self.chain, step = %steps[idx].name, error = %err, "Step failed");
                    if report.steps[idx].status != StepStatus::Failed {
                        report.fail(idx, &err);
                    }
                    self.keep_implementation(&mut report, idx, &steps[idx], &err);
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(error) => Err(RunFailure { error, report }),
            None => {
                tracing::info!(
                    chain = %self.chain,
                    deployed = report.count(StepStatus::Deployed),
                    invoked = report.count(StepStatus::Invoked),
                    skipped = report.count(StepStatus::Skipped),
                    transactions = report.transactions,
                    "Deployment run complete"
                );
                Ok(report)
            }
        }
    }

    fn skip(&self, report: &mut ChainReport, idx: usize, step: &DeploymentStep) {
        let record = &mut report.steps[idx];
        record.status = StepStatus::Skipped;
        record.address = step.produces_name().and_then(|name| report.registry.get(name));
        tracing::info!(
            chain = %self.chain,
            step = %step.name,
            address = ?record.address,
            "Step already settled, skipping"
        );
    }

    /// Record the implementation of a half-finished proxy step so the next
    /// attempt deploys only the proxy.
    fn keep_implementation(
        &self,
        report: &mut ChainReport,
        idx: usize,
        step: &DeploymentStep,
        err: &DeployError,
    ) {
        let (Some(implementation), Some(name)) = (err.implementation(), step.implementation_name())
        else {
            return;
        };
        report.steps[idx].implementation = Some(implementation);
        if let Err(e) = report.registry.register(name, implementation) {
            tracing::warn!(chain = %self.chain, step = %step.name, error = %e, "Could not record implementation");
            return;
        }
        tracing::warn!(
            chain = %self.chain,
            step = %step.name,
            %implementation,
            "Proxy not deployed, implementation kept for the next run"
        );
        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.persist(&report.registry) {
                tracing::warn!(chain = %self.chain, error = %e, "Failed to persist checkpoint");
            }
        }
    }

    fn settle(
        &self,
        report: &mut ChainReport,
        idx: usize,
        step: &DeploymentStep,
        output: StepOutput,
    ) -> Result<(), DeployError> {
        report.transactions += output.receipts.len();

        let record = &mut report.steps[idx];
        record.tx_hashes = output.receipts.iter().map(|r| r.tx_hash).collect();
        record.implementation = output.implementation;
        record.constructor_args = output.constructor_args;
        record.implementation_constructor_args = output.implementation_constructor_args;

        match (step.produces_name(), output.address) {
            (Some(name), Some(address)) => {
                report
                    .registry
                    .register(name, address)
                    .map_err(|e| DeployError::Registry {
                        step: step.name.clone(),
                        reason: format!("{e:#}"),
                    })?;
                record.address = Some(address);
                record.status = StepStatus::Deployed;
            }
            (Some(_), None) => {
                return Err(DeployError::SubmissionFailed {
                    step: step.name.clone(),
                    cause: "deployment produced no address".to_string(),
                });
            }
            (None, _) => {
                report.registry.mark_completed(&step.name);
                record.status = StepStatus::Invoked;
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            checkpoint
                .persist(&report.registry)
                .map_err(|e| DeployError::Registry {
                    step: step.name.clone(),
                    reason: format!("{e:#}"),
                })?;
        }
        Ok(())
    }
}
