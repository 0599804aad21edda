//! crosswire-deploy - Cross-chain deployment and messaging configuration.
//!
//! This crate deploys graphs of interdependent contracts on several chains and
//! wires the cross-chain messaging path between them.

mod artifact;
pub use artifact::{Artifact, ArtifactStore};

mod chain;
pub use chain::{ChainEndpoint, ChainEndpointRegistry, SigningKey};

mod client;
pub use client::{ChainClient, RpcChainClient, TxReceipt, TxRequest};

pub mod encoding;

mod environment;
pub use environment::{
    ChainDeployment, DEFAULT_DESCRIPTOR, Descriptor, ENV_PREFIX, Environment, RunContext,
    RunOptions,
};

mod error;
pub use error::{ClientError, DeployError};

mod messaging;
pub use messaging::{
    ChainPairWiring, ConfigParam, ConfigType, ExecutorLimitsConfig, MessagingConfigurator,
    SecurityStackConfig, WiringReport,
};

mod orchestrator;
pub use orchestrator::{
    ChainReport, DeploymentOrchestrator, PlannedStep, RunFailure, StepRecord, StepStatus, plan,
};

mod pipeline;
pub use pipeline::{
    Connector, RpcConnector, SimulatedConnector, Stage, plan_environment, run_environment,
};

mod registry;
pub use registry::{Checkpointer, ContractRegistry, RegistryCheckpoint, steps_hash};

mod report;
pub use report::{EnvironmentReport, Failure, render_plan};

pub mod rpc;

mod runner;
pub use runner::{DEFAULT_PROXY_ARTIFACT, ProxyKind, RunnerOptions, StepExecutor, StepOutput, StepRunner};

mod simulated;
pub use simulated::SimulatedLedger;

mod step;
pub use step::{
    Arg, ArgContext, DeploymentStep, ResolvedArgs, StepKind, encode_call, encode_constructor,
};

pub mod verify;
pub use verify::{
    EtherscanVerifier, ExplorerConfig, VerificationRequest, VerificationSettings, Verifier,
};
