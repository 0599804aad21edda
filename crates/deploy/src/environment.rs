//! Target-environment descriptor and the context of one run.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    ChainEndpoint, ChainEndpointRegistry, ChainPairWiring, DeploymentStep, ProxyKind, RunnerOptions,
    VerificationSettings, runner::DEFAULT_PROXY_ARTIFACT,
};

/// Prefix of environment variables overriding descriptor values.
///
/// Nested keys are separated by `__`, e.g. `CROSSWIRE_CHAINS__MAINNET__SIGNING_KEY`.
pub const ENV_PREFIX: &str = "CROSSWIRE_";

/// Default descriptor file name.
pub const DEFAULT_DESCRIPTOR: &str = "Deployment.toml";

/// Options of a run. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Start from the registry checkpoint of a previous run.
    pub resume: bool,
    pub confirmation_timeout: u64,
    pub max_retry_attempts: usize,
    /// Submit deployed contracts for source verification.
    pub verify: bool,
    /// Independent steps executing at once on one chain.
    pub max_in_flight: usize,
    pub poll_interval: u64,
    /// Gas limit as a percentage of the node's estimate.
    pub gas_multiplier: u64,
    /// How long to wait for an RPC endpoint to answer.
    pub connect_timeout: u64,
    pub proxy_artifact: String,
    /// Constructor shape of `proxy_artifact`.
    pub proxy_kind: ProxyKind,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: false,
            confirmation_timeout: 120,
            max_retry_attempts: 3,
            verify: false,
            max_in_flight: 1,
            poll_interval: 2,
            gas_multiplier: 120,
            connect_timeout: 30,
            proxy_artifact: DEFAULT_PROXY_ARTIFACT.to_string(),
            proxy_kind: ProxyKind::default(),
        }
    }
}

impl RunOptions {
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout),
            max_retry_attempts: self.max_retry_attempts,
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            proxy_artifact: self.proxy_artifact.clone(),
            proxy_kind: self.proxy_kind,
            ..Default::default()
        }
    }
}

/// Steps to run on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDeployment {
    pub chain: String,
    #[serde(default)]
    pub steps: Vec<DeploymentStep>,
}

/// One named target environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(skip)]
    pub name: String,
    /// Participating chains.
    pub chains: Vec<String>,
    #[serde(default)]
    pub deployments: Vec<ChainDeployment>,
    #[serde(default)]
    pub wiring: Vec<ChainPairWiring>,
}

impl Environment {
    /// Deployment steps of `chain`; empty when the chain only takes part in wiring.
    pub fn steps_for(&self, chain: &str) -> &[DeploymentStep] {
        self.deployments
            .iter()
            .find(|d| d.chain == chain)
            .map(|d| d.steps.as_slice())
            .unwrap_or_default()
    }

    /// Wiring entry for `local -> remote`.
    pub fn pair(&self, local: &str, remote: &str) -> Option<&ChainPairWiring> {
        self.wiring
            .iter()
            .find(|w| w.local == local && w.remote == remote)
    }

    fn validate(&self, chains: &BTreeMap<String, ChainEndpoint>) -> Result<()> {
        let members: BTreeSet<&str> = self.chains.iter().map(String::as_str).collect();
        for chain in &self.chains {
            if !chains.contains_key(chain) {
                anyhow::bail!("Environment `{}` uses undefined chain `{}`", self.name, chain);
            }
        }

        let mut deployed = BTreeSet::new();
        for deployment in &self.deployments {
            if !members.contains(deployment.chain.as_str()) {
                anyhow::bail!(
                    "Environment `{}` deploys to `{}`, which is not one of its chains",
                    self.name,
                    deployment.chain
                );
            }
            if !deployed.insert(deployment.chain.as_str()) {
                anyhow::bail!(
                    "Environment `{}` lists chain `{}` in two deployments",
                    self.name,
                    deployment.chain
                );
            }
        }

        let mut pairs = BTreeSet::new();
        for wiring in &self.wiring {
            for chain in [&wiring.local, &wiring.remote] {
                if !members.contains(chain.as_str()) {
                    anyhow::bail!(
                        "Wiring {} uses `{}`, which is not a chain of environment `{}`",
                        wiring.label(),
                        chain,
                        self.name
                    );
                }
            }
            if wiring.local == wiring.remote {
                anyhow::bail!("Wiring {} connects a chain to itself", wiring.label());
            }
            if !pairs.insert((wiring.local.as_str(), wiring.remote.as_str())) {
                anyhow::bail!("Wiring {} is listed twice", wiring.label());
            }
            wiring
                .validate()
                .with_context(|| format!("Invalid wiring in environment `{}`", self.name))?;
        }
        Ok(())
    }
}

/// Contents of `Deployment.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    /// Registry checkpoints are written under `<outdata>/<environment>/`.
    #[serde(default = "default_outdata")]
    pub outdata: PathBuf,
    pub chains: BTreeMap<String, ChainEndpoint>,
    #[serde(default)]
    pub environments: BTreeMap<String, Environment>,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub verification: VerificationSettings,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_outdata() -> PathBuf {
    PathBuf::from("data-crosswire")
}

impl Descriptor {
    /// Load a descriptor, applying `CROSSWIRE_`-prefixed environment overrides.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, Env::prefixed(ENV_PREFIX))
    }

    fn load_with(path: &Path, env: Env) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Deployment descriptor does not exist: {}", path.display());
        }

        let mut descriptor: Self = Figment::new()
            .merge(Toml::file(path))
            // Only nested keys: top-level CLI variables share the prefix.
            .merge(env.filter(|key| key.as_str().contains("__")).split("__"))
            .extract()
            .with_context(|| format!("Failed to parse deployment descriptor {}", path.display()))?;

        let base = path.parent().unwrap_or(Path::new("."));
        descriptor.artifacts_dir = base.join(&descriptor.artifacts_dir);
        descriptor.outdata = base.join(&descriptor.outdata);

        tracing::debug!(
            path = %path.display(),
            chains = descriptor.chains.len(),
            environments = descriptor.environments.len(),
            "Loaded deployment descriptor"
        );
        Ok(descriptor)
    }

    /// Look up and check an environment.
    pub fn environment(&self, name: &str) -> Result<Environment> {
        let mut environment = self
            .environments
            .get(name)
            .cloned()
            .with_context(|| {
                format!(
                    "Unknown environment `{}` (known: {})",
                    name,
                    self.environments.keys().cloned().collect::<Vec<_>>().join(", ")
                )
            })?;
        environment.name = name.to_string();
        environment.validate(&self.chains)?;
        Ok(environment)
    }

    /// Chains participating in `environment`.
    pub fn chain_registry(&self, environment: &Environment) -> ChainEndpointRegistry {
        ChainEndpointRegistry::new(
            self.chains
                .iter()
                .filter(|(name, _)| environment.chains.contains(name))
                .map(|(name, chain)| (name.clone(), chain.clone()))
                .collect(),
        )
    }
}

/// Everything a run needs, passed explicitly to every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub chains: ChainEndpointRegistry,
    pub options: RunOptions,
    pub artifacts_dir: PathBuf,
    /// Directory of this environment's registry checkpoints.
    pub outdata: PathBuf,
    pub verification: VerificationSettings,
    /// Write registry checkpoints. Off for dry runs.
    pub persist: bool,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(descriptor: &Descriptor, environment: &Environment, options: RunOptions) -> Self {
        Self {
            chains: descriptor.chain_registry(environment),
            options,
            artifacts_dir: descriptor.artifacts_dir.clone(),
            outdata: descriptor.outdata.join(&environment.name),
            verification: descriptor.verification.clone(),
            persist: true,
            cancel: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arg, StepKind};
    use tempdir::TempDir;

    const DESCRIPTOR: &str = r#"
artifacts_dir = "out"

[options]
max_retry_attempts = 5

[chains.mainnet]
chain_id = 1
eid = 30101
rpc_url = "http://localhost:8545"
messaging_endpoint = "0x1a44076050125825900e736c501f859c50fE728c"

[chains.fuse]
chain_id = 122
eid = 30138
rpc_url = "http://localhost:8546"
messaging_endpoint = "0x1a44076050125825900e736c501f859c50fE728c"

[chains.fuse.explorer]
api_url = "https://explorer.fuse.io/api"

[environments.production]
chains = ["mainnet", "fuse"]

[[environments.production.deployments]]
chain = "fuse"
steps = [
    { name = "FuseOApp", kind = "deploy_plain", artifact = "FuseOApp", args = ["messaging_endpoint", "deployer"] },
    { name = "vETH", kind = "deploy_proxy", artifact = "vETH", initializer = "initialize()", constructor_args = [{ ref = "FuseOApp" }, "zero"], depends_on = ["FuseOApp"] },
    { name = "setVETH", kind = "invoke", target = "FuseOApp", function = "setVETHAddress(address)", args = [{ ref = "vETH" }], depends_on = ["vETH"] },
]

[[environments.production.wiring]]
local = "fuse"
remote = "mainnet"
oapp = "FuseOApp"
send_library = "0x377530cdA84DFb2673bF4d145DCF0C4D7fdcB5b6"
receive_library = "0x5B19bd330A84c049b62D5B0FC2bA120217a18C1C"
executor = { max_message_size = 10000, executor = "0xc097ab8CD7b053326DFe9fB3E3a31a0CCe3B526f" }
outbound = { confirmations = 99, required_verifiers = ["0x795F8325aF292Ff6E58249361d1954893BE15Aff"] }
inbound = { confirmations = 99, required_verifiers = ["0x795F8325aF292Ff6E58249361d1954893BE15Aff"] }
"#;

    fn write_descriptor(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join(DEFAULT_DESCRIPTOR);
        std::fs::write(&path, content).expect("write descriptor");
        path
    }

    fn no_env() -> Env {
        Env::prefixed("CROSSWIRE_TEST_UNSET_")
    }

    #[test]
    fn test_load_descriptor() {
        let temp_dir = TempDir::new("crosswire-test").expect("Failed to create temp dir");
        let path = write_descriptor(temp_dir.path(), DESCRIPTOR);

        let descriptor = Descriptor::load_with(&path, no_env()).expect("parses");
        assert_eq!(descriptor.artifacts_dir, temp_dir.path().join("out"));
        assert_eq!(descriptor.outdata, temp_dir.path().join("data-crosswire"));
        assert_eq!(descriptor.options.max_retry_attempts, 5);
        assert_eq!(descriptor.options.max_in_flight, 1);
        assert!(descriptor.chains["fuse"].explorer.is_some());
        assert!(descriptor.chains["mainnet"].signing_key.is_empty());

        let environment = descriptor.environment("production").expect("valid environment");
        let steps = environment.steps_for("fuse");
        assert_eq!(steps.len(), 3);
        assert!(matches!(
            &steps[1].kind,
            StepKind::DeployProxy { constructor_args, .. }
                if constructor_args == &vec![Arg::reference("FuseOApp"), Arg::Zero]
        ));
        assert_eq!(steps[0].args, vec![Arg::MessagingEndpoint, Arg::Deployer]);
        assert!(environment.steps_for("mainnet").is_empty());

        let wiring = environment.pair("fuse", "mainnet").expect("pair");
        assert_eq!(wiring.outbound.required_count(), 1);
        assert_eq!(wiring.outbound.optional_threshold, 0);
        assert_eq!(wiring.executor.max_message_size, 10_000);
    }

    #[test]
    fn test_env_overrides_secrets() {
        let temp_dir = TempDir::new("crosswire-test").expect("Failed to create temp dir");
        let path = write_descriptor(temp_dir.path(), DESCRIPTOR);

        figment::Jail::expect_with(|jail| {
            jail.set_env("CROSSWIRE_CHAINS__FUSE__SIGNING_KEY", "0x01");
            jail.set_env("CROSSWIRE_VERBOSITY", "debug");
            let descriptor = Descriptor::load(&path).expect("parses");
            assert!(!descriptor.chains["fuse"].signing_key.is_empty());
            assert!(descriptor.chains["mainnet"].signing_key.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_environments() {
        let temp_dir = TempDir::new("crosswire-test").expect("Failed to create temp dir");
        let unknown_chain = DESCRIPTOR.replace(r#"chains = ["mainnet", "fuse"]"#, r#"chains = ["mainnet", "fuse", "polygon"]"#);
        let path = write_descriptor(temp_dir.path(), &unknown_chain);
        let descriptor = Descriptor::load_with(&path, no_env()).expect("parses");
        assert!(descriptor.environment("production").is_err());
        assert!(descriptor.environment("staging").is_err());

        let outside = DESCRIPTOR.replace(r#"chains = ["mainnet", "fuse"]"#, r#"chains = ["fuse"]"#);
        let path = write_descriptor(temp_dir.path(), &outside);
        let descriptor = Descriptor::load_with(&path, no_env()).expect("parses");
        let err = descriptor.environment("production").expect_err("wiring to non-member");
        assert!(err.to_string().contains("mainnet"));
    }

    #[test]
    fn test_invalid_security_stack_rejected_on_load() {
        let temp_dir = TempDir::new("crosswire-test").expect("Failed to create temp dir");
        let over_threshold = DESCRIPTOR.replace(
            r#"inbound = { confirmations = 99, required_verifiers"#,
            r#"inbound = { confirmations = 99, optional_threshold = 2, required_verifiers"#,
        );
        let path = write_descriptor(temp_dir.path(), &over_threshold);
        let descriptor = Descriptor::load_with(&path, no_env()).expect("parses");

        let err = descriptor
            .environment("production")
            .expect_err("threshold above optional verifiers");
        let message = format!("{err:#}");
        assert!(message.contains("fuse -> mainnet"), "{}", message);
        assert!(message.contains("inbound"), "{}", message);
    }

    #[test]
    fn test_missing_descriptor() {
        let temp_dir = TempDir::new("crosswire-test").expect("Failed to create temp dir");
        assert!(Descriptor::load(&temp_dir.path().join("Deployment.toml")).is_err());
    }

    #[test]
    fn test_run_context_scopes_checkpoints_by_environment() {
        let temp_dir = TempDir::new("crosswire-test").expect("Failed to create temp dir");
        let path = write_descriptor(temp_dir.path(), DESCRIPTOR);
        let descriptor = Descriptor::load_with(&path, no_env()).expect("parses");
        let environment = descriptor.environment("production").expect("valid");

        let ctx = RunContext::new(&descriptor, &environment, descriptor.options.clone());
        assert_eq!(ctx.outdata, temp_dir.path().join("data-crosswire").join("production"));
        assert_eq!(ctx.chains.len(), 2);
        assert_eq!(ctx.chains.chain("fuse").expect("fuse").name, "fuse");
        assert_eq!(
            ctx.options.runner_options().confirmation_timeout,
            Duration::from_secs(120)
        );
    }
}
