//! End-to-end runs of the shipped `mainnet-fuse` descriptor against simulated ledgers.
//!
//! Run with: cargo test --test pipeline

use std::path::{Path, PathBuf};

use alloy_core::primitives::{Address, Bytes};
use anyhow::{Context, Result};
use crosswire_deploy::{
    Checkpointer, Descriptor, ProxyKind, RegistryCheckpoint, RunContext, SimulatedConnector, SimulatedLedger,
    Stage, StepStatus, plan_environment, run_environment,
};
use serde_json::json;
use tempdir::TempDir;

const DESCRIPTOR: &str = include_str!("../../../deployments/mainnet-fuse.toml");

const ARTIFACTS: &[&str] = &[
    "MainnetOApp",
    "Portal",
    "ETHYieldManager",
    "LidoYieldProvider",
    "FuseOApp",
    "vETH",
    "TransparentUpgradeableProxy",
];

/// Distinct creation code per artifact, so transactions can be told apart.
fn bytecode(index: usize) -> Bytes {
    Bytes::from(vec![0x60, index as u8 + 1, 0x60, 0x00, 0xf3])
}

/// A scratch copy of the repository layout: descriptor, artifacts, outdata.
struct TestContext {
    _dir: TempDir,
    descriptor_path: PathBuf,
}

impl TestContext {
    fn new(prefix: &str) -> Result<Self> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = TempDir::new(prefix).context("Failed to create temp dir")?;
        let deployments = dir.path().join("deployments");
        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&deployments)?;
        std::fs::create_dir_all(&artifacts)?;

        let descriptor_path = deployments.join("mainnet-fuse.toml");
        std::fs::write(&descriptor_path, DESCRIPTOR)?;

        for (index, name) in ARTIFACTS.iter().enumerate() {
            let artifact = json!({
                "contractName": name,
                "sourceName": format!("contracts/{}.sol", name),
                "bytecode": bytecode(index).to_string(),
            });
            std::fs::write(artifacts.join(format!("{}.json", name)), artifact.to_string())?;
        }

        Ok(Self {
            _dir: dir,
            descriptor_path,
        })
    }

    fn context(&self, resume: bool) -> Result<(Descriptor, RunContext)> {
        let descriptor = Descriptor::load(&self.descriptor_path)?;
        let environment = descriptor.environment("production")?;
        let mut options = descriptor.options.clone();
        options.resume = resume;
        let ctx = RunContext::new(&descriptor, &environment, options);
        Ok((descriptor, ctx))
    }

    fn checkpoint(&self, ctx: &RunContext, chain: &str) -> Result<RegistryCheckpoint> {
        RegistryCheckpoint::load_from_file(&Checkpointer::path_for(&ctx.outdata, chain))
    }
}

fn outdata_exists(path: &Path) -> bool {
    path.join("mainnet.json").exists() && path.join("fuse.json").exists()
}

#[tokio::test]
async fn test_production_deploys_and_wires_both_chains() -> Result<()> {
    let test = TestContext::new("crosswire-full")?;
    let (descriptor, ctx) = test.context(false)?;
    let environment = descriptor.environment("production")?;
    let connector = SimulatedConnector::new();

    let report = run_environment(&ctx, &environment, &connector, Stage::All).await;
    assert!(report.is_success(), "failures: {:?}", report.failures);

    let mainnet = report.chain("mainnet").context("mainnet report")?;
    assert_eq!(mainnet.count(StepStatus::Deployed), 4);
    assert_eq!(mainnet.count(StepStatus::Invoked), 4);
    // Two plain deployments, two proxies of two transactions each, four calls.
    assert_eq!(mainnet.transactions, 10);
    for component in ["MainnetOApp", "Portal", "ETHYieldManager", "LidoYieldProvider"] {
        assert!(mainnet.registry.contains(component), "{} not registered", component);
    }

    let fuse = report.chain("fuse").context("fuse report")?;
    assert_eq!(fuse.transactions, 4);
    assert!(fuse.registry.contains("FuseOApp"));
    assert!(fuse.registry.contains("vETH"));

    assert_eq!(report.wiring.len(), 2);
    for pair in &report.wiring {
        let actions: Vec<&str> = pair.transactions.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(actions.len(), 4, "{}->{}: {:?}", pair.local, pair.remote, actions);
        assert!(pair.skipped.is_empty());
    }
    let mainnet_wiring = report
        .wiring
        .iter()
        .find(|w| w.local == "mainnet")
        .context("mainnet wiring")?;
    assert_eq!(Some(mainnet_wiring.oapp), mainnet.registry.get("MainnetOApp"));

    // Deployment plus wiring, all on the same in-memory ledger.
    let ledger = connector.ledger("mainnet").context("mainnet ledger")?;
    assert_eq!(ledger.sent().len(), 14);

    assert!(outdata_exists(&ctx.outdata));
    let checkpoint = test.checkpoint(&ctx, "mainnet")?;
    assert_eq!(checkpoint.registry, mainnet.registry);
    Ok(())
}

#[test]
fn test_descriptor_matches_deployed_toolchain() -> Result<()> {
    let test = TestContext::new("crosswire-descriptor")?;
    let (descriptor, ctx) = test.context(false)?;

    assert_eq!(ctx.options.proxy_kind, ProxyKind::Transparent);
    assert_eq!(ctx.options.proxy_artifact, "TransparentUpgradeableProxy");
    assert_eq!(descriptor.verification.compiler_version, "v0.8.27+commit.40a35a09");
    Ok(())
}

#[tokio::test]
async fn test_resumed_run_sends_no_deployments() -> Result<()> {
    let test = TestContext::new("crosswire-resume")?;
    let (descriptor, ctx) = test.context(false)?;
    let environment = descriptor.environment("production")?;

    let first = run_environment(&ctx, &environment, &SimulatedConnector::new(), Stage::Deploy).await;
    assert!(first.is_success(), "failures: {:?}", first.failures);
    assert!(first.wiring.is_empty());

    let (_, resumed) = test.context(true)?;
    let second = run_environment(&resumed, &environment, &SimulatedConnector::new(), Stage::Deploy).await;
    assert!(second.is_success(), "failures: {:?}", second.failures);

    for chain in ["mainnet", "fuse"] {
        let before = first.chain(chain).context("first report")?;
        let after = second.chain(chain).context("second report")?;
        assert_eq!(after.transactions, 0, "{} sent transactions again", chain);
        assert_eq!(after.count(StepStatus::Skipped), after.steps.len());
        assert_eq!(after.registry.get("FuseOApp"), before.registry.get("FuseOApp"));
    }

    // Everything is settled, so the plan executes nothing.
    let plans = plan_environment(&resumed, &environment)?;
    assert!(plans.iter().all(|(_, steps)| steps.iter().all(|s| s.settled)));
    Ok(())
}

#[tokio::test]
async fn test_wire_stage_uses_checkpointed_registries() -> Result<()> {
    let test = TestContext::new("crosswire-wire")?;
    let (descriptor, ctx) = test.context(false)?;
    let environment = descriptor.environment("production")?;

    let deployed = run_environment(&ctx, &environment, &SimulatedConnector::new(), Stage::Deploy).await;
    assert!(deployed.is_success(), "failures: {:?}", deployed.failures);

    let wired = run_environment(&ctx, &environment, &SimulatedConnector::new(), Stage::Wire).await;
    assert!(wired.is_success(), "failures: {:?}", wired.failures);
    assert!(wired.chains.is_empty());
    assert_eq!(wired.transactions(), 8);

    let fuse_oapp = deployed
        .chain("fuse")
        .and_then(|c| c.registry.get("FuseOApp"))
        .context("FuseOApp deployed")?;
    let fuse_wiring = wired
        .wiring
        .iter()
        .find(|w| w.local == "fuse")
        .context("fuse wiring")?;
    assert_eq!(fuse_wiring.oapp, fuse_oapp);
    Ok(())
}

#[tokio::test]
async fn test_failed_chain_is_not_wired() -> Result<()> {
    let test = TestContext::new("crosswire-failure")?;
    let (descriptor, ctx) = test.context(false)?;
    let environment = descriptor.environment("production")?;

    let portal_code = bytecode(1);
    let mainnet = SimulatedLedger::new(Address::ZERO).with_revert_rule(move |tx| {
        (tx.to.is_none() && tx.input.starts_with(&portal_code[..]))
            .then(|| "constructor reverted".to_string())
    });
    let connector = SimulatedConnector::new().with_ledger("mainnet", mainnet);

    let report = run_environment(&ctx, &environment, &connector, Stage::All).await;
    assert!(!report.is_success());

    let mainnet = report.chain("mainnet").context("partial mainnet report")?;
    assert!(mainnet.registry.contains("MainnetOApp"));
    assert!(!mainnet.registry.contains("Portal"));
    assert_eq!(mainnet.count(StepStatus::NotAttempted), 6);

    let deploy_failure = report
        .failures
        .iter()
        .find(|f| f.scope == "mainnet")
        .context("mainnet failure")?;
    assert_eq!(deploy_failure.step.as_deref(), Some("Portal"));
    assert!(report.failures.iter().any(|f| f.scope == "mainnet->fuse"));

    // The fuse side only needs its own registry and is wired regardless.
    assert_eq!(report.wiring.len(), 1);
    assert_eq!(report.wiring[0].local, "fuse");
    assert_eq!(report.wiring[0].transactions.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_resume_after_failed_proxy_reuses_implementation() -> Result<()> {
    let test = TestContext::new("crosswire-proxy")?;
    let (descriptor, ctx) = test.context(false)?;
    let environment = descriptor.environment("production")?;

    let proxy_code = bytecode(6);
    let mainnet = SimulatedLedger::new(Address::ZERO).with_revert_rule(move |tx| {
        (tx.to.is_none() && tx.input.starts_with(&proxy_code[..]))
            .then(|| "proxy constructor reverted".to_string())
    });
    let connector = SimulatedConnector::new().with_ledger("mainnet", mainnet);

    let failed = run_environment(&ctx, &environment, &connector, Stage::Deploy).await;
    assert!(!failed.is_success());
    let portal = failed
        .chain("mainnet")
        .and_then(|c| c.steps.iter().find(|s| s.name == "Portal"))
        .context("portal record")?;
    assert_eq!(portal.status, StepStatus::Failed);
    let implementation = portal.implementation.context("implementation kept")?;

    let checkpoint = test.checkpoint(&ctx, "mainnet")?;
    assert_eq!(checkpoint.registry.get("Portal.implementation"), Some(implementation));
    assert!(!checkpoint.registry.contains("Portal"));

    let (_, resumed) = test.context(true)?;
    let connector = SimulatedConnector::new();
    let second = run_environment(&resumed, &environment, &connector, Stage::Deploy).await;
    assert!(second.is_success(), "failures: {:?}", second.failures);

    let mainnet = second.chain("mainnet").context("mainnet report")?;
    let portal = mainnet
        .steps
        .iter()
        .find(|s| s.name == "Portal")
        .context("portal record")?;
    assert_eq!(portal.status, StepStatus::Deployed);
    assert_eq!(portal.implementation, Some(implementation));
    // Only the proxy is sent for Portal.
    assert_eq!(portal.tx_hashes.len(), 1);
    let ledger = connector.ledger("mainnet").context("mainnet ledger")?;
    let portal_code = bytecode(1);
    assert!(!ledger.sent().iter().any(|tx| tx.input.starts_with(&portal_code[..])));
    Ok(())
}
