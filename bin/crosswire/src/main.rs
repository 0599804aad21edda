//! crosswire deploys interdependent contracts across chains and wires the
//! cross-chain messaging path between them.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command, Direction, RunArgs};
use crosswire_deploy::{
    Checkpointer, Descriptor, EnvironmentReport, RpcConnector, RunContext, SimulatedConnector, Stage,
    encoding::encode_set_config, plan_environment, render_plan, run_environment,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let descriptor = Descriptor::load(&cli.config)?;
    tracing::debug!(config_path = %cli.config.display(), "Descriptor loaded");

    match cli.command {
        Command::Deploy(args) => execute(&descriptor, args, Stage::Deploy).await,
        Command::Wire(args) => execute(&descriptor, args, Stage::Wire).await,
        Command::Run(args) => execute(&descriptor, args, Stage::All).await,
        Command::Plan {
            environment,
            simulate,
        } => plan(&descriptor, &environment, simulate).await,
        Command::Encode {
            environment,
            local,
            remote,
            direction,
        } => encode(&descriptor, &environment, &local, &remote, direction),
    }
}

async fn execute(descriptor: &Descriptor, args: RunArgs, stage: Stage) -> Result<()> {
    let environment = descriptor.environment(&args.environment)?;
    let mut options = descriptor.options.clone();
    args.apply(&mut options);
    let ctx = RunContext::new(descriptor, &environment, options);

    tracing::info!(
        environment = %environment.name,
        %stage,
        chains = ?environment.chains,
        outdata = %ctx.outdata.display(),
        "Starting run"
    );

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping once in-flight transactions settle");
            cancel.cancel();
        }
    });

    let connector = RpcConnector::from_context(&ctx);
    let report = run_environment(&ctx, &environment, &connector, stage).await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        println!("{}", report.render());
    }
    into_result(&report)
}

async fn plan(descriptor: &Descriptor, environment: &str, simulate: bool) -> Result<()> {
    let environment = descriptor.environment(environment)?;
    let mut ctx = RunContext::new(descriptor, &environment, descriptor.options.clone());

    if !simulate {
        let plans = plan_environment(&ctx, &environment)?;
        println!("{}", render_plan(&plans));
        return Ok(());
    }

    ctx.persist = false;
    let report = run_environment(&ctx, &environment, &SimulatedConnector::new(), Stage::All).await;
    println!("{}", report.render());
    tracing::info!(transactions = report.transactions(), "Simulation finished");
    into_result(&report)
}

fn encode(
    descriptor: &Descriptor,
    environment: &str,
    local: &str,
    remote: &str,
    direction: Direction,
) -> Result<()> {
    let environment = descriptor.environment(environment)?;
    let wiring = environment
        .pair(local, remote)
        .with_context(|| format!("No wiring for {}->{} in `{}`", local, remote, environment.name))?;
    let remote_chain = descriptor
        .chains
        .get(remote)
        .with_context(|| format!("Unknown chain `{}`", remote))?;

    // The OApp address comes from the checkpoint when the chain was already deployed.
    let ctx = RunContext::new(descriptor, &environment, descriptor.options.clone());
    let registry = Checkpointer::new(&ctx.outdata, local, environment.steps_for(local)).resume()?;
    let oapp = registry.get(&wiring.oapp).unwrap_or_default();
    if oapp.is_zero() {
        tracing::warn!(oapp = %wiring.oapp, "OApp not deployed yet, calldata uses the zero address");
    }

    let mut batches = Vec::new();
    if direction.includes_send() {
        batches.push(("send", wiring.send_library, wiring.send_params(remote_chain.eid)));
    }
    if direction.includes_receive() {
        batches.push(("receive", wiring.receive_library, wiring.receive_params(remote_chain.eid)));
    }

    for (label, library, params) in batches {
        println!("# {} library {}", label, library);
        for param in &params {
            println!("eid={} type={} payload={}", param.remote_eid, param.config_type, param.payload);
        }
        println!("setConfig({}, {}): {}", oapp, library, encode_set_config(oapp, library, &params));
    }
    Ok(())
}

fn into_result(report: &EnvironmentReport) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }

    let failures = report
        .failures
        .iter()
        .map(|f| match &f.step {
            Some(step) => format!("{} (step `{}`): {}", f.scope, step, f.message),
            None => format!("{}: {}", f.scope, f.message),
        })
        .collect::<Vec<_>>()
        .join("; ");
    anyhow::bail!("Run of `{}` failed: {}", report.environment, failures)
}
