//! Run reports and their terminal rendering.

use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use serde::Serialize;

use crate::{ChainReport, DeployError, PlannedStep, StepStatus, WiringReport};

/// Something that stopped part of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Chain name, or `local->remote` for wiring.
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn new(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            step: None,
            message: message.into(),
        }
    }

    pub fn from_error(scope: impl Into<String>, error: &DeployError) -> Self {
        Self {
            scope: scope.into(),
            step: error.step().map(str::to_string),
            message: error.to_string(),
        }
    }
}

/// Outcome of every chain and pair of one environment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentReport {
    pub environment: String,
    pub chains: Vec<ChainReport>,
    pub wiring: Vec<WiringReport>,
    pub failures: Vec<Failure>,
}

impl EnvironmentReport {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn chain(&self, name: &str) -> Option<&ChainReport> {
        self.chains.iter().find(|c| c.chain == name)
    }

    pub fn transactions(&self) -> usize {
        self.chains.iter().map(|c| c.transactions).sum::<usize>()
            + self.wiring.iter().map(|w| w.transactions.len()).sum::<usize>()
    }

    /// Tables of step statuses, registries, wiring and failures.
    pub fn render(&self) -> String {
        let mut out = Vec::new();

        if !self.chains.is_empty() {
            let mut steps = table(["Chain", "Step", "Kind", "Status", "Address"]);
            for chain in &self.chains {
                for step in &chain.steps {
                    let address = match (step.address, step.implementation) {
                        (Some(proxy), Some(implementation)) => {
                            format!("{} (impl {})", proxy, implementation)
                        }
                        (Some(address), None) => address.to_string(),
                        _ => String::new(),
                    };
                    steps.add_row(vec![
                        chain.chain.clone(),
                        step.name.clone(),
                        step.kind.to_string(),
                        status_cell(step.status, step.error.as_deref()),
                        address,
                    ]);
                }
            }
            out.push(steps.to_string());

            let mut registry = table(["Chain", "Component", "Address"]);
            for chain in &self.chains {
                for (name, address) in chain.registry.contracts() {
                    registry.add_row(vec![chain.chain.clone(), name.to_string(), address.to_string()]);
                }
            }
            out.push(registry.to_string());
        }

        if !self.wiring.is_empty() {
            let mut wiring = table(["Pair", "OApp", "Submitted", "Skipped"]);
            for pair in &self.wiring {
                wiring.add_row(vec![
                    format!("{}->{}", pair.local, pair.remote),
                    pair.oapp.to_string(),
                    pair.transactions
                        .iter()
                        .map(|(action, _)| action.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    pair.skipped.join(", "),
                ]);
            }
            out.push(wiring.to_string());
        }

        if !self.failures.is_empty() {
            let mut failures = table(["Scope", "Step", "Error"]);
            for failure in &self.failures {
                failures.add_row(vec![
                    failure.scope.clone(),
                    failure.step.clone().unwrap_or_default(),
                    failure.message.clone(),
                ]);
            }
            out.push(failures.to_string());
        }

        out.join("\n")
    }
}

/// Execution order of each chain, as a table.
pub fn render_plan(plans: &[(String, Vec<PlannedStep>)]) -> String {
    let mut plan = table(["Chain", "#", "Step", "Kind", "Action"]);
    for (chain, steps) in plans {
        for (position, step) in steps.iter().enumerate() {
            plan.add_row(vec![
                chain.clone(),
                (position + 1).to_string(),
                step.name.clone(),
                step.kind.to_string(),
                if step.settled { "skip" } else { "execute" }.to_string(),
            ]);
        }
    }
    plan.to_string()
}

fn table<const N: usize>(header: [&str; N]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

fn status_cell(status: StepStatus, error: Option<&str>) -> String {
    match error {
        Some(error) => format!("{}: {}", status, error),
        None => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContractRegistry;
    use alloy_core::primitives::Address;

    #[test]
    fn test_failure_carries_step() {
        let failure = Failure::from_error(
            "mainnet",
            &DeployError::ExecutionReverted {
                step: "Portal".to_string(),
                reason: "paused".to_string(),
            },
        );
        assert_eq!(failure.step.as_deref(), Some("Portal"));
        assert!(failure.message.contains("paused"));
    }

    #[test]
    fn test_render_lists_registry_and_failures() {
        let mut registry = ContractRegistry::new();
        registry
            .register("FuseOApp", Address::with_last_byte(7))
            .expect("register");

        let mut report = EnvironmentReport::new("production");
        report.chains.push(ChainReport {
            chain: "fuse".to_string(),
            steps: Vec::new(),
            registry,
            transactions: 1,
        });
        report.failures.push(Failure::new("mainnet", "connection refused"));

        let rendered = report.render();
        assert!(rendered.contains("FuseOApp"));
        assert!(rendered.contains("connection refused"));
        assert!(!report.is_success());
        assert_eq!(report.transactions(), 1);
    }

    #[test]
    fn test_render_plan() {
        let plans = vec![(
            "fuse".to_string(),
            vec![
                PlannedStep {
                    name: "FuseOApp".to_string(),
                    kind: "deploy",
                    settled: true,
                },
                PlannedStep {
                    name: "vETH".to_string(),
                    kind: "deploy-proxy",
                    settled: false,
                },
            ],
        )];
        let rendered = render_plan(&plans);
        assert!(rendered.contains("skip"));
        assert!(rendered.contains("execute"));
    }
}
