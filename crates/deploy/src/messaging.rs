//! Cross-chain messaging wiring for one directional chain pair.

use std::collections::BTreeSet;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::{SolCall, SolValue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    ChainClient, ChainEndpoint, ContractRegistry, DeployError, StepRunner, TxRequest,
    encoding::{self, IMessageLibManager},
};

/// Verifier quorum for one direction of a chain pair.
///
/// The required verifier count is always the length of `required_verifiers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStackConfig {
    /// Block confirmations before verifiers attest.
    pub confirmations: u64,
    #[serde(default)]
    pub required_verifiers: Vec<Address>,
    #[serde(default)]
    pub optional_verifiers: Vec<Address>,
    /// Optional verifiers that must attest in addition to all required ones.
    #[serde(default)]
    pub optional_threshold: u8,
}

impl SecurityStackConfig {
    pub fn required_count(&self) -> usize {
        self.required_verifiers.len()
    }

    /// Check the quorum can be encoded and satisfied.
    pub fn validate(&self) -> Result<(), String> {
        if self.required_verifiers.len() > usize::from(u8::MAX) {
            return Err(format!(
                "{} required verifiers, at most 255 allowed",
                self.required_verifiers.len()
            ));
        }
        if self.optional_verifiers.len() > usize::from(u8::MAX) {
            return Err(format!(
                "{} optional verifiers, at most 255 allowed",
                self.optional_verifiers.len()
            ));
        }
        if usize::from(self.optional_threshold) > self.optional_verifiers.len() {
            return Err(format!(
                "optional threshold {} exceeds {} optional verifiers",
                self.optional_threshold,
                self.optional_verifiers.len()
            ));
        }
        if self.optional_threshold == 0 && !self.optional_verifiers.is_empty() {
            return Err("optional verifiers are set but the optional threshold is 0".to_string());
        }
        if self.required_verifiers.is_empty() && self.optional_threshold == 0 {
            return Err("no verifier would attest to messages".to_string());
        }

        let mut seen = BTreeSet::new();
        for verifier in self.required_verifiers.iter().chain(&self.optional_verifiers) {
            if verifier.is_zero() {
                return Err("verifier address is zero".to_string());
            }
            if !seen.insert(verifier) {
                return Err(format!("verifier {} is listed twice", verifier));
            }
        }
        Ok(())
    }
}

/// Executor bounds for outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorLimitsConfig {
    pub max_message_size: u32,
    pub executor: Address,
}

/// Configuration kinds understood by the message library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[repr(u32)]
pub enum ConfigType {
    Executor = 1,
    SecurityStack = 2,
}

/// One entry of a batched `setConfig` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigParam {
    /// Messaging identifier of the remote chain.
    pub remote_eid: u32,
    pub config_type: ConfigType,
    pub payload: Bytes,
}

impl ConfigParam {
    pub fn security_stack(remote_eid: u32, config: &SecurityStackConfig) -> Self {
        Self {
            remote_eid,
            config_type: ConfigType::SecurityStack,
            payload: encoding::encode_security_stack(config),
        }
    }

    pub fn executor(remote_eid: u32, config: &ExecutorLimitsConfig) -> Self {
        Self {
            remote_eid,
            config_type: ConfigType::Executor,
            payload: encoding::encode_executor_limits(config),
        }
    }
}

/// Messaging configuration of `local` towards `remote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPairWiring {
    pub local: String,
    pub remote: String,
    /// Registry name of the messaging application on the local chain.
    pub oapp: String,
    pub send_library: Address,
    pub receive_library: Address,
    /// Blocks during which the previous receive library stays valid.
    #[serde(default)]
    pub receive_grace_period: u64,
    pub outbound: SecurityStackConfig,
    pub executor: ExecutorLimitsConfig,
    pub inbound: SecurityStackConfig,
}

impl ChainPairWiring {
    pub fn label(&self) -> String {
        format!("{}->{}", self.local, self.remote)
    }

    /// Entries of the send-library batch: outbound quorum and executor limits.
    pub fn send_params(&self, remote_eid: u32) -> Vec<ConfigParam> {
        vec![
            ConfigParam::security_stack(remote_eid, &self.outbound),
            ConfigParam::executor(remote_eid, &self.executor),
        ]
    }

    /// Entries of the receive-library batch: inbound quorum.
    pub fn receive_params(&self, remote_eid: u32) -> Vec<ConfigParam> {
        vec![ConfigParam::security_stack(remote_eid, &self.inbound)]
    }

    /// Both quorums and both libraries, checked without touching a chain.
    pub fn validate(&self) -> Result<(), DeployError> {
        let invalid = |direction: &str, reason: String| DeployError::InvalidSecurityConfig {
            local: self.local.clone(),
            remote: self.remote.clone(),
            reason: format!("{}: {}", direction, reason),
        };
        self.outbound.validate().map_err(|r| invalid("outbound", r))?;
        self.inbound.validate().map_err(|r| invalid("inbound", r))?;
        if self.send_library.is_zero() || self.receive_library.is_zero() {
            return Err(invalid("libraries", "library address is zero".to_string()));
        }
        Ok(())
    }
}

/// Transactions issued while wiring one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WiringReport {
    pub local: String,
    pub remote: String,
    pub oapp: Address,
    /// `(action, tx hash)` in submission order.
    pub transactions: Vec<(String, B256)>,
    /// Actions skipped because the endpoint already had the requested state.
    pub skipped: Vec<String>,
}

/// Wires the messaging path from the runner's chain to remote chains.
#[derive(Debug)]
pub struct MessagingConfigurator<'a, C> {
    runner: &'a StepRunner<C>,
    cancel: CancellationToken,
}

impl<'a, C: ChainClient> MessagingConfigurator<'a, C> {
    pub fn new(runner: &'a StepRunner<C>) -> Self {
        Self {
            runner,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop before the next transaction once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn local(&self) -> &ChainEndpoint {
        self.runner.chain()
    }

    /// Select libraries, then submit the send and receive configuration batches.
    ///
    /// Quorums are validated before any transaction is sent.
    pub async fn configure_pair(
        &self,
        remote: &ChainEndpoint,
        wiring: &ChainPairWiring,
        registry: &ContractRegistry,
    ) -> Result<WiringReport, DeployError> {
        wiring.validate()?;

        let label = wiring.label();
        let oapp = registry
            .get(&wiring.oapp)
            .ok_or_else(|| DeployError::UnresolvedDependency {
                step: label.clone(),
                name: wiring.oapp.clone(),
            })?;
        let endpoint = self.local().messaging_endpoint;
        let eid = remote.eid;

        let send_params = wiring.send_params(eid);
        let receive_params = wiring.receive_params(eid);

        let mut report = WiringReport {
            local: wiring.local.clone(),
            remote: wiring.remote.clone(),
            oapp,
            transactions: Vec::new(),
            skipped: Vec::new(),
        };

        tracing::info!(pair = %label, %oapp, %endpoint, eid, "Configuring messaging path");

        if self.send_library_set(oapp, eid, wiring.send_library).await {
            report.skipped.push("setSendLibrary".to_string());
        } else {
            let input = IMessageLibManager::setSendLibraryCall {
                oapp,
                eid,
                newLib: wiring.send_library,
            }
            .abi_encode();
            self.submit(&mut report, "setSendLibrary", endpoint, input).await?;
        }

        if self.receive_library_set(oapp, eid, wiring.receive_library).await {
            report.skipped.push("setReceiveLibrary".to_string());
        } else {
            let input = IMessageLibManager::setReceiveLibraryCall {
                oapp,
                eid,
                newLib: wiring.receive_library,
                gracePeriod: U256::from(wiring.receive_grace_period),
            }
            .abi_encode();
            self.submit(&mut report, "setReceiveLibrary", endpoint, input).await?;
        }

        let input = encoding::encode_set_config(oapp, wiring.send_library, &send_params);
        self.submit(&mut report, "setConfig(send)", endpoint, input).await?;

        let input = encoding::encode_set_config(oapp, wiring.receive_library, &receive_params);
        self.submit(&mut report, "setConfig(receive)", endpoint, input).await?;

        tracing::info!(
            pair = %label,
            transactions = report.transactions.len(),
            skipped = report.skipped.len(),
            "Messaging path configured"
        );
        Ok(report)
    }

    async fn submit(
        &self,
        report: &mut WiringReport,
        action: &str,
        endpoint: Address,
        input: impl Into<Bytes>,
    ) -> Result<(), DeployError> {
        let step = format!("{}->{}:{}", report.local, report.remote, action);
        if self.cancel.is_cancelled() {
            tracing::warn!(chain = %report.local, step = %step, "Wiring cancelled");
            return Err(DeployError::Cancelled { step });
        }
        let receipt = self
            .runner
            .submit(&step, TxRequest::call(endpoint, input))
            .await?;
        report.transactions.push((action.to_string(), receipt.tx_hash));
        Ok(())
    }

    /// Whether `library` is already the explicit send library. Read failures count as unset.
    async fn send_library_set(&self, oapp: Address, eid: u32, library: Address) -> bool {
        let endpoint = self.local().messaging_endpoint;
        let current = self
            .read::<Address>(
                endpoint,
                IMessageLibManager::getSendLibraryCall { sender: oapp, eid }.abi_encode(),
            )
            .await;
        if current != Some(library) {
            return false;
        }

        let is_default = self
            .read::<bool>(
                endpoint,
                IMessageLibManager::isDefaultSendLibraryCall { sender: oapp, eid }.abi_encode(),
            )
            .await;
        is_default == Some(false)
    }

    async fn receive_library_set(&self, oapp: Address, eid: u32, library: Address) -> bool {
        let endpoint = self.local().messaging_endpoint;
        let current = self
            .read::<(Address, bool)>(
                endpoint,
                IMessageLibManager::getReceiveLibraryCall { receiver: oapp, eid }.abi_encode(),
            )
            .await;
        current == Some((library, false))
    }

    async fn read<T: SolValue + From<<T::SolType as alloy_sol_types::SolType>::RustType>>(
        &self,
        to: Address,
        input: Vec<u8>,
    ) -> Option<T> {
        let output = match self.runner.client().call(to, input.into()).await {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(chain = %self.local().name, %to, error = %err, "Endpoint read failed");
                return None;
            }
        };
        T::abi_decode(&output).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        SimulatedLedger,
        chain::tests::test_chain,
        encoding::decode_security_stack,
        runner::tests::{SENDER, fast_options, test_artifacts},
    };
    use alloy_core::primitives::address;
    use std::sync::Arc;

    const OAPP: Address = address!("0xDF6ee06A422048de8170225C2CF1570962D4c7bA");
    const SEND_LIB: Address = address!("0xbB2Ea70C9E858123480642Cf96acbcCE1372dCe1");
    const RECEIVE_LIB: Address = address!("0xc02Ab410f0734EFa3F14628780e6e695156024C2");
    const DVN: Address = address!("0x589dEDbD617e0CBcB916A9223F4d1300c294236b");
    const EXECUTOR: Address = address!("0x173272739Bd7Aa6e4e214714048a9fE699453059");

    fn stack() -> SecurityStackConfig {
        SecurityStackConfig {
            confirmations: 99,
            required_verifiers: vec![DVN],
            optional_verifiers: vec![],
            optional_threshold: 0,
        }
    }

    fn wiring() -> ChainPairWiring {
        ChainPairWiring {
            local: "mainnet".to_string(),
            remote: "fuse".to_string(),
            oapp: "MainnetOApp".to_string(),
            send_library: SEND_LIB,
            receive_library: RECEIVE_LIB,
            receive_grace_period: 0,
            outbound: stack(),
            executor: ExecutorLimitsConfig {
                max_message_size: 10_000,
                executor: EXECUTOR,
            },
            inbound: stack(),
        }
    }

    fn registry() -> ContractRegistry {
        let mut registry = ContractRegistry::new();
        registry.register("MainnetOApp", OAPP).expect("register");
        registry
    }

    fn runner(ledger: SimulatedLedger) -> StepRunner<SimulatedLedger> {
        StepRunner::new(
            Arc::new(test_chain("mainnet", 1, 30101)),
            ledger,
            test_artifacts(&[]),
            fast_options(),
        )
    }

    #[test]
    fn test_security_stack_validation() {
        assert!(stack().validate().is_ok());

        let over_threshold = SecurityStackConfig {
            optional_threshold: 1,
            ..stack()
        };
        assert!(over_threshold.validate().unwrap_err().contains("exceeds"));

        let duplicate = SecurityStackConfig {
            optional_verifiers: vec![DVN],
            optional_threshold: 1,
            ..stack()
        };
        assert!(duplicate.validate().unwrap_err().contains("twice"));

        let zero_threshold = SecurityStackConfig {
            optional_verifiers: vec![EXECUTOR],
            ..stack()
        };
        assert!(zero_threshold.validate().is_err());

        let nobody = SecurityStackConfig {
            required_verifiers: vec![],
            ..stack()
        };
        assert!(nobody.validate().is_err());

        let optional_only = SecurityStackConfig {
            required_verifiers: vec![],
            optional_verifiers: vec![DVN, EXECUTOR],
            optional_threshold: 2,
            ..stack()
        };
        assert!(optional_only.validate().is_ok());
    }

    #[tokio::test]
    async fn test_configure_pair_selects_libraries_before_config() {
        let ledger = SimulatedLedger::new(SENDER);
        let runner = runner(ledger.clone());
        let remote = test_chain("fuse", 122, 30138);

        let report = MessagingConfigurator::new(&runner)
            .configure_pair(&remote, &wiring(), &registry())
            .await
            .expect("configures");

        let sent = ledger.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|tx| tx.to == Some(runner.chain().messaging_endpoint)));
        assert_eq!(&sent[0].input[..4], IMessageLibManager::setSendLibraryCall::SELECTOR.as_slice());
        assert_eq!(&sent[1].input[..4], IMessageLibManager::setReceiveLibraryCall::SELECTOR.as_slice());
        assert_eq!(&sent[2].input[..4], IMessageLibManager::setConfigCall::SELECTOR.as_slice());
        assert_eq!(&sent[3].input[..4], IMessageLibManager::setConfigCall::SELECTOR.as_slice());

        let send_batch = IMessageLibManager::setConfigCall::abi_decode(&sent[2].input).expect("decodes");
        assert_eq!(send_batch.oapp, OAPP);
        assert_eq!(send_batch.lib, SEND_LIB);
        let types: Vec<_> = send_batch.params.iter().map(|p| (p.eid, p.configType)).collect();
        assert_eq!(types, vec![(30138, 2), (30138, 1)]);
        assert_eq!(decode_security_stack(&send_batch.params[0].config).expect("uln"), stack());

        let receive_batch = IMessageLibManager::setConfigCall::abi_decode(&sent[3].input).expect("decodes");
        assert_eq!(receive_batch.lib, RECEIVE_LIB);
        assert_eq!(receive_batch.params.len(), 1);

        assert_eq!(report.transactions.len(), 4);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_quorum_sends_nothing() {
        let ledger = SimulatedLedger::new(SENDER);
        let runner = runner(ledger.clone());
        let mut wiring = wiring();
        wiring.inbound.optional_threshold = 3;

        let err = MessagingConfigurator::new(&runner)
            .configure_pair(&test_chain("fuse", 122, 30138), &wiring, &registry())
            .await
            .expect_err("threshold above optional verifiers");

        assert!(matches!(err, DeployError::InvalidSecurityConfig { ref reason, .. } if reason.starts_with("inbound")));
        assert!(ledger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_libraries_already_selected_are_skipped() {
        let ledger = SimulatedLedger::new(SENDER).with_read_rule(|_, input| {
            let selector = &input[..4];
            if selector == IMessageLibManager::getSendLibraryCall::SELECTOR.as_slice() {
                Some(SEND_LIB.abi_encode().into())
            } else if selector == IMessageLibManager::isDefaultSendLibraryCall::SELECTOR.as_slice() {
                Some(false.abi_encode().into())
            } else if selector == IMessageLibManager::getReceiveLibraryCall::SELECTOR.as_slice() {
                // Still on the endpoint default.
                Some((RECEIVE_LIB, true).abi_encode().into())
            } else {
                None
            }
        });
        let runner = runner(ledger.clone());

        let report = MessagingConfigurator::new(&runner)
            .configure_pair(&test_chain("fuse", 122, 30138), &wiring(), &registry())
            .await
            .expect("configures");

        assert_eq!(report.skipped, vec!["setSendLibrary".to_string()]);
        assert_eq!(ledger.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_unregistered_oapp() {
        let runner = runner(SimulatedLedger::new(SENDER));
        let err = MessagingConfigurator::new(&runner)
            .configure_pair(&test_chain("fuse", 122, 30138), &wiring(), &ContractRegistry::new())
            .await
            .expect_err("oapp not deployed");
        assert!(matches!(err, DeployError::UnresolvedDependency { ref name, .. } if name == "MainnetOApp"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_transactions() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        // Mined normally; the first broadcast fires the token.
        let ledger = SimulatedLedger::new(SENDER).with_revert_rule(move |_| {
            trigger.cancel();
            None
        });
        let runner = runner(ledger.clone());

        let err = MessagingConfigurator::new(&runner)
            .with_cancellation(cancel)
            .configure_pair(&test_chain("fuse", 122, 30138), &wiring(), &registry())
            .await
            .expect_err("cancelled");

        assert_eq!(
            err,
            DeployError::Cancelled {
                step: "mainnet->fuse:setReceiveLibrary".to_string()
            }
        );
        assert_eq!(ledger.sent().len(), 1);
    }
}
