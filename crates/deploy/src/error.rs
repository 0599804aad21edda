//! Error types for deployment and messaging configuration.

use std::time::Duration;

use alloy_core::primitives::{Address, B256};
use thiserror::Error;

/// Errors raised at the ledger boundary by a [`ChainClient`](crate::ChainClient).
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Network or RPC fault.
    #[error("transport error: {0}")]
    Transport(String),
    /// The transaction was accepted but not confirmed in time.
    #[error("transaction {tx_hash} not confirmed after {timeout:?}")]
    Timeout { tx_hash: B256, timeout: Duration },
    /// The ledger rejected the transaction's logic.
    #[error("execution reverted: {0}")]
    Reverted(String),
}

impl ClientError {
    /// Whether a new attempt may succeed. Reverts are final.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Reverted(_))
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}

/// Failures of a deployment or wiring run.
///
/// Graph, validation and artifact errors surface before any transaction is sent.
/// Transaction errors carry the name of the step that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("cyclic dependency between steps: {}", steps.join(", "))]
    CyclicDependency { steps: Vec<String> },

    #[error("step `{step}` references unregistered component `{name}`")]
    UnresolvedDependency { step: String, name: String },

    #[error("duplicate step or component name `{0}`")]
    DuplicateStep(String),

    #[error("step `{step}` is malformed: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("invalid security stack config for {local} -> {remote}: {reason}")]
    InvalidSecurityConfig {
        local: String,
        remote: String,
        reason: String,
    },

    #[error("step `{step}` could not be submitted: {cause}")]
    SubmissionFailed { step: String, cause: String },

    #[error("step `{step}` reverted: {reason}")]
    ExecutionReverted { step: String, reason: String },

    /// The implementation of a proxy deployment confirmed, the proxy did not.
    #[error("step `{step}` deployed implementation {implementation} but not its proxy: {source}")]
    ProxyIncomplete {
        step: String,
        implementation: Address,
        source: Box<DeployError>,
    },

    #[error("step `{step}` needs artifact `{artifact}`: {reason}")]
    Artifact {
        step: String,
        artifact: String,
        reason: String,
    },

    #[error("run cancelled before step `{step}`")]
    Cancelled { step: String },

    #[error("registry checkpoint failed after step `{step}`: {reason}")]
    Registry { step: String, reason: String },
}

impl DeployError {
    /// The step the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::UnresolvedDependency { step, .. }
            | Self::InvalidStep { step, .. }
            | Self::SubmissionFailed { step, .. }
            | Self::ExecutionReverted { step, .. }
            | Self::Artifact { step, .. }
            | Self::Cancelled { step }
            | Self::Registry { step, .. }
            | Self::ProxyIncomplete { step, .. } => Some(step),
            Self::DuplicateStep(step) => Some(step),
            Self::CyclicDependency { .. } | Self::InvalidSecurityConfig { .. } => None,
        }
    }

    /// Implementation address left behind by a failed proxy deployment.
    pub fn implementation(&self) -> Option<Address> {
        match self {
            Self::ProxyIncomplete { implementation, .. } => Some(*implementation),
            _ => None,
        }
    }

    /// Maps a ledger error onto the step that issued the transaction.
    pub(crate) fn from_client(step: &str, err: ClientError) -> Self {
        match err {
            ClientError::Reverted(reason) => Self::ExecutionReverted {
                step: step.to_string(),
                reason,
            },
            other => Self::SubmissionFailed {
                step: step.to_string(),
                cause: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_reverts_are_final() {
        assert!(ClientError::Transport("connection reset".into()).is_transient());
        assert!(
            ClientError::Timeout {
                tx_hash: B256::ZERO,
                timeout: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(!ClientError::Reverted("Ownable: caller is not the owner".into()).is_transient());
    }

    #[test]
    fn test_timeout_folds_into_submission_failed() {
        let err = DeployError::from_client(
            "Portal",
            ClientError::Timeout {
                tx_hash: B256::ZERO,
                timeout: Duration::from_secs(30),
            },
        );
        assert!(matches!(err, DeployError::SubmissionFailed { ref step, .. } if step == "Portal"));
        assert_eq!(err.step(), Some("Portal"));
    }
}
