//! Wire layout of messaging configuration values.
//!
//! Payloads are decoded on-chain with `abi.decode(config, (UlnConfig))` and
//! `abi.decode(config, (ExecutorConfig))`, so both are standard ABI encodings of
//! a single struct value: every field occupies a 32-byte word, and the security
//! stack, being dynamic, is preceded by its offset.

use alloy_core::primitives::{Address, Bytes};
use alloy_sol_types::{SolCall, SolType, sol};

use crate::messaging::{ConfigParam, ExecutorLimitsConfig, SecurityStackConfig};

sol! {
    /// Verifier quorum read by the message library.
    #[derive(Debug, PartialEq, Eq)]
    struct UlnConfig {
        uint64 confirmations;
        uint8 requiredDVNCount;
        uint8 optionalDVNCount;
        uint8 optionalDVNThreshold;
        address[] requiredDVNs;
        address[] optionalDVNs;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct ExecutorConfig {
        uint32 maxMessageSize;
        address executor;
    }

    /// Library management surface of the messaging endpoint.
    interface IMessageLibManager {
        #[derive(Debug, PartialEq, Eq)]
        struct SetConfigParam {
            uint32 eid;
            uint32 configType;
            bytes config;
        }

        function setSendLibrary(address oapp, uint32 eid, address newLib) external;
        function setReceiveLibrary(address oapp, uint32 eid, address newLib, uint256 gracePeriod) external;
        function setConfig(address oapp, address lib, SetConfigParam[] params) external;

        function getSendLibrary(address sender, uint32 eid) external view returns (address lib);
        function isDefaultSendLibrary(address sender, uint32 eid) external view returns (bool);
        function getReceiveLibrary(address receiver, uint32 eid) external view returns (address lib, bool isDefault);
    }
}

pub use IMessageLibManager::SetConfigParam;

fn count(verifiers: &[Address]) -> u8 {
    u8::try_from(verifiers.len()).unwrap_or(u8::MAX)
}

/// Encode a verifier quorum. The required count is the length of the required list.
pub fn encode_security_stack(config: &SecurityStackConfig) -> Bytes {
    let value = UlnConfig {
        confirmations: config.confirmations,
        requiredDVNCount: count(&config.required_verifiers),
        optionalDVNCount: count(&config.optional_verifiers),
        optionalDVNThreshold: config.optional_threshold,
        requiredDVNs: config.required_verifiers.clone(),
        optionalDVNs: config.optional_verifiers.clone(),
    };
    <UlnConfig as SolType>::abi_encode(&value).into()
}

/// Decode a verifier quorum, rejecting payloads whose counts disagree with their lists.
pub fn decode_security_stack(payload: &[u8]) -> Result<SecurityStackConfig, alloy_sol_types::Error> {
    let value = <UlnConfig as SolType>::abi_decode(payload)?;
    if usize::from(value.requiredDVNCount) != value.requiredDVNs.len()
        || usize::from(value.optionalDVNCount) != value.optionalDVNs.len()
    {
        return Err(alloy_sol_types::Error::custom(
            "verifier count does not match verifier list",
        ));
    }

    Ok(SecurityStackConfig {
        confirmations: value.confirmations,
        required_verifiers: value.requiredDVNs,
        optional_verifiers: value.optionalDVNs,
        optional_threshold: value.optionalDVNThreshold,
    })
}

pub fn encode_executor_limits(config: &ExecutorLimitsConfig) -> Bytes {
    let value = ExecutorConfig {
        maxMessageSize: config.max_message_size,
        executor: config.executor,
    };
    <ExecutorConfig as SolType>::abi_encode(&value).into()
}

pub fn decode_executor_limits(payload: &[u8]) -> Result<ExecutorLimitsConfig, alloy_sol_types::Error> {
    let value = <ExecutorConfig as SolType>::abi_decode(payload)?;
    Ok(ExecutorLimitsConfig {
        max_message_size: value.maxMessageSize,
        executor: value.executor,
    })
}

/// Calldata of one batched `setConfig` call.
pub fn encode_set_config(oapp: Address, library: Address, params: &[ConfigParam]) -> Bytes {
    IMessageLibManager::setConfigCall {
        oapp,
        lib: library,
        params: params.iter().map(SetConfigParam::from).collect(),
    }
    .abi_encode()
    .into()
}

impl From<&ConfigParam> for SetConfigParam {
    fn from(param: &ConfigParam) -> Self {
        Self {
            eid: param.remote_eid,
            configType: param.config_type as u32,
            config: param.payload.clone(),
        }
    }
}
