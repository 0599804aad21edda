//! Shared utilities for interacting with Ethereum JSON-RPC endpoints.

use std::{fmt, time::Duration};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between polling attempts when waiting for readiness.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// JSON-RPC error object returned by a node.
///
/// Carried inside the `anyhow::Error` of [`json_rpc_call`] so callers can
/// tell a node-side rejection from a transport failure with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponseError {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

impl RpcResponseError {
    /// Whether the node reported an EVM revert (code 3 or a "revert" message).
    pub fn is_revert(&self) -> bool {
        self.code == 3 || self.message.to_lowercase().contains("revert")
    }
}

impl fmt::Display for RpcResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcResponseError {}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result. An error response from the node is returned as a
/// [`RpcResponseError`] wrapped in the `anyhow::Error`.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url.clone())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let result: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(error) = result.get("error") {
        return Err(RpcResponseError {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            data: error.get("data").map(|d| match d {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
        .into());
    }

    let result_value = result
        .get("result")
        .context("No result in response")?
        .clone();

    serde_json::from_value(result_value)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Wait for an endpoint to be ready by repeatedly calling a check function.
///
/// # Arguments
/// * `name` - Name of the endpoint (for error messages)
/// * `timeout` - Maximum time to wait
/// * `check_fn` - Function that returns Ok(()) when the endpoint is ready
pub async fn wait_until_ready<F, Fut>(
    name: &str,
    timeout: Duration,
    check_fn: F,
) -> Result<(), anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>>,
{
    let start = std::time::Instant::now();

    loop {
        match check_fn().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if start.elapsed() > timeout {
                    return Err(e.context(format!("Timeout waiting for {} to be ready", name)));
                }
                tracing::trace!(error = %e, endpoint = %name, "Readiness check failed, retrying...");
            }
        }

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_detection() {
        let revert = RpcResponseError {
            code: 3,
            message: "execution reverted: Ownable: caller is not the owner".to_string(),
            data: Some("0x08c379a0".to_string()),
        };
        let gas = RpcResponseError {
            code: -32000,
            message: "insufficient funds for gas * price + value".to_string(),
            data: None,
        };
        let geth_style = RpcResponseError {
            code: -32000,
            message: "execution reverted".to_string(),
            data: None,
        };

        assert!(revert.is_revert());
        assert!(geth_style.is_revert());
        assert!(!gas.is_revert());
    }

    #[test]
    fn test_rpc_error_survives_anyhow() {
        let err: anyhow::Error = RpcResponseError {
            code: -32602,
            message: "invalid argument".to_string(),
            data: None,
        }
        .into();
        let err = err.context("Failed to estimate gas");

        let inner = err
            .downcast_ref::<RpcResponseError>()
            .expect("context keeps the typed error");
        assert_eq!(inner.code, -32602);
    }

    #[tokio::test]
    async fn test_wait_until_ready_returns_last_error_on_timeout() {
        let err = wait_until_ready("node", Duration::ZERO, || async {
            anyhow::bail!("connection refused")
        })
        .await
        .expect_err("never ready");
        assert!(format!("{err:#}").contains("connection refused"));
    }
}
