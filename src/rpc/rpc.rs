use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::network::Ethereum;
use alloy::primitives::{keccak256, Bytes};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{BlockId, TransactionRequest};
use async_trait::async_trait;
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use thiserror::Error;
use url::Url;

use crate::live_object::external::{ContractCall, ContractCaller, ExternalCallError};
use crate::live_object::ChainId;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("ABI error: {0}")]
    Abi(String),
}

/// Errors that know whether another attempt might succeed.
pub trait Retryable: fmt::Display {
    fn is_retryable(&self) -> bool;
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::RateLimitExceeded => true,
            RpcError::ProviderError(msg) => is_retryable_message(msg),
            // Reverts and undecodable output come back the same every time
            RpcError::Abi(_) => false,
        }
    }
}

/// Heuristic over provider error text for failures that are worth retrying.
pub fn is_retryable_message(msg: &str) -> bool {
    let msg_lower = msg.to_lowercase();
    // Network/connection errors
    msg_lower.contains("connection")
        || msg_lower.contains("timeout")
        || msg_lower.contains("timed out")
        || msg_lower.contains("reset")
        || msg_lower.contains("broken pipe")
        || msg_lower.contains("network")
        || msg_lower.contains("eof")
        || msg_lower.contains("sending request")
        // Rate limiting indicators
        || msg_lower.contains("rate limit")
        || msg_lower.contains("too many requests")
        || msg_lower.contains("429")
        // Server errors (5xx)
        || msg_lower.contains("502")
        || msg_lower.contains("503")
        || msg_lower.contains("504")
        || msg_lower.contains("internal server error")
        || msg_lower.contains("service unavailable")
        || msg_lower.contains("bad gateway")
        || msg_lower.contains("temporarily")
        || msg_lower.contains("try again")
}

impl From<RpcError> for ExternalCallError {
    fn from(e: RpcError) -> Self {
        if e.is_retryable() {
            ExternalCallError::Transient(e.to_string())
        } else {
            ExternalCallError::Permanent(e.to_string())
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        let delay = Duration::from_millis(delay_ms as u64);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Execute an async operation, retrying retryable failures with exponential
/// backoff until `config.max_retries` is exhausted.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            tracing::warn!(
                "Retry {}/{} for '{}' in {:?}",
                attempt,
                config.max_retries,
                operation_name,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!("'{}' succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                tracing::warn!(
                    "'{}' failed (attempt {}/{}): {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    e
                );
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(
                        "'{}' failed after {} attempts: {}",
                        operation_name,
                        attempt + 1,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

pub type StandardRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: NonZeroU32::MIN.saturating_add(9),
            jitter_min_ms: 5,
            jitter_max_ms: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: Url,
    pub rate_limit: Option<RateLimitConfig>,
}

impl RpcClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }
}

/// Rate-limited JSON-RPC client for a single chain.
///
/// Retries are left to the caller so one policy covers every capability.
pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    rate_limiter: Option<Arc<StandardRateLimiter>>,
    jitter: Option<Jitter>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Self {
        let provider = RootProvider::<Ethereum>::new_http(config.url.clone());

        let (rate_limiter, jitter) = if let Some(ref rate_config) = config.rate_limit {
            let quota = Quota::per_second(rate_config.requests_per_second);
            let limiter = RateLimiter::direct(quota);
            let jitter = Jitter::new(
                Duration::from_millis(rate_config.jitter_min_ms),
                Duration::from_millis(rate_config.jitter_max_ms),
            );
            (Some(Arc::new(limiter)), Some(jitter))
        } else {
            (None, None)
        };

        Self {
            provider,
            rate_limiter,
            jitter,
        }
    }

    async fn wait_for_rate_limit(&self) {
        if let (Some(limiter), Some(jitter)) = (&self.rate_limiter, &self.jitter) {
            limiter.until_ready_with_jitter(*jitter).await;
        }
    }

    /// Single `eth_call` at `block` (latest when `None`).
    pub async fn call(&self, tx: &TransactionRequest, block: Option<BlockId>) -> Result<Bytes, RpcError> {
        self.wait_for_rate_limit().await;
        self.provider
            .call(tx.clone())
            .block(block.unwrap_or(BlockId::latest()))
            .await
            .map_err(|e| RpcError::ProviderError(e.to_string()))
    }
}

/// [`ContractCaller`] over one [`RpcClient`] per chain.
pub struct RpcContractCaller {
    clients: HashMap<ChainId, RpcClient>,
}

impl RpcContractCaller {
    pub fn new(clients: HashMap<ChainId, RpcClient>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl ContractCaller for RpcContractCaller {
    async fn call(&self, request: &ContractCall) -> Result<DynSolValue, ExternalCallError> {
        let client = self.clients.get(&request.chain_id).ok_or_else(|| {
            ExternalCallError::Permanent(format!("no RPC endpoint for chain {}", request.chain_id))
        })?;

        let (selector, output_type) = parse_function_signature(&request.function)?;
        let calldata = encode_calldata(&selector, &request.args);

        let tx = TransactionRequest::default()
            .to(request.address)
            .input(calldata.into());
        let block = request.block_number.map(BlockId::number);

        let raw = client.call(&tx, block).await?;
        output_type
            .abi_decode(&raw)
            .map_err(|e| RpcError::Abi(format!("{}: {}", request.function, e)).into())
    }
}

/// Parse a function signature like `"balanceOf(address)(uint256)"` into its
/// selector and output tuple type.
pub fn parse_function_signature(sig: &str) -> Result<([u8; 4], DynSolType), RpcError> {
    let Some(idx) = sig.rfind(")(") else {
        return Err(RpcError::Abi(format!(
            "Invalid function signature, missing output type: {}",
            sig
        )));
    };
    let input_sig = &sig[..=idx];
    let output_sig = sig[idx + 2..].strip_suffix(')').ok_or_else(|| {
        RpcError::Abi(format!("Invalid function signature, unbalanced output: {}", sig))
    })?;

    let hash = keccak256(input_sig.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&hash[..4]);

    let output_type = DynSolType::parse(&format!("({})", output_sig)).map_err(|e| {
        RpcError::Abi(format!("Failed to parse output type '{}': {}", output_sig, e))
    })?;

    Ok((selector, output_type))
}

pub fn encode_calldata(selector: &[u8; 4], params: &[DynSolValue]) -> Vec<u8> {
    let mut calldata = selector.to_vec();
    if !params.is_empty() {
        let tuple = DynSolValue::Tuple(params.to_vec());
        calldata.extend(tuple.abi_encode_params());
    }
    calldata
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_for_attempt_is_capped() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300));
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(config.delay_for_attempt(8), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, RpcError> = with_retry(&RetryConfig::new(3), "flaky", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(RpcError::ProviderError("connection reset by peer".to_string()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_permanent_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), RpcError> = with_retry(&RetryConfig::new(3), "revert", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(RpcError::ProviderError("execution reverted".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), RpcError> = with_retry(&RetryConfig::new(2), "down", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(RpcError::Transport("503 service unavailable".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parse_function_signature() {
        let (selector, output) = parse_function_signature("balanceOf(address)(uint256)").unwrap();
        assert_eq!(hex::encode(selector), "70a08231");
        assert_eq!(output, DynSolType::Tuple(vec![DynSolType::Uint(256)]));
        assert!(parse_function_signature("balanceOf(address)").is_err());
    }

    #[test]
    fn test_rpc_error_maps_to_external_call_error() {
        let transient: ExternalCallError = RpcError::RateLimitExceeded.into();
        let permanent: ExternalCallError = RpcError::Abi("bad".to_string()).into();
        assert!(matches!(transient, ExternalCallError::Transient(_)));
        assert!(matches!(permanent, ExternalCallError::Permanent(_)));
    }
}
