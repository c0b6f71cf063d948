//! Capabilities a handler may suspend on: contract reads and metadata lookups.
//!
//! Both are injected through [`HandlerContext`](super::context::HandlerContext)
//! and may be wrapped in [`Retrying`] to retry transient failures.

use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy_primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::rpc::{with_retry, RetryConfig, Retryable};

use super::event::ChainId;

#[derive(Debug, Clone, Error)]
pub enum ExternalCallError {
    /// Worth retrying: timeouts, rate limits, unavailable upstreams.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help: reverts, bad input, missing capability.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl Retryable for ExternalCallError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExternalCallError::Transient(_))
    }
}

/// A read-only contract call.
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub chain_id: ChainId,
    pub address: Address,
    /// Input and output types, e.g. `"balanceOf(address)(uint256)"`.
    pub function: String,
    pub args: Vec<DynSolValue>,
    /// `None` reads at the latest block.
    pub block_number: Option<u64>,
}

impl ContractCall {
    pub fn new(chain_id: impl Into<ChainId>, address: Address, function: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            address,
            function: function.into(),
            args: Vec::new(),
            block_number: None,
        }
    }

    pub fn args(mut self, args: Vec<DynSolValue>) -> Self {
        self.args = args;
        self
    }

    pub fn at_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }
}

#[async_trait]
pub trait ContractCaller: Send + Sync {
    /// Execute the call and return the decoded output tuple.
    async fn call(&self, request: &ContractCall) -> Result<DynSolValue, ExternalCallError>;
}

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Fetch the JSON document a metadata URI points at.
    async fn resolve(&self, uri: &str) -> Result<Value, ExternalCallError>;
}

/// Wraps a capability with a bounded retry policy for transient failures.
pub struct Retrying<T: ?Sized> {
    inner: Arc<T>,
    retry: RetryConfig,
}

impl<T: ?Sized> Retrying<T> {
    pub fn new(inner: Arc<T>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl<T: ContractCaller + ?Sized> ContractCaller for Retrying<T> {
    async fn call(&self, request: &ContractCall) -> Result<DynSolValue, ExternalCallError> {
        let op_name = format!(
            "eth_call {} on {} (chain {})",
            request.function, request.address, request.chain_id
        );
        with_retry(&self.retry, &op_name, || self.inner.call(request)).await
    }
}

#[async_trait]
impl<T: MetadataResolver + ?Sized> MetadataResolver for Retrying<T> {
    async fn resolve(&self, uri: &str) -> Result<Value, ExternalCallError> {
        let op_name = format!("metadata {}", uri);
        with_retry(&self.retry, &op_name, || self.inner.resolve(uri)).await
    }
}
