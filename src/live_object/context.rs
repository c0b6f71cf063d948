//! Handler context: chain info and injected capabilities.
//!
//! A fresh [`HandlerContext`] is built for every handler invocation. It
//! carries no global state; everything a handler may reach outside its
//! record goes through here.

use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy_primitives::Address;
use serde_json::Value;

use super::error::HandlerError;
use super::event::{ChainId, Event};
use super::external::{ContractCall, ContractCaller, ExternalCallError, MetadataResolver};

/// Capabilities shared by every invocation.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub contract_caller: Option<Arc<dyn ContractCaller>>,
    pub metadata_resolver: Option<Arc<dyn MetadataResolver>>,
}

impl Capabilities {
    pub fn with_contract_caller(mut self, caller: Arc<dyn ContractCaller>) -> Self {
        self.contract_caller = Some(caller);
        self
    }

    pub fn with_metadata_resolver(mut self, resolver: Arc<dyn MetadataResolver>) -> Self {
        self.metadata_resolver = Some(resolver);
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("contract_caller", &self.contract_caller.is_some())
            .field("metadata_resolver", &self.metadata_resolver.is_some())
            .finish()
    }
}

/// A contract address a handler asked to add to a contract group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRequest {
    /// `namespace.ContractGroup`
    pub group: String,
    pub address: Address,
}

pub struct HandlerContext {
    chain_id: ChainId,
    chain_name: Option<String>,
    block_number: u64,
    capabilities: Capabilities,
    group_requests: Vec<GroupRequest>,
}

impl HandlerContext {
    pub fn new(event: &Event, chain_name: Option<String>, capabilities: Capabilities) -> Self {
        Self {
            chain_id: event.origin.chain_id.clone(),
            chain_name,
            block_number: event.origin.block_number,
            capabilities,
            group_requests: Vec::new(),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Configured name of the event's chain (e.g. `eth`), if known.
    pub fn chain_name(&self) -> Option<&str> {
        self.chain_name.as_deref()
    }

    /// Ask for `address` to be added to `group` (`namespace.ContractGroup`)
    /// on this event's chain. Applied once the record has been handled.
    pub fn add_contract_to_group(&mut self, group: &str, address: Address) -> Result<(), HandlerError> {
        if !is_group_path(group) {
            return Err(HandlerError::failed(format!(
                "invalid contract group '{}': expected 'namespace.ContractGroup'",
                group
            )));
        }
        self.group_requests.push(GroupRequest {
            group: group.to_string(),
            address,
        });
        Ok(())
    }

    pub(crate) fn take_group_requests(&mut self) -> Vec<GroupRequest> {
        std::mem::take(&mut self.group_requests)
    }

    /// Read a contract on this event's chain at this event's block.
    pub async fn call_contract(
        &self,
        address: Address,
        function: &str,
        args: Vec<DynSolValue>,
    ) -> Result<DynSolValue, HandlerError> {
        let request = ContractCall::new(self.chain_id.clone(), address, function)
            .args(args)
            .at_block(self.block_number);
        self.call(&request).await
    }

    pub async fn call(&self, request: &ContractCall) -> Result<DynSolValue, HandlerError> {
        let caller = self.capabilities.contract_caller.as_ref().ok_or_else(|| {
            ExternalCallError::Permanent("no contract caller configured".to_string())
        })?;
        Ok(caller.call(request).await?)
    }

    pub async fn resolve_metadata(&self, uri: &str) -> Result<Value, HandlerError> {
        let resolver = self.capabilities.metadata_resolver.as_ref().ok_or_else(|| {
            ExternalCallError::Permanent("no metadata resolver configured".to_string())
        })?;
        Ok(resolver.resolve(uri).await?)
    }

    pub fn has_contract_caller(&self) -> bool {
        self.capabilities.contract_caller.is_some()
    }

    pub fn has_metadata_resolver(&self) -> bool {
        self.capabilities.metadata_resolver.is_some()
    }
}

fn is_group_path(group: &str) -> bool {
    let mut parts = group.split('.');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_object::testing::{sample_event, ScriptedCaller};
    use alloy_primitives::U256;

    #[test]
    fn test_group_requests_are_buffered() {
        let event = sample_event("uniswap.Factory.PoolCreated", "1", 5);
        let mut ctx = HandlerContext::new(&event, Some("eth".into()), Capabilities::default());

        ctx.add_contract_to_group("uniswap.Pool", Address::repeat_byte(0x11)).unwrap();
        assert!(ctx.add_contract_to_group("Pool", Address::ZERO).is_err());

        let requests = ctx.take_group_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].group, "uniswap.Pool");
        assert!(ctx.take_group_requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_capability_is_permanent_error() {
        let event = sample_event("allo.Registry.ProjectCreated", "1", 5);
        let ctx = HandlerContext::new(&event, None, Capabilities::default());

        let err = ctx.resolve_metadata("ipfs://x").await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::ExternalCall(ExternalCallError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_call_contract_uses_event_chain_and_block() {
        let caller = Arc::new(ScriptedCaller::new(vec![Ok(DynSolValue::Uint(U256::from(1u64), 256))]));
        let event = sample_event("allo.Registry.ProjectCreated", "10", 77);
        let ctx = HandlerContext::new(
            &event,
            None,
            Capabilities::default().with_contract_caller(caller.clone()),
        );

        ctx.call_contract(Address::ZERO, "fee()(uint24)", vec![]).await.unwrap();

        let seen = caller.requests();
        assert_eq!(seen[0].chain_id, "10");
        assert_eq!(seen[0].block_number, Some(77));
    }
}
