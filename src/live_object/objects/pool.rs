//! Uniswap V3 pools.
//!
//! Pools are discovered from factory `PoolCreated` events, which add each new
//! pool to the `uniswap.Pool` contract group. `Swap` events are only handled
//! for pools registered that way.

use std::sync::Arc;

use alloy::dyn_abi::DynSolValue;
use alloy_primitives::Address;
use async_trait::async_trait;

use crate::live_object::context::HandlerContext;
use crate::live_object::error::{ConfigError, HandlerError};
use crate::live_object::event::{format_address, Event};
use crate::live_object::external::ExternalCallError;
use crate::live_object::record::RecordInstance;
use crate::live_object::registry::RegistryBuilder;
use crate::live_object::schema::{EntityDefinition, PropertyDef, PropertyType};
use crate::live_object::traits::LiveObjectHandler;

pub const ENTITY: &str = "Pool";
pub const TABLE: &str = "uniswap.pools";
pub const POOL_GROUP: &str = "uniswap.Pool";

pub const POOL_CREATED_SIGNATURE: &str = "PoolCreated(address,address,uint24,int24,address)";
pub const SWAP_SIGNATURE: &str = "Swap(address,address,int256,int256,uint160,uint128,int24)";

pub fn definition() -> Result<EntityDefinition, ConfigError> {
    EntityDefinition::builder(ENTITY, TABLE)
        .property(PropertyDef::new("address", PropertyType::Address))
        .property(PropertyDef::new("token0", PropertyType::Address).can_update(false))
        .property(PropertyDef::new("token1", PropertyType::Address).can_update(false))
        .property(PropertyDef::new("token0Symbol", PropertyType::String))
        .property(PropertyDef::new("token1Symbol", PropertyType::String))
        .property(PropertyDef::new("fee", PropertyType::Number).can_update(false))
        .property(PropertyDef::new("tickSpacing", PropertyType::Number).can_update(false))
        .property(PropertyDef::new("createdAt", PropertyType::Timestamp).can_update(false))
        .property(PropertyDef::new("sqrtPriceX96", PropertyType::BigInt))
        .property(PropertyDef::new("liquidity", PropertyType::BigInt))
        .property(PropertyDef::new("tick", PropertyType::Number))
        .property(PropertyDef::new("lastSwapAt", PropertyType::Timestamp))
        .unique_by(["address", "chainId"])
        .chains(["1", "10", "8453", "42161"])
        .build()
}

fn pool_key(event: &Event, pool: &Address) -> String {
    format!("{}:{}", event.origin.chain_id, format_address(pool))
}

/// Single string out of a call result, unwrapping a one-element tuple.
fn as_single_string(value: DynSolValue) -> Option<String> {
    match value {
        DynSolValue::String(s) => Some(s),
        DynSolValue::Tuple(mut values) if values.len() == 1 => as_single_string(values.remove(0)),
        _ => None,
    }
}

/// Token symbol, or `None` when the token has no readable `symbol()`.
async fn token_symbol(ctx: &HandlerContext, token: Address) -> Result<Option<String>, HandlerError> {
    match ctx.call_contract(token, "symbol()(string)", vec![]).await {
        Ok(value) => Ok(as_single_string(value)),
        Err(HandlerError::ExternalCall(ExternalCallError::Permanent(reason))) => {
            tracing::warn!("symbol() failed for token {}: {}", format_address(&token), reason);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub struct PoolCreatedHandler;

#[async_trait]
impl LiveObjectHandler for PoolCreatedHandler {
    fn name(&self) -> &'static str {
        "PoolCreatedHandler"
    }

    fn ordering_key(&self, event: &Event) -> Option<String> {
        event.get_address("pool").ok().map(|pool| pool_key(event, &pool))
    }

    async fn handle(
        &self,
        event: &Event,
        record: &mut RecordInstance,
        ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        let pool = event.get_address("pool")?;
        let token0 = event.get_address("token0")?;
        let token1 = event.get_address("token1")?;
        let timestamp = record.base().block_timestamp;

        record.set("address", format_address(&pool))?;
        record.set("token0", format_address(&token0))?;
        record.set("token1", format_address(&token1))?;
        record.set("fee", event.get("fee")?.clone())?;
        record.set("tickSpacing", event.get("tickSpacing")?.clone())?;
        record.set("createdAt", timestamp)?;

        if ctx.has_contract_caller() {
            if let Some(symbol) = token_symbol(ctx, token0).await? {
                record.set("token0Symbol", symbol)?;
            }
            if let Some(symbol) = token_symbol(ctx, token1).await? {
                record.set("token1Symbol", symbol)?;
            }
        }

        ctx.add_contract_to_group(POOL_GROUP, pool)?;
        Ok(())
    }
}

pub struct SwapHandler;

#[async_trait]
impl LiveObjectHandler for SwapHandler {
    fn name(&self) -> &'static str {
        "SwapHandler"
    }

    fn ordering_key(&self, event: &Event) -> Option<String> {
        Some(pool_key(event, &event.origin.contract_address))
    }

    async fn handle(
        &self,
        event: &Event,
        record: &mut RecordInstance,
        _ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        let timestamp = record.base().block_timestamp;

        record.set("address", event.contract_address_hex())?;
        record.set("sqrtPriceX96", event.get("sqrtPriceX96")?.clone())?;
        record.set("liquidity", event.get("liquidity")?.clone())?;
        record.set("tick", event.get("tick")?.clone())?;
        record.set("lastSwapAt", timestamp)?;
        Ok(())
    }
}

pub fn register(builder: &mut RegistryBuilder) -> Result<(), ConfigError> {
    builder.entity(definition()?)?;
    builder
        .on_event(
            ENTITY,
            &format!("uniswap.Factory.PoolCreated@{}", POOL_CREATED_SIGNATURE),
            Arc::new(PoolCreatedHandler),
        )?
        .on_event(
            ENTITY,
            &format!("uniswap.Pool.Swap@{}", SWAP_SIGNATURE),
            Arc::new(SwapHandler),
        )?
        .extends_contract_group(POOL_GROUP);
    Ok(())
}
