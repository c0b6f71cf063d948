use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::live_object::registry::ChainRegistry;
use crate::live_object::ChainId;

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Prefix used in chain-specific event names (`<name>.contracts.…`).
    pub name: String,
    #[serde(deserialize_with = "deserialize_chain_id")]
    pub chain_id: ChainId,
    /// Env var holding the JSON-RPC endpoint used for contract reads.
    #[serde(default)]
    pub rpc_url_env_var: Option<String>,
}

/// Accept `"1"` or `1`.
///
/// Goes through `Value` rather than an untagged enum: untagged buffering
/// cannot see numbers under serde_json's `arbitrary_precision`.
pub fn deserialize_chain_id<'de, D>(deserializer: D) -> Result<ChainId, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) if n.is_u64() => Ok(n.to_string()),
        Value::String(s) => Ok(s.trim().to_string()),
        other => Err(D::Error::custom(format!(
            "expected a chain id as a non-negative integer or string, got {}",
            other
        ))),
    }
}

pub fn build_chain_registry(chains: &[ChainConfig]) -> ChainRegistry {
    let mut registry = ChainRegistry::new();
    for chain in chains {
        registry.insert(chain.name.clone(), chain.chain_id.clone());
    }
    registry
}
