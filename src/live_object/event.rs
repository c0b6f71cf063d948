//! Decoded contract events and fully qualified event names.

use std::fmt;

use alloy_primitives::{keccak256, Address, B256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{ConfigError, HandlerError};

/// Chain identifier as it appears on events and stored rows (e.g. `"1"`).
pub type ChainId = String;

/// One decoded contract log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    /// Fully qualified name, e.g. `eth.contracts.allo.Registry.ProjectCreated@0.0.1`.
    pub name: String,
    pub origin: EventOrigin,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOrigin {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_hash: B256,
    /// Unix seconds
    pub block_timestamp: u64,
    pub contract_address: Address,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    /// Topic 0 of the log (or the ABI event signature it hashes from).
    pub signature: String,
}

/// Position of an event in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventOrder {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl fmt::Display for EventOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

impl Event {
    pub fn order(&self) -> EventOrder {
        EventOrder {
            block_number: self.origin.block_number,
            transaction_index: self.origin.transaction_index,
            log_index: self.origin.log_index,
        }
    }

    pub fn parsed_name(&self) -> Result<EventName, ConfigError> {
        EventName::parse(&self.name)
    }

    /// Normalized topic hash of this event.
    pub fn signature(&self) -> String {
        normalize_signature(&self.origin.signature)
    }

    /// Get a data field by name. Dotted paths descend into nested objects
    /// (`"params.amount"`).
    pub fn get(&self, name: &str) -> Result<&Value, HandlerError> {
        self.try_get(name)
            .ok_or_else(|| HandlerError::MissingField(format!("{} (event {})", name, self.id)))
    }

    pub fn try_get(&self, name: &str) -> Option<&Value> {
        let mut parts = name.split('.');
        let first = parts.next()?;
        let mut current = self.data.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Data field as a string; numbers are rendered in decimal.
    pub fn get_string(&self, name: &str) -> Result<String, HandlerError> {
        match self.get(name)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(HandlerError::TypeConversion(format!(
                "{} is not a string: {}",
                name, other
            ))),
        }
    }

    pub fn get_address(&self, name: &str) -> Result<Address, HandlerError> {
        let raw = self.get_string(name)?;
        raw.parse::<Address>().map_err(|e| {
            HandlerError::TypeConversion(format!("{} is not an address ({}): {}", name, raw, e))
        })
    }

    pub fn contract_address_hex(&self) -> String {
        format_address(&self.origin.contract_address)
    }
}

/// A parsed event name.
///
/// ```text
/// namespace.ContractGroup.EventName                       (chain-agnostic)
/// <chain>.contracts.namespace.ContractGroup.EventName     (chain-specific)
/// ```
/// Either form may carry an `@suffix` (a version on incoming events, a
/// signature on handler bindings).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventName {
    pub chain_prefix: Option<String>,
    pub namespace: String,
    pub contract_group: String,
    pub event: String,
    pub suffix: Option<String>,
}

impl EventName {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEventName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let (path, suffix) = match name.split_once('@') {
            Some((_, suffix)) if suffix.is_empty() => {
                return Err(invalid("empty '@' suffix"));
            }
            Some((path, suffix)) => (path, Some(suffix.to_string())),
            None => (name, None),
        };

        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty name segment"));
        }

        match parts.as_slice() {
            [namespace, group, event] => Ok(Self {
                chain_prefix: None,
                namespace: namespace.to_string(),
                contract_group: group.to_string(),
                event: event.to_string(),
                suffix,
            }),
            [chain, "contracts", namespace, group, event] => Ok(Self {
                chain_prefix: Some(chain.to_string()),
                namespace: namespace.to_string(),
                contract_group: group.to_string(),
                event: event.to_string(),
                suffix,
            }),
            _ => Err(invalid(
                "expected 'namespace.ContractGroup.EventName' or \
                 '<chain>.contracts.namespace.ContractGroup.EventName'",
            )),
        }
    }

    /// `namespace.ContractGroup`, the key contract groups are configured under.
    pub fn group_path(&self) -> String {
        format!("{}.{}", self.namespace, self.contract_group)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(chain) = &self.chain_prefix {
            write!(f, "{}.contracts.", chain)?;
        }
        write!(f, "{}.{}.{}", self.namespace, self.contract_group, self.event)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "@{}", suffix)?;
        }
        Ok(())
    }
}

/// Normalize an event signature to a lowercase 0x topic hash.
///
/// Accepts either a topic hash (`0xddf2...`) or an ABI event signature
/// (`Transfer(address,address,uint256)`), which is hashed with keccak256.
pub fn normalize_signature(signature: &str) -> String {
    let signature = signature.trim();
    if signature.starts_with("0x") || signature.starts_with("0X") {
        format!("0x{}", signature[2..].to_lowercase())
    } else {
        format!("0x{}", hex::encode(keccak256(signature.as_bytes()).as_slice()))
    }
}

/// Lowercase 0x hex form used for addresses in storage and lookups.
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}
