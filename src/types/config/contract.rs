use std::collections::HashMap;

use alloy_primitives::Address;
use serde::Deserialize;

use crate::live_object::ChainId;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressOrAddresses {
    Single(Address),
    Multiple(Vec<Address>),
}

impl AddressOrAddresses {
    pub fn into_vec(self) -> Vec<Address> {
        match self {
            Self::Single(address) => vec![address],
            Self::Multiple(addresses) => addresses,
        }
    }
}

/// Seed members per contract group (`namespace.ContractGroup`), per chain id.
pub type ContractGroups = HashMap<String, HashMap<ChainId, AddressOrAddresses>>;

/// Whether `group` has the `namespace.ContractGroup` shape.
pub fn is_valid_group_name(group: &str) -> bool {
    match group.split_once('.') {
        Some((namespace, name)) => !namespace.is_empty() && !name.is_empty() && !name.contains('.'),
        None => false,
    }
}
