//! Contract group membership and runtime extension.
//!
//! A contract group (`namespace.ContractGroup`) is a set of addresses sharing
//! an event interface. Groups declared in configuration, or extended by a
//! handler, are gated: their events are only handled when the emitting
//! address is a member. Membership is append-only and, with a store
//! attached, survives restarts through [`ContractGroupRegistry::load`].

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use alloy_primitives::Address;
use tokio::sync::mpsc;

use crate::db::migrations::CONTRACT_GROUPS_TABLE;
use crate::db::{ColumnType, ColumnWrite, DbError, DbValue, Store, UpdatePolicy, UpsertRequest};

use super::event::{format_address, ChainId, Event};

/// A newly added group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRegistration {
    pub chain_id: ChainId,
    pub group: String,
    pub address: Address,
    /// Id of the event whose handler requested the registration
    pub registered_by: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Added,
    AlreadyRegistered,
}

type Members = HashMap<(ChainId, String), HashSet<Address>>;

#[derive(Default)]
pub struct ContractGroupRegistry {
    gated: RwLock<HashSet<String>>,
    members: RwLock<Members>,
    store: Option<Arc<dyn Store>>,
    notify: Option<mpsc::Sender<ContractRegistration>>,
}

impl ContractGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist every new member through `store`.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish every new member on `sender`.
    pub fn with_notifier(mut self, sender: mpsc::Sender<ContractRegistration>) -> Self {
        self.notify = Some(sender);
        self
    }

    /// Gate `group` on membership.
    pub fn declare(&self, group: &str) {
        let mut gated = self.gated.write().unwrap_or_else(|e| e.into_inner());
        gated.insert(group.to_string());
    }

    /// Seed members from configuration. Declares the group.
    pub fn seed<I>(&self, group: &str, chain_id: &str, addresses: I)
    where
        I: IntoIterator<Item = Address>,
    {
        self.declare(group);
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members
            .entry((chain_id.to_string(), group.to_string()))
            .or_default()
            .extend(addresses);
    }

    pub fn is_declared(&self, group: &str) -> bool {
        let gated = self.gated.read().unwrap_or_else(|e| e.into_inner());
        gated.contains(group)
    }

    pub fn contains(&self, chain_id: &str, group: &str, address: &Address) -> bool {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members
            .get(&(chain_id.to_string(), group.to_string()))
            .map(|set| set.contains(address))
            .unwrap_or(false)
    }

    pub fn member_count(&self, chain_id: &str, group: &str) -> usize {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members
            .get(&(chain_id.to_string(), group.to_string()))
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Whether `event` may be handled: its group is not gated, or the
    /// emitting contract is a member on the event's chain.
    pub fn admits(&self, event: &Event) -> bool {
        let Ok(name) = event.parsed_name() else {
            return true;
        };
        let group = name.group_path();
        !self.is_declared(&group)
            || self.contains(&event.origin.chain_id, &group, &event.origin.contract_address)
    }

    /// Restore members persisted by earlier runs. Declares every group found.
    /// Returns the number of members loaded.
    pub async fn load(&self) -> Result<usize, DbError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let rows = store
            .select_all(CONTRACT_GROUPS_TABLE, &["chain_id", "group_name", "address"])
            .await?;

        let mut loaded = 0;
        for row in rows {
            let text = |column: &str| row.get(column).and_then(DbValue::to_text);
            let (Some(chain_id), Some(group), Some(address)) =
                (text("chain_id"), text("group_name"), text("address"))
            else {
                tracing::warn!("Skipping incomplete row in {}", CONTRACT_GROUPS_TABLE);
                continue;
            };
            let Ok(address) = Address::from_str(&address) else {
                tracing::warn!(
                    "Skipping invalid address '{}' in group {} on chain {}",
                    address,
                    group,
                    chain_id
                );
                continue;
            };
            self.seed(&group, &chain_id, [address]);
            loaded += 1;
        }

        tracing::info!("Loaded {} contract group members from {}", loaded, CONTRACT_GROUPS_TABLE);
        Ok(loaded)
    }

    /// Add a member, persisting it first. Visible to [`admits`](Self::admits)
    /// once this returns `Ok`; a failed write leaves membership unchanged so a
    /// redelivered event retries it. Only new members are notified.
    pub async fn register(&self, registration: ContractRegistration) -> Result<RegistrationOutcome, DbError> {
        if self.contains(&registration.chain_id, &registration.group, &registration.address) {
            tracing::debug!(
                "Contract {} already in group {} on chain {}",
                registration.address,
                registration.group,
                registration.chain_id
            );
            return Ok(RegistrationOutcome::AlreadyRegistered);
        }

        if let Some(store) = &self.store {
            store.upsert(registration_row(&registration)).await?;
        }

        // Concurrent registrations of one address may all persist; only the
        // first to land here notifies.
        let added = {
            let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
            members
                .entry((registration.chain_id.clone(), registration.group.clone()))
                .or_default()
                .insert(registration.address)
        };
        if !added {
            return Ok(RegistrationOutcome::AlreadyRegistered);
        }

        self.declare(&registration.group);
        tracing::info!(
            "Added contract {} to group {} on chain {} (event {})",
            registration.address,
            registration.group,
            registration.chain_id,
            registration.registered_by
        );

        if let Some(sender) = &self.notify {
            if sender.send(registration).await.is_err() {
                tracing::debug!("Contract registration receiver dropped");
            }
        }

        Ok(RegistrationOutcome::Added)
    }
}

fn registration_row(registration: &ContractRegistration) -> UpsertRequest {
    let key = |column: &str, value: String| {
        ColumnWrite::new(column, DbValue::Text(value), ColumnType::Varchar, UpdatePolicy::Overwrite)
    };
    UpsertRequest {
        table: CONTRACT_GROUPS_TABLE.to_string(),
        conflict_columns: vec![
            "chain_id".to_string(),
            "group_name".to_string(),
            "address".to_string(),
        ],
        columns: vec![
            key("chain_id", registration.chain_id.clone()),
            key("group_name", registration.group.clone()),
            key("address", format_address(&registration.address)),
            ColumnWrite::new(
                "registered_by_event",
                DbValue::Text(registration.registered_by.clone()),
                ColumnType::Varchar,
                UpdatePolicy::InsertOnly,
            ),
            ColumnWrite::new(
                "block_number",
                DbValue::Int64(i64::try_from(registration.block_number).unwrap_or(i64::MAX)),
                ColumnType::BigInt,
                UpdatePolicy::InsertOnly,
            ),
        ],
        order_column: None,
    }
}
