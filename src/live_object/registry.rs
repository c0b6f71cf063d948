//! Handler registry.
//!
//! Bindings are registered through a [`RegistryBuilder`] at startup and frozen
//! into an immutable [`HandlerRegistry`], shared by reference during dispatch.
//!
//! Each binding sits at one specificity tier:
//!
//! | pattern                                              | matches                           |
//! |------------------------------------------------------|-----------------------------------|
//! | `allo.Registry.ProjectCreated`                       | any chain in the entity's set     |
//! | `eth.contracts.allo.Registry.ProjectCreated`         | only the chain `eth` resolves to  |
//! | either form `@ProjectCreated(uint256,address)`       | additionally only that signature  |
//!
//! For each entity, resolution picks the most specific binding that matches;
//! several entities may react to the same event.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::error::ConfigError;
use super::event::{normalize_signature, ChainId, Event, EventName};
use super::schema::EntityDefinition;
use super::traits::LiveObjectHandler;

/// Maps chain prefixes used in event names to chain ids.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    by_name: HashMap<String, ChainId>,
    names: HashMap<ChainId, String>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, name: impl Into<String>, chain_id: impl Into<ChainId>) -> Self {
        self.insert(name, chain_id);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, chain_id: impl Into<ChainId>) {
        let name = name.into();
        let chain_id = chain_id.into();
        self.names.insert(chain_id.clone(), name.clone());
        self.by_name.insert(name, chain_id);
    }

    /// Resolve a prefix given either as a configured name or as a chain id.
    pub fn resolve_prefix(&self, prefix: &str) -> Option<&ChainId> {
        self.by_name
            .get(prefix)
            .or_else(|| self.names.get_key_value(prefix).map(|(id, _)| id))
    }

    pub fn name_of(&self, chain_id: &str) -> Option<&str> {
        self.names.get(chain_id).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    ChainAgnostic,
    ChainSpecific,
    SignatureChainAgnostic,
    SignatureChainSpecific,
}

impl Tier {
    fn of(key: &BindingKey) -> Self {
        match (&key.chain, &key.signature) {
            (None, None) => Tier::ChainAgnostic,
            (Some(_), None) => Tier::ChainSpecific,
            (None, Some(_)) => Tier::SignatureChainAgnostic,
            (Some(_), Some(_)) => Tier::SignatureChainSpecific,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::ChainAgnostic => "chain-agnostic",
            Tier::ChainSpecific => "chain-specific",
            Tier::SignatureChainAgnostic => "signature-qualified chain-agnostic",
            Tier::SignatureChainSpecific => "signature-qualified chain-specific",
        };
        f.write_str(s)
    }
}

/// `namespace.ContractGroup.EventName`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EventPath {
    namespace: String,
    contract_group: String,
    event: String,
}

impl From<&EventName> for EventPath {
    fn from(name: &EventName) -> Self {
        Self {
            namespace: name.namespace.clone(),
            contract_group: name.contract_group.clone(),
            event: name.event.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    chain: Option<ChainId>,
    signature: Option<String>,
}

/// A handler bound to an event pattern for one entity.
pub struct Binding {
    entity: Arc<EntityDefinition>,
    handler: Arc<dyn LiveObjectHandler>,
    pattern: String,
    tier: Tier,
}

impl Binding {
    pub fn entity(&self) -> &Arc<EntityDefinition> {
        &self.entity
    }

    pub fn handler(&self) -> &Arc<dyn LiveObjectHandler> {
        &self.handler
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// `Entity::handler_name`, used in logs and failure reports.
    pub fn identity(&self) -> String {
        format!("{}::{}", self.entity.name(), self.handler.name())
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("identity", &self.identity())
            .field("pattern", &self.pattern)
            .field("tier", &self.tier)
            .finish()
    }
}

/// Bindings for one event path, keyed by chain and signature qualifier.
type PathBindings = HashMap<BindingKey, Arc<Binding>>;

pub struct RegistryBuilder {
    chains: ChainRegistry,
    chain_overrides: HashMap<String, Vec<ChainId>>,
    entities: HashMap<String, Arc<EntityDefinition>>,
    /// Entity names in registration order.
    entity_order: Vec<String>,
    bindings: HashMap<EventPath, PathBindings>,
    extended_groups: HashSet<String>,
}

impl RegistryBuilder {
    pub fn new(chains: ChainRegistry) -> Self {
        Self {
            chains,
            chain_overrides: HashMap::new(),
            entities: HashMap::new(),
            entity_order: Vec::new(),
            bindings: HashMap::new(),
            extended_groups: HashSet::new(),
        }
    }

    /// Replace the built-in chain set of an entity. Applied when the entity is
    /// registered; overrides for entities never registered fail [`build`](Self::build).
    pub fn with_chain_overrides(mut self, overrides: HashMap<String, Vec<ChainId>>) -> Self {
        self.chain_overrides = overrides;
        self
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    pub fn entity(&mut self, definition: EntityDefinition) -> Result<Arc<EntityDefinition>, ConfigError> {
        let name = definition.name().to_string();
        if self.entities.contains_key(&name) {
            return Err(ConfigError::DuplicateEntity(name));
        }

        let definition = match self.chain_overrides.get(&name) {
            Some(chains) => definition.with_chains(chains.iter().cloned()),
            None => definition,
        };

        let definition = Arc::new(definition);
        self.entities.insert(name.clone(), definition.clone());
        self.entity_order.push(name.clone());
        tracing::info!(
            "Registered live object {} (table {}, uniqueBy {:?})",
            name,
            definition.table(),
            definition.unique_by()
        );
        Ok(definition)
    }

    /// Bind `handler` to `pattern` for a registered entity.
    ///
    /// `pattern` is an event name in either form, optionally followed by
    /// `@<signature>` (topic hash or ABI event signature).
    pub fn on_event(
        &mut self,
        entity: &str,
        pattern: &str,
        handler: Arc<dyn LiveObjectHandler>,
    ) -> Result<&mut Self, ConfigError> {
        let definition = self
            .entities
            .get(entity)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEntity(entity.to_string()))?;

        let name = EventName::parse(pattern)?;
        let chain = match &name.chain_prefix {
            Some(prefix) => Some(self.chains.resolve_prefix(prefix).cloned().ok_or_else(|| {
                ConfigError::UnknownChainPrefix {
                    prefix: prefix.clone(),
                    pattern: pattern.to_string(),
                }
            })?),
            None => None,
        };

        if let Some(chain) = &chain {
            if !definition.supports_chain(chain) {
                tracing::warn!(
                    "Binding '{}' for {} targets chain {} outside the entity's chain set; it will never match",
                    pattern,
                    entity,
                    chain
                );
            }
        }

        let key = BindingKey {
            chain,
            signature: name.suffix.as_deref().map(normalize_signature),
        };
        let tier = Tier::of(&key);

        // One handler per resolved key, whichever entity it belongs to.
        let slot = self.bindings.entry(EventPath::from(&name)).or_default();
        if let Some(existing) = slot.get(&key) {
            return Err(ConfigError::DuplicateBinding {
                entity: entity.to_string(),
                pattern: pattern.to_string(),
                existing: existing.identity(),
            });
        }

        let binding = Arc::new(Binding {
            entity: definition,
            handler,
            pattern: pattern.to_string(),
            tier,
        });
        tracing::debug!("Bound {} to '{}' ({})", binding.identity(), pattern, tier);
        slot.insert(key, binding);
        Ok(self)
    }

    /// Declare that handlers add contracts to `group` at runtime, so events
    /// from that group are gated on membership.
    pub fn extends_contract_group(&mut self, group: impl Into<String>) -> &mut Self {
        self.extended_groups.insert(group.into());
        self
    }

    pub fn build(self) -> Result<HandlerRegistry, ConfigError> {
        if let Some(unknown) = self
            .chain_overrides
            .keys()
            .find(|name| !self.entities.contains_key(*name))
        {
            return Err(ConfigError::UnknownEntity(unknown.clone()));
        }

        let binding_count: usize = self.bindings.values().map(HashMap::len).sum();
        tracing::info!(
            "Handler registry built: {} live objects, {} bindings",
            self.entities.len(),
            binding_count
        );

        Ok(HandlerRegistry {
            chains: self.chains,
            entities: self.entities,
            entity_order: self.entity_order,
            bindings: self.bindings,
            extended_groups: self.extended_groups,
        })
    }
}

/// Immutable binding table.
pub struct HandlerRegistry {
    chains: ChainRegistry,
    entities: HashMap<String, Arc<EntityDefinition>>,
    entity_order: Vec<String>,
    bindings: HashMap<EventPath, PathBindings>,
    extended_groups: HashSet<String>,
}

impl HandlerRegistry {
    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    pub fn entity(&self, name: &str) -> Option<&Arc<EntityDefinition>> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDefinition>> {
        self.entity_order.iter().filter_map(|name| self.entities.get(name))
    }

    pub fn extended_groups(&self) -> &HashSet<String> {
        &self.extended_groups
    }

    /// The single most specific binding for `event` whose entity tracks the
    /// event's chain. `None` is a dispatch miss.
    pub fn resolve(&self, event: &Event) -> Option<Arc<Binding>> {
        let Ok(name) = event.parsed_name() else {
            tracing::debug!("Ignoring event {} with unparseable name '{}'", event.id, event.name);
            return None;
        };
        let slots = self.bindings.get(&EventPath::from(&name))?;

        let chain = &event.origin.chain_id;
        let signature = event.signature();
        let candidates = [
            BindingKey {
                chain: Some(chain.clone()),
                signature: Some(signature.clone()),
            },
            BindingKey {
                chain: None,
                signature: Some(signature),
            },
            BindingKey {
                chain: Some(chain.clone()),
                signature: None,
            },
            BindingKey {
                chain: None,
                signature: None,
            },
        ];

        candidates
            .iter()
            .filter_map(|key| slots.get(key))
            .find(|binding| binding.entity.supports_chain(chain))
            .cloned()
    }
}
