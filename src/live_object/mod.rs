//! Live object runtime.
//!
//! Decoded contract events are resolved to handlers by the [`HandlerRegistry`],
//! run through the [`LifecycleManager`] (gate, instantiate, hydrate, handle,
//! save) and persisted as idempotent upserts. The [`LiveObjectEngine`] feeds
//! the lifecycle from a channel, keeping events for the same record in chain
//! order while unrelated records run in parallel.

pub mod context;
pub mod contract_groups;
pub mod engine;
pub mod error;
pub mod event;
pub mod external;
pub mod lifecycle;
pub mod objects;
pub mod record;
pub mod registry;
pub mod report;
pub mod schema;
pub mod traits;
pub mod upsert;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{Capabilities, HandlerContext};
pub use contract_groups::{ContractGroupRegistry, ContractRegistration, RegistrationOutcome};
pub use engine::{EngineConfig, EngineStats, EngineStatsSnapshot, EventsMessage, LiveObjectEngine, ShutdownMode};
pub use error::{CoercionError, ConfigError, HandlerError, LiveObjectError};
pub use event::{ChainId, Event, EventName, EventOrder, EventOrigin};
pub use external::{ContractCall, ContractCaller, ExternalCallError, MetadataResolver, Retrying};
pub use lifecycle::{LifecycleManager, LifecycleOutcome};
pub use record::RecordInstance;
pub use registry::{ChainRegistry, HandlerRegistry, RegistryBuilder};
pub use report::{FailureReport, FailureReporter, TracingReporter};
pub use schema::{EntityDefinition, PropertyDef, PropertyType};
pub use traits::LiveObjectHandler;
pub use upsert::UpsertEngine;
