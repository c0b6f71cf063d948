//! Instance lifecycle: gate, instantiate, hydrate, handle, save, extend.

use std::sync::Arc;

use crate::db::UpsertOutcome;

use super::context::{Capabilities, HandlerContext};
use super::contract_groups::{ContractGroupRegistry, ContractRegistration};
use super::error::LiveObjectError;
use super::event::Event;
use super::record::RecordInstance;
use super::registry::{Binding, HandlerRegistry};
use super::report::{FailureReport, FailureReporter};
use super::upsert::UpsertEngine;

/// What happened to one event at its resolved binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Persisted(UpsertOutcome),
    /// Handler left a uniqueBy property unset; nothing was written.
    Discarded { missing: String },
    /// Emitting contract is not (yet) a member of a gated contract group.
    Gated,
    /// Reported to the failure reporter.
    Failed,
}

pub struct LifecycleManager {
    registry: Arc<HandlerRegistry>,
    upsert: UpsertEngine,
    groups: Arc<ContractGroupRegistry>,
    capabilities: Capabilities,
    reporter: Arc<dyn FailureReporter>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        upsert: UpsertEngine,
        groups: Arc<ContractGroupRegistry>,
        capabilities: Capabilities,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            registry,
            upsert,
            groups,
            capabilities,
            reporter,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn contract_groups(&self) -> &Arc<ContractGroupRegistry> {
        &self.groups
    }

    /// Resolve the handler for `event` and run it. `None` on a dispatch miss.
    pub async fn handle_event(&self, event: &Event) -> Option<LifecycleOutcome> {
        let Some(binding) = self.registry.resolve(event) else {
            tracing::debug!("No handler for {} ({})", event.name, event.id);
            return None;
        };
        Some(self.run_binding(event, &binding).await)
    }

    /// Run one resolved binding. Failures are reported, never returned.
    pub async fn run_binding(&self, event: &Event, binding: &Binding) -> LifecycleOutcome {
        match self.try_run_binding(event, binding).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.reporter
                    .report(FailureReport::new(event, binding.identity(), &e));
                LifecycleOutcome::Failed
            }
        }
    }

    async fn try_run_binding(
        &self,
        event: &Event,
        binding: &Binding,
    ) -> Result<LifecycleOutcome, LiveObjectError> {
        if !self.groups.admits(event) {
            tracing::debug!(
                "Dropping {} ({}): contract {} not in its contract group on chain {}",
                event.name,
                event.id,
                event.contract_address_hex(),
                event.origin.chain_id
            );
            return Ok(LifecycleOutcome::Gated);
        }

        let mut record = RecordInstance::new(binding.entity().clone(), &event.origin);
        let chain_name = self
            .registry
            .chains()
            .name_of(&event.origin.chain_id)
            .map(str::to_string);
        let mut ctx = HandlerContext::new(event, chain_name, self.capabilities.clone());

        tracing::debug!("Running {} for {} ({})", binding.identity(), event.name, event.id);
        binding.handler().handle(event, &mut record, &mut ctx).await?;

        let saved = match record.missing_unique_property() {
            Some(missing) => {
                tracing::debug!(
                    "Discarding {} record from {}: uniqueBy property '{}' not set",
                    binding.entity().name(),
                    event.id,
                    missing
                );
                Ok(LifecycleOutcome::Discarded {
                    missing: missing.to_string(),
                })
            }
            None => self.upsert.save(&record).await.map(LifecycleOutcome::Persisted),
        };

        // Group extensions requested by a successful handler apply whatever
        // happened to the save.
        for request in ctx.take_group_requests() {
            let registration = ContractRegistration {
                chain_id: event.origin.chain_id.clone(),
                group: request.group,
                address: request.address,
                registered_by: event.id.clone(),
                block_number: event.origin.block_number,
            };
            if let Err(e) = self.groups.register(registration).await {
                self.reporter.report(FailureReport::new(
                    event,
                    binding.identity(),
                    &LiveObjectError::Persistence(e),
                ));
            }
        }

        saved
    }
}
