//! Compensation registry: maps every forward event type a choreographed
//! saga produces onto the compensating event type and the service that owns
//! emitting it.
//!
//! Validated at build time rather than left to fail at first use: every
//! registered forward event type must have exactly one compensation mapping
//! or be explicitly marked terminal — never both, never neither.

use std::collections::HashMap;

use crate::error::SagaEngineError;

/// The compensating action for one forward event type.
#[derive(Debug, Clone)]
pub struct CompensationMapping {
    /// The event type that undoes the forward event.
    pub compensating_event_type: String,
    /// The service responsible for emitting the compensating event.
    pub owning_service: String,
}

/// Builder for a [`CompensationRegistry`], collecting forward-event
/// mappings and terminal markers before validating the whole set.
#[derive(Default)]
pub struct CompensationRegistryBuilder {
    mappings: HashMap<String, CompensationMapping>,
    terminal: std::collections::HashSet<String>,
    known_forward_events: Vec<String>,
}

impl CompensationRegistryBuilder {
    /// A builder with nothing registered yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register that `forward_event_type` can occur and is compensated by
    /// `compensating_event_type`, emitted by `owning_service`.
    pub fn map(mut self, forward_event_type: impl Into<String>, compensating_event_type: impl Into<String>, owning_service: impl Into<String>) -> Self {
        let forward = forward_event_type.into();
        self.known_forward_events.push(forward.clone());
        self.mappings.insert(
            forward,
            CompensationMapping {
                compensating_event_type: compensating_event_type.into(),
                owning_service: owning_service.into(),
            },
        );
        self
    }

    /// Mark `forward_event_type` as terminal: it occurs but has nothing to
    /// compensate (e.g. a final "delivered" event).
    pub fn terminal(mut self, forward_event_type: impl Into<String>) -> Self {
        let forward = forward_event_type.into();
        self.known_forward_events.push(forward.clone());
        self.terminal.insert(forward);
        self
    }

    /// Validate that every registered forward event type has exactly one
    /// compensation mapping or is marked terminal, and build the registry.
    pub fn build(self) -> Result<CompensationRegistry, SagaEngineError> {
        for forward in &self.known_forward_events {
            let mapped = self.mappings.contains_key(forward);
            let terminal = self.terminal.contains(forward);
            if mapped == terminal {
                // Either neither (unmapped, non-terminal) or both
                // (ambiguous) — both are registry authoring mistakes.
                return Err(SagaEngineError::CompensationRegistryError(forward.clone()));
            }
        }
        Ok(CompensationRegistry {
            mappings: self.mappings,
            terminal: self.terminal,
        })
    }
}

/// A validated forward-event -> compensation mapping.
pub struct CompensationRegistry {
    mappings: HashMap<String, CompensationMapping>,
    terminal: std::collections::HashSet<String>,
}

impl CompensationRegistry {
    /// Start building a new registry.
    pub fn builder() -> CompensationRegistryBuilder {
        CompensationRegistryBuilder::new()
    }

    /// The compensation mapping for `forward_event_type`, if one is
    /// registered (absent for terminal or unknown event types).
    pub fn compensation_for(&self, forward_event_type: &str) -> Option<&CompensationMapping> {
        self.mappings.get(forward_event_type)
    }

    /// Whether `forward_event_type` is marked terminal (no compensation
    /// needed).
    pub fn is_terminal(&self, forward_event_type: &str) -> bool {
        self.terminal.contains(forward_event_type)
    }

    /// Reverse lookup: the forward event type that `compensating_event_type`
    /// undoes, if any mapping declares it.
    pub fn forward_for(&self, compensating_event_type: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|(_, m)| m.compensating_event_type == compensating_event_type)
            .map(|(forward, _)| forward.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_registry_builds() {
        let registry = CompensationRegistry::builder()
            .map("InventoryReserved", "InventoryReleased", "inventory-service")
            .map("PaymentCharged", "PaymentRefunded", "payment-service")
            .terminal("OrderShipped")
            .build()
            .unwrap();

        assert_eq!(
            registry.compensation_for("InventoryReserved").unwrap().owning_service,
            "inventory-service"
        );
        assert!(registry.is_terminal("OrderShipped"));
        assert!(registry.compensation_for("OrderShipped").is_none());
    }

    #[test]
    fn unmapped_non_terminal_event_fails_validation() {
        let result = CompensationRegistry::builder().terminal("OrderShipped").map("InventoryReserved", "InventoryReleased", "inventory-service").build();
        assert!(result.is_ok());

        // Build with a forward event registered only implicitly via a step
        // reference (not mapped, not terminal) by reusing the builder's
        // internal bookkeeping through a second, incomplete registration.
        let mut builder = CompensationRegistryBuilder::new();
        builder.known_forward_events.push("PaymentCharged".to_string());
        let result = builder.build();
        assert!(matches!(result, Err(SagaEngineError::CompensationRegistryError(_))));
    }
}
