//! Mechanism selector element
//!
//! Holds the mechanism registration (type → element), built once and
//! read-only afterwards, and dispatches each request to exactly one
//! registered element.
//!
//! # Selection
//!
//! 1. A connection that already carries a mechanism (refresh) keeps it.
//! 2. Otherwise the first client preference whose type is registered wins.
//! 3. No registered type → `UnsupportedMechanism`, with no side effects.
//!
//! The selected type is remembered per connection id, and close is routed
//! to that element even if the connection's mechanism field changed since.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::chain::{Element, NetworkServiceElement};
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::error::{ChainError, ConfigError};

/// Mechanism selector
pub struct MechanismSelector {
    handlers: HashMap<String, Element>,
    selected: DashMap<String, String>,
}

impl MechanismSelector {
    /// Create a selector from a registration map
    pub fn new(handlers: HashMap<String, Element>) -> Self {
        Self {
            handlers,
            selected: DashMap::new(),
        }
    }

    /// Start building a selector one registration at a time
    #[must_use]
    pub fn builder() -> MechanismSelectorBuilder {
        MechanismSelectorBuilder::default()
    }

    /// Registered mechanism types
    pub fn mechanism_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Type selected for a connection
    #[must_use]
    pub fn selected(&self, connection_id: &str) -> Option<String> {
        self.selected.get(connection_id).map(|t| t.clone())
    }

    fn choose(&self, request: &mut Request) -> Result<String, ChainError> {
        if let Some(mechanism) = &request.connection.mechanism {
            if self.handlers.contains_key(&mechanism.mechanism_type) {
                return Ok(mechanism.mechanism_type.clone());
            }
            return Err(ChainError::UnsupportedMechanism {
                requested: vec![mechanism.mechanism_type.clone()],
            });
        }

        let preference = request
            .mechanism_preferences
            .iter()
            .find(|m| self.handlers.contains_key(&m.mechanism_type))
            .cloned();

        match preference {
            Some(mechanism) => {
                let mechanism_type = mechanism.mechanism_type.clone();
                request.connection.mechanism = Some(mechanism);
                Ok(mechanism_type)
            }
            None => Err(ChainError::UnsupportedMechanism {
                requested: request
                    .mechanism_preferences
                    .iter()
                    .map(|m| m.mechanism_type.clone())
                    .collect(),
            }),
        }
    }
}

#[async_trait]
impl NetworkServiceElement for MechanismSelector {
    fn name(&self) -> &str {
        "mechanisms"
    }

    async fn request(&self, ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let mechanism_type = match self.choose(request) {
            Ok(t) => t,
            Err(e) => {
                warn!(connection_id = %request.id(), error = %e, "no registered mechanism");
                return Err(e);
            }
        };

        if let Some(previous) = self.selected(request.id()) {
            if previous != mechanism_type {
                return Err(ChainError::InvalidRequest(format!(
                    "mechanism changed from {previous} to {mechanism_type}; close the connection first"
                )));
            }
        }

        let Some(handler) = self.handlers.get(&mechanism_type) else {
            return Err(ChainError::UnsupportedMechanism {
                requested: vec![mechanism_type],
            });
        };

        debug!(connection_id = %request.id(), mechanism = %mechanism_type, "mechanism selected");
        handler.request(ctx, request).await?;
        self.selected
            .insert(request.connection.id.clone(), mechanism_type);
        Ok(())
    }

    async fn close(&self, ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        let Some(mechanism_type) = self.selected(&conn.id) else {
            return Ok(());
        };
        if let Some(handler) = self.handlers.get(&mechanism_type) {
            handler.close(ctx, conn).await?;
        }
        self.selected.remove(&conn.id);
        Ok(())
    }
}

/// Builder rejecting duplicate registrations
#[derive(Default)]
pub struct MechanismSelectorBuilder {
    handlers: HashMap<String, Element>,
}

impl MechanismSelectorBuilder {
    /// Register `element` for `mechanism_type`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the type is already registered.
    pub fn register(
        mut self,
        mechanism_type: impl Into<String>,
        element: Element,
    ) -> Result<Self, ConfigError> {
        let mechanism_type = mechanism_type.into();
        if self.handlers.contains_key(&mechanism_type) {
            return Err(ConfigError::ValidationError(format!(
                "Duplicate handler for mechanism {mechanism_type}"
            )));
        }
        self.handlers.insert(mechanism_type, element);
        Ok(self)
    }

    /// Build the selector
    #[must_use]
    pub fn build(self) -> MechanismSelector {
        MechanismSelector::new(self.handlers)
    }
}
