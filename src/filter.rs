//! # Event Filter Module
//!
//! A filter rule is a conjunction of optional regex constraints over one event plus
//! a minimum occurrence count. Patterns are compiled once when the rule is bound to
//! a route; an invalid pattern fails pipeline construction.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use regex::Regex;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::registry::Registry;
use crate::types::RawEvent;

// ================================================================================================
// FILTER CONFIG
// ================================================================================================

/// Filter rule as written in the `filters` section. Empty patterns are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub reason: String,
    pub message: String,
    pub min_count: i32,
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub service: String,
    pub exporters: Vec<String>,
}

// ================================================================================================
// COMPILED FILTER
// ================================================================================================

/// A [`FilterConfig`] with its patterns compiled.
#[derive(Debug)]
pub struct EventFilter {
    config: FilterConfig,
    reason: Option<Regex>,
    message: Option<Regex>,
    event_type: Option<Regex>,
    action: Option<Regex>,
    kind: Option<Regex>,
    namespace: Option<Regex>,
    name: Option<Regex>,
    service: Option<Regex>,
}

fn compile(field: &'static str, pattern: &str) -> Result<Option<Regex>, PipelineError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| PipelineError::InvalidPattern {
            field,
            pattern: pattern.to_string(),
            source,
        })
}

fn passes(pattern: &Option<Regex>, value: &str) -> bool {
    pattern.as_ref().map_or(true, |re| re.is_match(value))
}

impl EventFilter {
    pub fn compile(config: FilterConfig) -> Result<Self, PipelineError> {
        debug!("initializing filter config {:?}", config);
        Ok(EventFilter {
            reason: compile("reason", &config.reason)?,
            message: compile("message", &config.message)?,
            event_type: compile("type", &config.event_type)?,
            action: compile("action", &config.action)?,
            kind: compile("kind", &config.kind)?,
            namespace: compile("namespace", &config.namespace)?,
            name: compile("name", &config.name)?,
            service: compile("service", &config.service)?,
            config,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn exporters(&self) -> &[String] {
        &self.config.exporters
    }

    /// Whether the rule needs the enrichment context to decide.
    pub fn needs_context(&self) -> bool {
        self.service.is_some()
    }

    /// Checks every constraint that can be decided from the event alone.
    pub fn matches_event(&self, event: &RawEvent) -> bool {
        let object = &event.involved_object;
        passes(&self.reason, &event.reason)
            && passes(&self.message, &event.message)
            && event.count >= self.config.min_count
            && passes(&self.event_type, event.event_type.as_str())
            && passes(&self.action, &event.action)
            && passes(&self.kind, &object.kind)
            && passes(&self.namespace, &object.namespace)
            && passes(&self.name, &object.name)
    }

    /// Decides whether `event` is accepted by this rule.
    ///
    /// The service constraint waits at most `timeout` for the registry; a context that
    /// did not resolve in time is a non-match.
    pub async fn accepts(
        &self,
        event: &Arc<RawEvent>,
        registry: &Registry,
        timeout: Duration,
        lifetime: &CancellationToken,
    ) -> bool {
        if !self.matches_event(event) {
            return false;
        }

        let Some(service) = &self.service else {
            return true;
        };

        let context = registry
            .get_context(event, Instant::now() + timeout, lifetime)
            .await;
        if !context.complete {
            trace!(
                "context of event {} did not resolve in time, rejecting",
                event.uid
            );
            return false;
        }
        service.is_match(context.service_name())
    }
}
