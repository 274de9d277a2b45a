//! # Exporter Module
//!
//! The sink contract and the registry of available sinks.
//!
//! An exporter is initialized once per name with its config block and then runs one
//! `export` loop per route that references it. Built-in sinks:
//! - `console`: logs one JSON-encoded record per event
//! - `skywalking`: streams records to a SkyWalking OAP collector over gRPC

pub mod console;
pub mod proto;
pub mod skywalking;
pub mod template;

pub use console::Console;
pub use skywalking::SkyWalking;
pub use template::{EventTemplate, EventTemplateConfig};

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExporterConfig;
use crate::error::{ExportError, PipelineError};
use crate::registry::Registry;
use crate::types::{EventType, RawEvent};
use proto::{Event, Source, Type};

// ================================================================================================
// EXPORTER TRAIT
// ================================================================================================

#[tonic::async_trait]
pub trait Exporter: Send + Sync {
    /// Name under which the exporter is referenced in the config.
    fn name(&self) -> &str;

    /// Validates the exporter's config block and prepares its resources.
    ///
    /// `config` is `None` when the `exporters` section has no entry for this name.
    async fn init(
        &self,
        lifetime: &CancellationToken,
        config: Option<&ExporterConfig>,
    ) -> Result<(), ExportError>;

    /// Forwards events until `lifetime` is cancelled or `events` closes.
    async fn export(&self, lifetime: CancellationToken, events: mpsc::Receiver<Arc<RawEvent>>);
}

// ================================================================================================
// EXPORTER REGISTRY
// ================================================================================================

/// Name to exporter map, assembled once at startup.
#[derive(Default)]
pub struct ExporterRegistry {
    exporters: HashMap<String, Arc<dyn Exporter>>,
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `console` and `skywalking` sinks.
    pub fn with_builtin(registry: Arc<Registry>) -> Result<Self, PipelineError> {
        let mut exporters = Self::new();
        exporters.register(Arc::new(Console::new(Arc::clone(&registry))))?;
        exporters.register(Arc::new(SkyWalking::new(registry)))?;
        Ok(exporters)
    }

    pub fn register(&mut self, exporter: Arc<dyn Exporter>) -> Result<(), PipelineError> {
        let name = exporter.name().to_string();
        if self.exporters.contains_key(&name) {
            return Err(PipelineError::DuplicateExporter(name));
        }
        debug!("registering exporter {}", name);
        self.exporters.insert(name, exporter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Exporter>> {
        self.exporters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.exporters.keys().map(String::as_str)
    }
}

// ================================================================================================
// SHARED HELPERS
// ================================================================================================

/// Maps a raw event onto the collector record with an empty source.
pub fn to_wire_event(raw: &RawEvent) -> Event {
    let uuid = if raw.uid.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        raw.uid.clone()
    };
    let event_type = match raw.event_type {
        EventType::Warning => Type::Error,
        EventType::Normal => Type::Normal,
    };

    Event {
        uuid,
        source: Some(Source::default()),
        name: raw.reason.clone(),
        r#type: event_type as i32,
        message: raw.message.clone(),
        start_time: raw.first_seen_ms(),
        end_time: raw.last_seen_ms(),
        ..Default::default()
    }
}

/// Deserializes an exporter config block. A missing or null block is an error.
pub(crate) fn parse_config<T: DeserializeOwned>(
    name: &str,
    config: Option<&ExporterConfig>,
) -> Result<T, ExportError> {
    match config {
        None | Some(serde_yaml::Value::Null) => Err(ExportError::MissingConfig(name.to_string())),
        Some(value) => {
            serde_yaml::from_value(value.clone()).map_err(|source| ExportError::InvalidConfig {
                name: name.to_string(),
                source,
            })
        }
    }
}

/// Template renders in flight for one export loop.
///
/// Each render waits for the enrichment context at most
/// [`template::DEFAULT_RENDER_TIMEOUT`] and returns early on shutdown, so draining
/// the set is bounded.
#[derive(Default)]
pub(crate) struct PendingRenders {
    tasks: JoinSet<Event>,
}

impl PendingRenders {
    /// Starts rendering `raw` on its own task.
    pub(crate) fn start(
        &mut self,
        template: &Arc<EventTemplate>,
        registry: &Arc<Registry>,
        raw: Arc<RawEvent>,
        lifetime: &CancellationToken,
    ) {
        let template = Arc::clone(template);
        let registry = Arc::clone(registry);
        let lifetime = lifetime.clone();
        self.tasks.spawn(async move {
            let mut event = to_wire_event(&raw);
            template
                .render_within(
                    &registry,
                    &raw,
                    &mut event,
                    template::DEFAULT_RENDER_TIMEOUT,
                    &lifetime,
                )
                .await;
            event
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for the next finished render, in completion order. Never resolves while
    /// nothing is in flight.
    pub(crate) async fn next(&mut self) -> Event {
        loop {
            match self.tasks.join_next().await {
                Some(Ok(event)) => return event,
                Some(Err(err)) => error!("render task failed: {}", err),
                None => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    struct Named(&'static str);

    #[tonic::async_trait]
    impl Exporter for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn init(
            &self,
            _lifetime: &CancellationToken,
            _config: Option<&ExporterConfig>,
        ) -> Result<(), ExportError> {
            Ok(())
        }

        async fn export(&self, _lifetime: CancellationToken, _events: mpsc::Receiver<Arc<RawEvent>>) {}
    }

    #[test]
    fn test_duplicate_registration_is_error() {
        let mut exporters = ExporterRegistry::new();
        exporters.register(Arc::new(Named("console"))).unwrap();
        let err = exporters.register(Arc::new(Named("console"))).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateExporter(name) if name == "console"));
    }

    #[test]
    fn test_builtin_exporters_are_registered() {
        let exporters = ExporterRegistry::with_builtin(Arc::new(Registry::default())).unwrap();
        let mut names: Vec<_> = exporters.names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["console", "skywalking"]);
        assert!(exporters.get("kafka").is_none());
    }

    #[test]
    fn test_wire_mapping() {
        let raw = RawEvent {
            uid: "abc".into(),
            reason: "BackOff".into(),
            message: "Back-off restarting failed container".into(),
            event_type: EventType::Warning,
            count: 4,
            first_timestamp: Some(Utc.timestamp_millis_opt(1_600_000_000_000).unwrap()),
            last_timestamp: Some(Utc.timestamp_millis_opt(1_600_000_060_000).unwrap()),
            ..Default::default()
        };

        let event = to_wire_event(&raw);
        assert_eq!(event.uuid, "abc");
        assert_eq!(event.name, "BackOff");
        assert_eq!(event.r#type, Type::Error as i32);
        assert_eq!(event.start_time, 1_600_000_000_000);
        assert_eq!(event.end_time, 1_600_000_060_000);
        assert_eq!(event.source, Some(Source::default()));
    }

    #[test]
    fn test_wire_mapping_generates_missing_uid() {
        let event = to_wire_event(&RawEvent::default());
        assert!(Uuid::parse_str(&event.uuid).is_ok());
        assert_eq!(event.r#type, Type::Normal as i32);
        assert_eq!(event.start_time, 0);
    }

    #[test]
    fn test_parse_config_requires_block() {
        #[derive(Debug, serde::Deserialize)]
        struct Empty {}

        assert!(matches!(
            parse_config::<Empty>("console", None),
            Err(ExportError::MissingConfig(_))
        ));
        assert!(matches!(
            parse_config::<Empty>("console", Some(&serde_yaml::Value::Null)),
            Err(ExportError::MissingConfig(_))
        ));
        let block: serde_yaml::Value = serde_yaml::from_str("{}").unwrap();
        assert!(parse_config::<Empty>("console", Some(&block)).is_ok());
    }
}
