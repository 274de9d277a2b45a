//! # Console Exporter
//!
//! Writes each accepted event as one JSON-encoded collector record. Useful for
//! checking filters and templates before pointing the pipeline at a collector.
//!
//! Templated records are written as their renders finish. The export loop returns
//! only after every render it started has been written.

use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::proto::Event;
use super::{
    parse_config, to_wire_event, EventTemplate, EventTemplateConfig, Exporter, PendingRenders,
};
use crate::config::ExporterConfig;
use crate::error::ExportError;
use crate::registry::Registry;
use crate::types::RawEvent;

pub const NAME: &str = "console";

type Output = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub template: Option<EventTemplateConfig>,
}

struct ConsoleState {
    template: Option<Arc<EventTemplate>>,
}

pub struct Console {
    registry: Arc<Registry>,
    output: Output,
    state: RwLock<Option<Arc<ConsoleState>>>,
}

impl Console {
    /// Console sink writing to the `info` log.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_output(registry, |line| info!("{}", line))
    }

    /// Console sink handing every encoded record to `output`.
    pub fn with_output<F>(registry: Arc<Registry>, output: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Console {
            registry,
            output: Arc::new(output),
            state: RwLock::new(None),
        }
    }
}

fn emit(output: &Output, event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => output(line),
        Err(err) => error!("failed to encode event {}: {}", event.uuid, err),
    }
}

#[tonic::async_trait]
impl Exporter for Console {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(
        &self,
        _lifetime: &CancellationToken,
        config: Option<&ExporterConfig>,
    ) -> Result<(), ExportError> {
        let config: ConsoleConfig = parse_config(NAME, config)?;
        let template = config
            .template
            .as_ref()
            .map(EventTemplate::compile)
            .transpose()?
            .map(Arc::new);

        debug!("initialized console exporter (templated: {})", template.is_some());
        *self.state.write() = Some(Arc::new(ConsoleState { template }));
        Ok(())
    }

    async fn export(&self, lifetime: CancellationToken, mut events: mpsc::Receiver<Arc<RawEvent>>) {
        let Some(state) = self.state.read().clone() else {
            error!("{}", ExportError::NotInitialized(NAME.to_string()));
            return;
        };

        let mut renders = PendingRenders::default();
        let mut inbound_open = true;

        loop {
            if !inbound_open && renders.is_empty() {
                break;
            }

            tokio::select! {
                _ = lifetime.cancelled() => break,
                event = renders.next() => emit(&self.output, &event),
                next = events.recv(), if inbound_open => match next {
                    None => inbound_open = false,
                    Some(raw) => match &state.template {
                        None => emit(&self.output, &to_wire_event(&raw)),
                        Some(template) => renders.start(template, &self.registry, raw, &lifetime),
                    },
                },
            }
        }
        debug!("console exporter stopped");
    }
}
