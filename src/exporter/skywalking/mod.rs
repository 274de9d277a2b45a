//! # SkyWalking Exporter
//!
//! Streams collector records to a SkyWalking OAP server through
//! `skywalking.v3.EventService/collect`.
//!
//! Delivery is best-effort: each `export` loop keeps one stream open and replaces it as
//! soon as the call ends, before anything else is sent. A stream that dies within the
//! retry interval of being opened is only replaced once that interval has passed. An
//! event whose send races with the stream closing is dropped. Templated events are
//! rendered on their own tasks and sent as they finish, so a slow enrichment lookup
//! never stalls other events.

mod connector;
mod tls;

pub use connector::{connect_with_retry, CollectStream, Connector, GrpcConnector, DEFAULT_RETRY_INTERVAL};
pub use tls::{client_config, TlsConnect};

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;

use super::{
    parse_config, to_wire_event, EventTemplate, EventTemplateConfig, Exporter, PendingRenders,
};
use crate::config::ExporterConfig;
use crate::error::ExportError;
use crate::registry::Registry;
use crate::types::RawEvent;

pub const NAME: &str = "skywalking";

// ================================================================================================
// CONFIG
// ================================================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkyWalkingConfig {
    /// Collector `host:port`
    pub address: String,
    #[serde(rename = "enableTLS", default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub client_cert_path: String,
    #[serde(default)]
    pub client_key_path: String,
    #[serde(default)]
    pub trusted_cert_path: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub template: Option<EventTemplateConfig>,
}

impl SkyWalkingConfig {
    /// Builds the connector for this config. TLS material is loaded here so that
    /// broken certificates fail init instead of every connection attempt.
    pub fn connector(&self) -> Result<GrpcConnector, ExportError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.address.trim())).map_err(
            |source| ExportError::InvalidAddress {
                address: self.address.clone(),
                source,
            },
        )?;

        let tls = if self.enable_tls {
            let host = endpoint.uri().host().unwrap_or_default().to_string();
            Some(TlsConnect::new(client_config(self)?, &host)?)
        } else {
            None
        };

        Ok(GrpcConnector::new(endpoint, tls))
    }
}

// ================================================================================================
// EXPORTER
// ================================================================================================

struct SkyWalkingState {
    connector: Arc<dyn Connector>,
    template: Option<Arc<EventTemplate>>,
}

pub struct SkyWalking {
    /// Enrichment lookups for templated records
    registry: Arc<Registry>,
    /// Connector overriding the configured address
    connector: Option<Arc<dyn Connector>>,
    /// Delay between two connection attempts
    retry_interval: Duration,
    /// Connector and template, set by `init`
    state: RwLock<Option<Arc<SkyWalkingState>>>,
}

impl SkyWalking {
    pub fn new(registry: Arc<Registry>) -> Self {
        SkyWalking {
            registry,
            connector: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            state: RwLock::new(None),
        }
    }

    /// Exporter that opens its streams through `connector` instead of the configured
    /// address.
    pub fn with_connector(registry: Arc<Registry>, connector: Arc<dyn Connector>) -> Self {
        SkyWalking {
            connector: Some(connector),
            ..Self::new(registry)
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Replaces a stream whose call has ended.
    async fn reopen(
        &self,
        state: &SkyWalkingState,
        dead: &CollectStream,
        lifetime: &CancellationToken,
    ) -> Option<CollectStream> {
        let retry_at = dead.opened_at() + self.retry_interval;
        if Instant::now() < retry_at {
            debug!("collect stream ended early, waiting {:?} to reconnect", self.retry_interval);
            tokio::select! {
                _ = lifetime.cancelled() => return None,
                _ = sleep_until(retry_at) => {}
            }
        }
        connect_with_retry(state.connector.as_ref(), self.retry_interval, lifetime).await
    }
}

#[tonic::async_trait]
impl Exporter for SkyWalking {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(
        &self,
        _lifetime: &CancellationToken,
        config: Option<&ExporterConfig>,
    ) -> Result<(), ExportError> {
        let config: SkyWalkingConfig = parse_config(NAME, config)?;
        let template = config
            .template
            .as_ref()
            .map(EventTemplate::compile)
            .transpose()?
            .map(Arc::new);

        let connector: Arc<dyn Connector> = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(config.connector()?),
        };

        info!(
            "initialized skywalking exporter for {} (tls: {}, templated: {})",
            config.address,
            config.enable_tls,
            template.is_some()
        );
        *self.state.write() = Some(Arc::new(SkyWalkingState { connector, template }));
        Ok(())
    }

    async fn export(&self, lifetime: CancellationToken, mut events: mpsc::Receiver<Arc<RawEvent>>) {
        let Some(state) = self.state.read().clone() else {
            error!("{}", ExportError::NotInitialized(NAME.to_string()));
            return;
        };

        let Some(mut stream) =
            connect_with_retry(state.connector.as_ref(), self.retry_interval, &lifetime).await
        else {
            return;
        };

        // Renders are not bounded: a stalled collector leaves every templated event
        // it has not taken yet in this set.
        let mut renders = PendingRenders::default();
        let mut inbound_open = true;

        loop {
            if !inbound_open && renders.is_empty() {
                break;
            }

            let event = tokio::select! {
                _ = lifetime.cancelled() => break,
                _ = stream.closed() => {
                    warn!("collect stream closed, reconnecting");
                    match self.reopen(&state, &stream, &lifetime).await {
                        Some(reopened) => stream = reopened,
                        None => break,
                    }
                    continue;
                }
                event = renders.next() => event,
                next = events.recv(), if inbound_open => match next {
                    None => {
                        inbound_open = false;
                        continue;
                    }
                    Some(raw) => match &state.template {
                        None => to_wire_event(&raw),
                        Some(template) => {
                            renders.start(template, &self.registry, raw, &lifetime);
                            continue;
                        }
                    },
                },
            };

            if stream.is_closed() {
                match self.reopen(&state, &stream, &lifetime).await {
                    Some(reopened) => stream = reopened,
                    None => break,
                }
            }

            if log::log_enabled!(log::Level::Debug) {
                debug!("exporting event to skywalking {:?}", event);
            }

            let uuid = event.uuid.clone();
            let sent = tokio::select! {
                _ = lifetime.cancelled() => break,
                sent = stream.send(event) => sent,
            };
            if let Err(err) = sent {
                error!("failed to send event {} to skywalking, dropping it. {}", uuid, err);
                match self.reopen(&state, &stream, &lifetime).await {
                    Some(reopened) => stream = reopened,
                    None => break,
                }
            }
        }

        debug!("skywalking exporter stopped");
    }
}
