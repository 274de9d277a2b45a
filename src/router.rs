//! # Router Module
//!
//! Fans the event stream out to independent delivery routes, one per
//! (filter, exporter) pair.
//!
//! ```text
//!                      ┌─ filter task ─┐   verdict queue   ┌──────────┐  cap 1  ┌──────────┐
//! source ─ dispatch ──┤─ filter task ─┤ ────────────────▶ │ sequencer │ ──────▶ │ exporter │
//!                      └─ ...         ┘   (source order)  └──────────┘         └──────────┘
//! ```
//!
//! The dispatch loop never blocks on a route: filter evaluation runs on spawned tasks
//! and their handles are queued per route. Each route's sequencer awaits verdicts in
//! source order and performs the blocking handoff to its exporter, so a stalled
//! exporter only holds back its own route.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::PipelineError;
use crate::exporter::{Exporter, ExporterRegistry};
use crate::filter::EventFilter;
use crate::registry::Registry;
use crate::types::RawEvent;

/// Capacity of each route's delivery channel.
const DELIVERY_CAPACITY: usize = 1;

/// Default bound on a filter's wait for the enrichment context.
pub const DEFAULT_FILTER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on a filter's wait for the enrichment context
    pub filter_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            filter_timeout: DEFAULT_FILTER_TIMEOUT,
        }
    }
}

// ================================================================================================
// ROUTES
// ================================================================================================

struct Route {
    /// `filter#<index>-><exporter>`, used in logs
    label: String,
    /// Filter shared by every route of the same config entry
    filter: Arc<EventFilter>,
    /// Initialized exporter receiving the accepted events
    exporter: Arc<dyn Exporter>,
}

/// A pending filter decision for one event on one route.
struct Verdict {
    event: Arc<RawEvent>,
    accepted: JoinHandle<bool>,
}

/// Dispatch side of a running route.
///
/// The verdict queue is unbounded so that dispatch never waits on a route. A stalled
/// exporter therefore holds one filter task and one queued verdict per event until it
/// resumes or the pipeline stops.
struct RouteQueue {
    label: String,
    filter: Arc<EventFilter>,
    verdicts: mpsc::UnboundedSender<Verdict>,
}

pub struct Router {
    /// One route per (filter, exporter) pair, in config order
    routes: Vec<Route>,
    /// Enrichment lookups for service filters
    registry: Arc<Registry>,
    /// Dispatch settings
    config: RouterConfig,
}

impl Router {
    /// Compiles the filters, initializes every referenced exporter once and lays out
    /// one route per (filter, exporter) pair.
    pub async fn build(
        config: &Config,
        exporters: &ExporterRegistry,
        registry: Arc<Registry>,
        lifetime: &CancellationToken,
    ) -> Result<Self, PipelineError> {
        let mut routes = Vec::new();
        let mut initialized = HashSet::new();

        for (index, filter_config) in config.filters.iter().enumerate() {
            let filter = Arc::new(EventFilter::compile(filter_config.clone())?);

            for name in filter.exporters() {
                let Some(exporter_config) = config.exporter(name) else {
                    return Err(PipelineError::UndeclaredExporter(name.clone()));
                };
                let exporter = exporters
                    .get(name)
                    .ok_or_else(|| PipelineError::UnregisteredExporter(name.clone()))?;

                if initialized.insert(name.clone()) {
                    exporter
                        .init(lifetime, Some(exporter_config))
                        .await
                        .map_err(|source| PipelineError::ExporterInit {
                            name: name.clone(),
                            source,
                        })?;
                }

                routes.push(Route {
                    label: format!("filter#{}->{}", index, name),
                    filter: Arc::clone(&filter),
                    exporter,
                });
            }
        }

        info!(
            "built {} routes over {} exporters",
            routes.len(),
            initialized.len()
        );
        Ok(Router {
            routes,
            registry,
            config: RouterConfig::default(),
        })
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Dispatches `events` until the source closes or `lifetime` is cancelled.
    ///
    /// When the source closes, queued verdicts still drain into the exporters and
    /// this returns once every route has finished.
    pub async fn run(self, mut events: mpsc::Receiver<RawEvent>, lifetime: CancellationToken) {
        let Router {
            routes,
            registry,
            config,
        } = self;

        let mut tasks = JoinSet::new();
        let mut queues = Vec::with_capacity(routes.len());

        for route in routes {
            let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);
            let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();

            let exporter = Arc::clone(&route.exporter);
            let token = lifetime.clone();
            tasks.spawn(async move { exporter.export(token, delivery_rx).await });
            tasks.spawn(sequence(
                route.label.clone(),
                verdict_rx,
                delivery_tx,
                lifetime.clone(),
            ));
            queues.push(RouteQueue {
                label: route.label,
                filter: route.filter,
                verdicts: verdict_tx,
            });
        }

        debug!("router dispatching over {} routes", queues.len());
        loop {
            let event = tokio::select! {
                _ = lifetime.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => Arc::new(event),
                    None => {
                        debug!("event source closed");
                        break;
                    }
                },
            };

            trace!("dispatching event {}", event.uid);
            dispatch(&mut queues, &event, &registry, &config, &lifetime);
        }

        // Closing the verdict queues lets each sequencer drain and close its route.
        drop(queues);
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                error!("route task failed: {}", err);
            }
        }
        info!("router stopped");
    }
}

/// Starts the filter task of `event` on every open route and queues its verdict.
///
/// Routes whose sequencer has stopped are dropped. Returns the number of routes the
/// event was queued on.
fn dispatch(
    queues: &mut Vec<RouteQueue>,
    event: &Arc<RawEvent>,
    registry: &Arc<Registry>,
    config: &RouterConfig,
    lifetime: &CancellationToken,
) -> usize {
    queues.retain(|queue| {
        let open = !queue.verdicts.is_closed();
        if !open {
            debug!("route {} stopped, no longer dispatching to it", queue.label);
        }
        open
    });

    for queue in queues.iter() {
        let accepted = tokio::spawn({
            let filter = Arc::clone(&queue.filter);
            let event = Arc::clone(event);
            let registry = Arc::clone(registry);
            let token = lifetime.clone();
            let timeout = config.filter_timeout;
            async move { filter.accepts(&event, &registry, timeout, &token).await }
        });
        if queue
            .verdicts
            .send(Verdict {
                event: Arc::clone(event),
                accepted,
            })
            .is_err()
        {
            trace!("route {} stopped while dispatching", queue.label);
        }
    }
    queues.len()
}

/// Delivers accepted events of one route in source order.
async fn sequence(
    label: String,
    mut verdicts: mpsc::UnboundedReceiver<Verdict>,
    delivery: mpsc::Sender<Arc<RawEvent>>,
    lifetime: CancellationToken,
) {
    loop {
        let verdict = tokio::select! {
            _ = lifetime.cancelled() => break,
            next = verdicts.recv() => match next {
                Some(verdict) => verdict,
                None => break,
            },
        };

        let Verdict {
            event,
            mut accepted,
        } = verdict;
        let accepted = tokio::select! {
            _ = lifetime.cancelled() => {
                accepted.abort();
                break;
            }
            result = &mut accepted => result,
        };

        match accepted {
            Ok(true) => {
                let delivered = tokio::select! {
                    _ = lifetime.cancelled() => break,
                    delivered = delivery.send(event) => delivered,
                };
                if delivered.is_err() {
                    debug!("exporter of route {} stopped receiving", label);
                    break;
                }
            }
            Ok(false) => trace!("route {} rejected event {}", label, event.uid),
            Err(err) => error!("filter task of route {} failed: {}", label, err),
        }
    }
    debug!("route {} closed", label);
}
