use std::sync::Arc;

use serde::Serialize;

use crate::types::{Pod, RawEvent, Service};

/// Pod and Service correlated with one event.
///
/// Built per query and never cached. Unresolved parts hold empty placeholders, so
/// templates and filters always see a well-formed context. Serializes as
/// `{"Event": …, "Pod": …, "Service": …}`, which is the shape templates address.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnrichmentContext {
    pub event: Arc<RawEvent>,
    pub pod: Arc<Pod>,
    pub service: Arc<Service>,
    /// Whether resolution finished before the deadline.
    #[serde(skip)]
    pub complete: bool,
}

impl EnrichmentContext {
    pub fn placeholder(event: Arc<RawEvent>) -> Self {
        EnrichmentContext {
            event,
            pod: Arc::new(Pod::default()),
            service: Arc::new(Service::default()),
            complete: false,
        }
    }

    /// Name of the resolved service, trimmed; empty when unresolved.
    pub fn service_name(&self) -> &str {
        self.service.metadata.name.trim()
    }
}
