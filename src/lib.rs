//! # Kubernetes Event Exporter Library
//!
//! Watches cluster events, correlates them with the Pod and Service they concern,
//! filters them against declarative rules and forwards accepted events to telemetry
//! sinks.

// Core modules
pub mod config;
pub mod error;
pub mod exporter;
pub mod filter;
pub mod registry;
pub mod router;
pub mod source;
pub mod types;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use config::Config;
pub use error::{ExportError, PipelineError, TemplateError};
pub use exporter::{Exporter, ExporterRegistry};
pub use filter::{EventFilter, FilterConfig};
pub use registry::{Registry, RegistryConfig, WatchNotification};
pub use router::{Router, RouterConfig};
pub use source::{ChannelSource, EventSource, JsonLinesFeed};
pub use types::{CacheKey, EventType, RawEvent, Resource};
