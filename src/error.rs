//! Error types for pipeline construction, exporters and templates.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading configuration and assembling the pipeline.
///
/// Every variant is fatal: the pipeline never starts when one is returned.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("invalid {field} pattern {pattern:?}: {source}")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("exporter {0} is not defined in the exporters section")]
    UndeclaredExporter(String),

    #[error("exporter {0} is not registered")]
    UnregisteredExporter(String),

    #[error("exporter with name {0} has already been registered")]
    DuplicateExporter(String),

    #[error("failed to initialize exporter {name}: {source}")]
    ExporterInit {
        name: String,
        #[source]
        source: ExportError,
    },

    #[error("event source failed: {0}")]
    Source(String),
}

/// Errors raised by exporters, either at init time or on the transport.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("configs of {0} exporter cannot be empty")]
    MissingConfig(String),

    #[error("invalid configs of {name} exporter: {source}")]
    InvalidConfig {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("invalid collector address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("collect stream is closed")]
    StreamClosed,

    #[error("exporter {0} has not been initialized")]
    NotInitialized(String),
}

/// Errors raised while compiling or rendering an event template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {name}: unclosed action starting at byte {offset}")]
    UnclosedAction { name: String, offset: usize },

    #[error("template {name}: unsupported action {action:?}")]
    InvalidAction { name: String, action: String },

    #[error("template {name}: no field {path} in context")]
    MissingField { name: String, path: String },
}
