//! # Exporter Types Module
//!
//! Core data definitions shared by the registry, filters, router and exporters.
//!
//! This module provides:
//! - The raw Kubernetes event record consumed by the pipeline
//! - The subset of Pod / Service / Endpoints resources the registry mirrors
//! - The `(namespace, name)` cache key used by every registry index

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ================================================================================================
// RAW EVENT
// ================================================================================================

/// Kubernetes event severity. Only the two core/v1 values exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the object an event concerns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// An event as delivered by the cluster watch.
///
/// Field names follow the core/v1 `Event` JSON shape so that events can be fed
/// straight from `kubectl get events -o json` style output. The record is shared
/// read-only across every route once it enters the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawEvent {
    #[serde(alias = "id")]
    pub uid: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub action: String,
    pub count: i32,
    pub involved_object: ObjectReference,
    #[serde(alias = "firstSeen")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(alias = "lastSeen")]
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl RawEvent {
    /// First timestamp in epoch milliseconds, 0 when unset.
    pub fn first_seen_ms(&self) -> i64 {
        self.first_timestamp.map_or(0, |t| t.timestamp_millis())
    }

    /// Last timestamp in epoch milliseconds, 0 when unset.
    pub fn last_seen_ms(&self) -> i64 {
        self.last_timestamp.map_or(0, |t| t.timestamp_millis())
    }
}

// ================================================================================================
// MIRRORED RESOURCES
// ================================================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    pub node_name: String,
    pub service_account_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    pub phase: String,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSpec {
    #[serde(rename = "clusterIP")]
    pub cluster_ip: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointAddress {
    pub ip: String,
    pub hostname: String,
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
}

/// Endpoints share the name and namespace of the Service that owns them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub metadata: ObjectMeta,
    pub subsets: Vec<EndpointSubset>,
}

/// A watched resource carried by a watch notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    Pod(Pod),
    Service(Service),
    Endpoints(Endpoints),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Pod(_) => "Pod",
            Resource::Service(_) => "Service",
            Resource::Endpoints(_) => "Endpoints",
        }
    }

    pub fn key(&self) -> CacheKey {
        let meta = match self {
            Resource::Pod(p) => &p.metadata,
            Resource::Service(s) => &s.metadata,
            Resource::Endpoints(e) => &e.metadata,
        };
        CacheKey::of(meta)
    }
}

// ================================================================================================
// CACHE KEY
// ================================================================================================

/// `(namespace, name)` pair identifying a namespaced object in every registry index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub namespace: String,
    pub name: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        CacheKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(meta: &ObjectMeta) -> Self {
        CacheKey::new(meta.namespace.as_str(), meta.name.as_str())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}
