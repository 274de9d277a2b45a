//! Builders for resources and events used across unit tests.

use std::sync::Arc;

use crate::types::{
    EndpointAddress, EndpointSubset, Endpoints, ObjectMeta, ObjectReference, Pod, PodStatus,
    RawEvent, Resource, Service,
};

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: name.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    }
}

pub fn pod(namespace: &str, name: &str, ip: &str) -> Resource {
    Resource::Pod(Pod {
        metadata: meta(namespace, name),
        status: PodStatus {
            pod_ip: ip.to_string(),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub fn service(namespace: &str, name: &str) -> Resource {
    Resource::Service(Service {
        metadata: meta(namespace, name),
        ..Default::default()
    })
}

pub fn endpoints(namespace: &str, name: &str, ips: &[&str]) -> Resource {
    Resource::Endpoints(Endpoints {
        metadata: meta(namespace, name),
        subsets: vec![EndpointSubset {
            addresses: ips
                .iter()
                .map(|ip| EndpointAddress {
                    ip: ip.to_string(),
                    ..Default::default()
                })
                .collect(),
        }],
    })
}

pub fn event(kind: &str, namespace: &str, name: &str) -> Arc<RawEvent> {
    Arc::new(RawEvent {
        uid: format!("{}-{}", namespace, name),
        reason: "Killing".to_string(),
        message: "Stopping container".to_string(),
        count: 1,
        involved_object: ObjectReference {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        ..Default::default()
    })
}

pub fn event_with_reason(reason: &str) -> Arc<RawEvent> {
    Arc::new(RawEvent {
        uid: format!("uid-{}", reason.to_lowercase()),
        reason: reason.to_string(),
        count: 1,
        ..Default::default()
    })
}
