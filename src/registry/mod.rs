//! # Enrichment Registry
//!
//! Mirrors the Pods, Services and Endpoints of the cluster into four bounded LRU
//! indices and resolves the workload context of an event:
//!
//! ```text
//! Pod event:     (ns, pod) -> Pod, (ns, pod) -> IP -> (ns, svc) -> Service
//! Service event: (ns, svc) -> Service
//! ```
//!
//! The indices are written only by watch notifications and lag behind the event
//! stream, so an incomplete resolution is retried on a fixed interval until it
//! completes, the caller's deadline passes, or the pipeline shuts down. Whatever was
//! resolved by then is returned; a lookup never fails.

mod cache;
mod context;

pub use context::EnrichmentContext;

use cache::BoundedCache;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::types::{CacheKey, Endpoints, Pod, RawEvent, Resource, Service};

/// Default number of entries per index.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default delay between two resolution attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

// ================================================================================================
// WATCH NOTIFICATIONS
// ================================================================================================

/// A change delivered by a watch subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchNotification {
    Added(Resource),
    Updated { old: Resource, new: Resource },
    Deleted(Resource),
}

// ================================================================================================
// REGISTRY
// ================================================================================================

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each of the four indices
    pub capacity: usize,
    /// Delay between resolution attempts of an incomplete context
    pub retry_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Sizes of the registry indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub pod_ips: usize,
    pub pods: usize,
    pub services: usize,
    pub service_keys: usize,
}

pub struct Registry {
    /// Pod IP by (namespace, pod name)
    pod_ip_by_key: BoundedCache<CacheKey, String>,
    /// Pod by (namespace, pod name)
    pod_by_key: BoundedCache<CacheKey, Arc<Pod>>,
    /// Service by (namespace, service name)
    service_by_key: BoundedCache<CacheKey, Arc<Service>>,
    /// (namespace, service name) by endpoint address
    service_key_by_ip: BoundedCache<String, CacheKey>,
    /// Delay between resolution attempts of an incomplete context
    retry_interval: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        debug!(
            "initializing template context registry (capacity {}, retry every {:?})",
            config.capacity, config.retry_interval
        );
        Registry {
            pod_ip_by_key: BoundedCache::new("pod-ip", config.capacity),
            pod_by_key: BoundedCache::new("pod", config.capacity),
            service_by_key: BoundedCache::new("service", config.capacity),
            service_key_by_ip: BoundedCache::new("service-key", config.capacity),
            retry_interval: config.retry_interval,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            pod_ips: self.pod_ip_by_key.len(),
            pods: self.pod_by_key.len(),
            services: self.service_by_key.len(),
            service_keys: self.service_key_by_ip.len(),
        }
    }

    // ============================================================================================
    // WATCH CALLBACKS
    // ============================================================================================

    pub fn apply(&self, notification: WatchNotification) {
        match notification {
            WatchNotification::Added(resource) => self.on_add(resource),
            WatchNotification::Updated { old, new } => self.on_update(old, new),
            WatchNotification::Deleted(resource) => self.on_delete(&resource),
        }
    }

    pub fn on_add(&self, resource: Resource) {
        match resource {
            Resource::Pod(pod) => self.add_pod(pod),
            Resource::Service(service) => self.add_service(service),
            Resource::Endpoints(endpoints) => self.add_endpoints(&endpoints),
        }
    }

    /// Supersedes `old` with `new`; no field-level patching.
    pub fn on_update(&self, old: Resource, new: Resource) {
        self.on_delete(&old);
        self.on_add(new);
    }

    /// Deleted objects age out of the LRU indices or get overwritten on reuse.
    pub fn on_delete(&self, resource: &Resource) {
        trace!(
            "{} {} deleted, leaving it to cache eviction",
            resource.kind(),
            resource.key()
        );
    }

    fn add_pod(&self, pod: Pod) {
        let key = CacheKey::of(&pod.metadata);
        if !pod.status.pod_ip.is_empty() {
            self.pod_ip_by_key.put(key.clone(), pod.status.pod_ip.clone());
        }
        self.pod_by_key.put(key, Arc::new(pod));
    }

    fn add_service(&self, service: Service) {
        let key = CacheKey::of(&service.metadata);
        self.service_by_key.put(key, Arc::new(service));
    }

    fn add_endpoints(&self, endpoints: &Endpoints) {
        let service_key = CacheKey::of(&endpoints.metadata);
        for address in endpoints.subsets.iter().flat_map(|s| s.addresses.iter()) {
            if address.ip.is_empty() {
                continue;
            }
            self.service_key_by_ip
                .put(address.ip.clone(), service_key.clone());
        }
    }

    /// Applies notifications until the channel closes or `lifetime` is cancelled.
    pub async fn watch(
        self: Arc<Self>,
        mut notifications: mpsc::Receiver<WatchNotification>,
        lifetime: CancellationToken,
    ) {
        debug!("starting registry watch");
        loop {
            tokio::select! {
                _ = lifetime.cancelled() => break,
                next = notifications.recv() => match next {
                    Some(notification) => self.apply(notification),
                    None => break,
                },
            }
        }
        debug!("registry watch stopped");
    }

    // ============================================================================================
    // CONTEXT QUERIES
    // ============================================================================================

    /// Resolves the enrichment context of `event`.
    ///
    /// Returns as soon as resolution completes; otherwise retries until `deadline`
    /// or cancellation and returns the partial context with `complete == false`.
    pub async fn get_context(
        &self,
        event: &Arc<RawEvent>,
        deadline: Instant,
        lifetime: &CancellationToken,
    ) -> EnrichmentContext {
        let mut context = EnrichmentContext::placeholder(Arc::clone(event));

        loop {
            if self.resolve(&mut context) {
                context.complete = true;
                return context;
            }

            trace!(
                "context of {} {} incomplete, retrying in {:?}",
                event.involved_object.kind,
                CacheKey::new(
                    event.involved_object.namespace.as_str(),
                    event.involved_object.name.as_str()
                ),
                self.retry_interval
            );

            tokio::select! {
                _ = lifetime.cancelled() => return context,
                _ = sleep_until(deadline) => return context,
                _ = sleep(self.retry_interval) => {}
            }
        }
    }

    /// One resolution attempt. Fills in whatever links are present and returns
    /// whether the chain for the event's kind is complete.
    fn resolve(&self, context: &mut EnrichmentContext) -> bool {
        let object = &context.event.involved_object;
        let key = CacheKey::new(object.namespace.as_str(), object.name.as_str());

        match object.kind.as_str() {
            "Pod" => {
                let Some(pod) = self.pod_by_key.get(&key) else {
                    return false;
                };
                context.pod = pod;

                let Some(ip) = self.pod_ip_by_key.get(&key) else {
                    return false;
                };
                let Some(service_key) = self.service_key_by_ip.get(&ip) else {
                    return false;
                };
                let Some(service) = self.service_by_key.get(&service_key) else {
                    return false;
                };
                context.service = service;
                true
            }
            "Service" => match self.service_by_key.get(&key) {
                Some(service) => {
                    context.service = service;
                    true
                }
                None => false,
            },
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{endpoints, event, pod, service};

    fn registry() -> Registry {
        Registry::new(RegistryConfig::default())
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_pod_event_resolves_through_endpoints() {
        let registry = registry();
        registry.on_add(pod("default", "reviews-v1-abc", "10.0.0.7"));
        registry.on_add(endpoints("default", "reviews", &["10.0.0.7"]));
        registry.on_add(service("default", "reviews"));

        let token = CancellationToken::new();
        let ctx = registry
            .get_context(&event("Pod", "default", "reviews-v1-abc"), in_secs(1), &token)
            .await;

        assert!(ctx.complete);
        assert_eq!(ctx.pod.metadata.name, "reviews-v1-abc");
        assert_eq!(ctx.service_name(), "reviews");
    }

    #[tokio::test]
    async fn test_service_event_resolves_directly() {
        let registry = registry();
        registry.on_add(service("prod", "ratings"));

        let token = CancellationToken::new();
        let ctx = registry
            .get_context(&event("Service", "prod", "ratings"), in_secs(1), &token)
            .await;

        assert!(ctx.complete);
        assert_eq!(ctx.service_name(), "ratings");
        assert_eq!(ctx.pod.metadata.name, "");
    }

    #[tokio::test]
    async fn test_other_kinds_complete_with_placeholders() {
        let registry = registry();
        let token = CancellationToken::new();
        let ctx = registry
            .get_context(&event("Node", "", "worker-1"), in_secs(1), &token)
            .await;

        assert!(ctx.complete);
        assert_eq!(ctx.service_name(), "");
        assert_eq!(*ctx.pod, Pod::default());
    }

    #[tokio::test]
    async fn test_adding_twice_is_idempotent() {
        let registry = registry();
        for _ in 0..2 {
            registry.on_add(pod("default", "p", "10.0.0.1"));
            registry.on_add(endpoints("default", "svc", &["10.0.0.1"]));
            registry.on_add(service("default", "svc"));
        }

        let token = CancellationToken::new();
        let first = registry
            .get_context(&event("Pod", "default", "p"), in_secs(1), &token)
            .await;
        let second = registry
            .get_context(&event("Pod", "default", "p"), in_secs(1), &token)
            .await;

        assert_eq!(first.pod, second.pod);
        assert_eq!(first.service, second.service);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                pod_ips: 1,
                pods: 1,
                services: 1,
                service_keys: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_service_resolves_before_deadline() {
        let registry = Arc::new(registry());
        registry.on_add(pod("default", "p", "10.0.0.1"));
        registry.on_add(endpoints("default", "svc", &["10.0.0.1"]));

        let late = Arc::clone(&registry);
        tokio::spawn(async move {
            sleep(Duration::from_secs(4)).await;
            late.on_add(service("default", "svc"));
        });

        let token = CancellationToken::new();
        let started = Instant::now();
        let ctx = registry
            .get_context(&event("Pod", "default", "p"), in_secs(60), &token)
            .await;

        assert!(ctx.complete);
        assert_eq!(ctx.service_name(), "svc");
        // Resolved on the second retry (t = 6s), well before the deadline.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_returns_partial_at_deadline() {
        let registry = registry();
        registry.on_add(pod("default", "p", "10.0.0.1"));

        let token = CancellationToken::new();
        let started = Instant::now();
        let ctx = registry
            .get_context(&event("Pod", "default", "p"), in_secs(10), &token)
            .await;

        assert!(!ctx.complete);
        assert_eq!(ctx.pod.metadata.name, "p");
        assert_eq!(ctx.service_name(), "");
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_query() {
        let registry = registry();
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let ctx = registry
            .get_context(&event("Service", "default", "gone"), in_secs(600), &token)
            .await;

        assert!(!ctx.complete);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_endpoint_ip_reuse_last_write_wins() {
        let registry = registry();
        registry.on_add(pod("default", "p", "10.0.0.1"));
        registry.on_add(service("default", "old"));
        registry.on_add(service("default", "new"));
        registry.on_add(endpoints("default", "old", &["10.0.0.1"]));
        registry.on_add(endpoints("default", "new", &["10.0.0.1"]));

        let token = CancellationToken::new();
        let ctx = registry
            .get_context(&event("Pod", "default", "p"), in_secs(1), &token)
            .await;
        assert_eq!(ctx.service_name(), "new");
    }

    #[tokio::test]
    async fn test_update_replaces_pod_ip() {
        let registry = registry();
        registry.on_add(service("default", "svc"));
        registry.on_add(endpoints("default", "svc", &["10.0.0.2"]));
        registry.apply(WatchNotification::Updated {
            old: pod("default", "p", "10.0.0.1"),
            new: pod("default", "p", "10.0.0.2"),
        });

        let token = CancellationToken::new();
        let ctx = registry
            .get_context(&event("Pod", "default", "p"), in_secs(1), &token)
            .await;
        assert!(ctx.complete);
        assert_eq!(ctx.pod.status.pod_ip, "10.0.0.2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_service_no_longer_resolves() {
        let registry = Registry::new(RegistryConfig {
            capacity: 2,
            ..Default::default()
        });
        registry.on_add(service("default", "a"));
        registry.on_add(service("default", "b"));
        registry.on_add(service("default", "c"));

        let token = CancellationToken::new();
        let evicted = registry
            .get_context(&event("Service", "default", "a"), in_secs(1), &token)
            .await;
        assert!(!evicted.complete);

        let kept = registry
            .get_context(&event("Service", "default", "c"), in_secs(1), &token)
            .await;
        assert!(kept.complete);
    }

    #[tokio::test]
    async fn test_watch_applies_notifications() {
        let registry = Arc::new(registry());
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&registry).watch(rx, token.clone()));

        tx.send(WatchNotification::Added(service("default", "svc")))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(registry.stats().services, 1);
    }
}
