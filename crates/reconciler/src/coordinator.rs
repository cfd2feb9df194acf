//! Per-bundle concurrency coordinator.
//!
//! Serialises passes per bundle through the [`WorkQueue`], retries retriable
//! failures with backoff, and answers callers waiting for a pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::orchestrator::BundleProcessor;
use crate::queue::WorkQueue;
use crate::store::ObjectCache;
use crate::types::{Bundle, BundleRef, Object, BUNDLE_API_VERSION, BUNDLE_KIND};

/// A caller waiting for the next completed pass of a bundle.
enum Waiter {
    Work(oneshot::Sender<Bundle>),
    Notify(oneshot::Sender<()>),
}

pub struct Coordinator {
    processor: Arc<BundleProcessor>,
    cache: Arc<dyn ObjectCache>,
    queue: Arc<WorkQueue<BundleRef>>,
    waiters: Mutex<HashMap<BundleRef, Vec<Waiter>>>,
    workers: usize,
    namespace: Option<String>,
}

impl Coordinator {
    pub fn new(processor: Arc<BundleProcessor>, cache: Arc<dyn ObjectCache>, config: &ControllerConfig) -> Self {
        Self {
            processor,
            cache,
            queue: Arc::new(WorkQueue::new(config.backoff.clone())),
            waiters: Mutex::new(HashMap::new()),
            workers: config.workers.max(1),
            namespace: config.namespace.clone(),
        }
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<BundleRef, Vec<Waiter>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watches(&self, bundle: &BundleRef) -> bool {
        self.namespace.as_deref().map_or(true, |ns| ns == bundle.namespace)
    }

    /// Trigger a pass. External triggers reset the bundle's backoff.
    pub fn enqueue(&self, bundle: BundleRef) {
        if !self.watches(&bundle) {
            debug!(bundle = %bundle, "Ignoring bundle outside watched namespace");
            return;
        }
        self.queue.forget(&bundle);
        self.queue.add(bundle);
    }

    /// Trigger a pass of the bundle controlling `object`, if any.
    pub fn enqueue_for_object(&self, object: &Object) -> Option<BundleRef> {
        let owner = object.metadata.controller_ref()?;
        if owner.kind != BUNDLE_KIND || owner.api_version != BUNDLE_API_VERSION {
            return None;
        }
        let bundle = BundleRef::new(object.namespace(), owner.name.clone());
        self.enqueue(bundle.clone());
        Some(bundle)
    }

    /// Trigger a pass of every bundle in the cache.
    pub fn enqueue_all(&self) {
        for bundle in self.cache.bundles() {
            self.enqueue(bundle);
        }
    }

    /// Trigger a pass and receive the bundle as it stands once a pass
    /// completes. The channel closes if the bundle no longer exists or lies
    /// outside the watched namespace.
    pub fn request_bundle(&self, bundle: BundleRef) -> oneshot::Receiver<Bundle> {
        let (tx, rx) = oneshot::channel();
        if !self.watches(&bundle) {
            return rx;
        }
        self.waiters().entry(bundle.clone()).or_default().push(Waiter::Work(tx));
        self.enqueue(bundle);
        rx
    }

    /// Receive a signal when the next pass of `bundle` completes. Does not
    /// trigger a pass by itself. The channel closes at once if the bundle
    /// does not exist or lies outside the watched namespace.
    pub fn notify_on_pass(&self, bundle: BundleRef) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if !self.watches(&bundle) || self.cache.get_bundle(&bundle).is_none() {
            return rx;
        }
        self.waiters().entry(bundle).or_default().push(Waiter::Notify(tx));
        rx
    }

    /// Run the workers until `shutdown` turns true (or its sender is dropped).
    /// In-flight passes are dropped at shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers, "Starting coordinator");
        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                let coordinator = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { coordinator.worker(id, shutdown).await })
            })
            .collect();

        wait_for_shutdown(&mut shutdown).await;
        info!("Shutting down coordinator");
        self.queue.shut_down();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        // dropping the senders closes every pending request
        self.waiters().clear();
        info!("Coordinator stopped");
    }

    async fn worker(&self, id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = id, "Worker started");
        loop {
            let key = tokio::select! {
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
                () = wait_for_shutdown(&mut shutdown) => break,
            };

            tokio::select! {
                () = self.process_key(&key) => {}
                () = wait_for_shutdown(&mut shutdown) => {
                    debug!(worker = id, bundle = %key, "Dropping in-flight pass");
                    self.queue.done(&key);
                    break;
                }
            }
            self.queue.done(&key);
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn process_key(&self, key: &BundleRef) {
        let Some(bundle) = self.cache.get_bundle(key) else {
            debug!(bundle = %key, "Bundle no longer exists");
            self.queue.forget(key);
            self.waiters().remove(key);
            return;
        };

        let outcome = self.processor.process_bundle(&bundle).await;
        if outcome.retriable {
            let delay = self.queue.add_rate_limited(key.clone());
            warn!(bundle = %key, delay_ms = delay.as_millis() as u64, "Retrying bundle");
        } else {
            self.queue.forget(key);
        }

        let waiters = self.waiters().remove(key).unwrap_or_default();
        for waiter in waiters {
            // a dropped receiver just means nobody is listening anymore
            let _ = match waiter {
                Waiter::Work(tx) => tx.send(outcome.bundle.clone()).map_err(drop),
                Waiter::Notify(tx) => tx.send(()).map_err(drop),
            };
        }
    }

    pub fn queue(&self) -> &WorkQueue<BundleRef> {
        &self.queue
    }
}

/// Resolves once shutdown is requested or every sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::memory::InMemoryStore;

    fn coordinator(store: &Arc<InMemoryStore>, namespace: Option<&str>) -> Arc<Coordinator> {
        let config = ControllerConfig {
            namespace: namespace.map(str::to_string),
            ..ControllerConfig::default()
        };
        let processor = BundleProcessor::builder()
            .with_store(store.clone())
            .with_cache(store.clone())
            .with_config(config.clone())
            .build()
            .unwrap();
        Arc::new(Coordinator::new(Arc::new(processor), store.clone(), &config))
    }

    #[test]
    fn test_enqueue_for_object_maps_controller_to_bundle() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(&store, None);
        let mut bundle = Bundle::new("ns", "app", Vec::new());
        bundle.metadata.uid = Some("uid".to_string());

        let mut object = Object::new("v1", "ConfigMap", "cm");
        object.metadata.namespace = Some("ns".to_string());
        assert_eq!(coordinator.enqueue_for_object(&object), None);

        object.metadata.owner_references.push(bundle.owner_reference());
        assert_eq!(coordinator.enqueue_for_object(&object), Some(BundleRef::new("ns", "app")));
        assert_eq!(coordinator.queue().len(), 1);
    }

    #[test]
    fn test_namespace_filter_drops_foreign_bundles() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(&store, Some("team-a"));
        coordinator.enqueue(BundleRef::new("team-b", "app"));
        assert!(coordinator.queue().is_empty());
        coordinator.enqueue(BundleRef::new("team-a", "app"));
        assert_eq!(coordinator.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_request_outside_namespace_closes_immediately() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(&store, Some("team-a"));
        let reply = coordinator.request_bundle(BundleRef::new("team-b", "app"));
        assert!(reply.await.is_err());
        assert!(coordinator.queue().is_empty());
    }

    #[tokio::test]
    async fn test_notify_outside_namespace_or_missing_closes_immediately() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(&store, Some("team-a"));
        store.insert_bundle(Bundle::new("team-b", "app", Vec::new()));

        assert!(coordinator.notify_on_pass(BundleRef::new("team-b", "app")).await.is_err());
        assert!(coordinator.notify_on_pass(BundleRef::new("team-a", "ghost")).await.is_err());
        assert!(coordinator.waiters().is_empty());
    }

    #[tokio::test]
    async fn test_notify_fires_on_next_pass() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(&store, None);
        let bundle = store.insert_bundle(Bundle::new("ns", "app", Vec::new())).bundle_ref();
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(Arc::clone(&coordinator).run(rx));

        let notified = coordinator.notify_on_pass(bundle.clone());
        assert!(coordinator.queue().is_empty());
        coordinator.enqueue(bundle);
        assert!(notified.await.is_ok());

        tx.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_bundle_closes_request() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(&store, None);
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(Arc::clone(&coordinator).run(rx));

        let reply = coordinator.request_bundle(BundleRef::new("ns", "ghost"));
        assert!(reply.await.is_err());

        tx.send(true).unwrap();
        running.await.unwrap();
    }
}
