//! Informer: wires reflector, queue, store and dispatcher together.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use metrics::counter;
use mirra_core::{Delta, DeltaKind, InformerConfig, Resource, Source};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, EventHandler, Notification};
use crate::{DeltaQueue, Lister, Reflector, Store};

/// Local mirror of one remote collection.
///
/// Reads go through [`Informer::lister`]; changes reach handlers registered
/// with [`Informer::add_handler`].
pub struct Informer<S: Source> {
    source: Arc<S>,
    config: InformerConfig,
    store: Store<S::Object>,
    queue: DeltaQueue<S::Object>,
    dispatcher: Arc<Dispatcher<S::Object>>,
    last_rv: Arc<ArcSwapOption<String>>,
}

impl<S: Source> Informer<S> {
    pub fn new(source: S, config: InformerConfig) -> Self {
        let store = Store::new();
        let queue = DeltaQueue::new(store.clone());
        Self {
            source: Arc::new(source),
            config,
            store,
            queue,
            dispatcher: Arc::new(Dispatcher::new()),
            last_rv: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Register an observer. Objects already cached are replayed to it as adds.
    pub fn add_handler(&self, handler: impl EventHandler<S::Object> + 'static) {
        self.add_shared_handler(Arc::new(handler))
    }

    pub fn add_shared_handler(&self, handler: Arc<dyn EventHandler<S::Object>>) {
        let store = self.store.clone();
        self.dispatcher.register(handler, move || store.list(|_| true));
        debug!(handlers = self.dispatcher.len(), "handler registered");
    }

    pub fn lister(&self) -> Lister<S::Object> {
        Lister::new(self.store.clone())
    }

    pub fn store(&self) -> Store<S::Object> {
        self.store.clone()
    }

    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Deltas waiting to be drained.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn last_sync_resource_version(&self) -> Option<String> {
        self.last_rv.load_full().map(|v| v.as_ref().clone())
    }

    pub fn config(&self) -> &InformerConfig {
        &self.config
    }

    /// Spawn the reflector, resync and drain tasks. All stop when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> InformerHandle {
        let reflector = Reflector::new(Arc::clone(&self.source), self.queue.clone(), self.config.clone())
            .with_version_slot(Arc::clone(&self.last_rv));
        info!(resync_secs = self.config.resync_period.as_secs(), "informer starting");

        let list_watch = tokio::spawn({
            let reflector = reflector.clone();
            let cancel = cancel.clone();
            async move { reflector.run(cancel).await }
        });
        let resync = tokio::spawn({
            let cancel = cancel.clone();
            async move { reflector.run_resync(cancel).await }
        });
        let drain = tokio::spawn({
            let queue = self.queue.clone();
            let store = self.store.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let cancel = cancel.clone();
            async move {
                debug!("drain loop started");
                while !cancel.is_cancelled() {
                    if queue.pop(&cancel, |d| process(&store, &dispatcher, d)).await.is_none() {
                        break;
                    }
                }
                debug!("drain loop stopped");
            }
        });

        InformerHandle { cancel, tasks: vec![list_watch, resync, drain] }
    }

    /// Block until the first full listing has been drained into the store.
    ///
    /// Returns false if `cancel` fires first.
    pub async fn wait_for_initial_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.queue.subscribe_synced();
        tokio::select! {
            biased;
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }
}

/// Commit one delta to the store and notify handlers.
fn process<K: Resource>(store: &Store<K>, dispatcher: &Dispatcher<K>, delta: Delta<K>) {
    let Delta { key, kind, object } = delta;
    let failed = dispatcher.deliver(|| match kind {
        DeltaKind::Deleted => match store.delete(&key) {
            Some(_) => Some(Notification::Delete(object)),
            None => {
                debug!(key = %key, "delete for uncached key; nothing to notify");
                None
            }
        },
        DeltaKind::Added | DeltaKind::Updated | DeltaKind::Resynced => match store.upsert(Arc::clone(&object)) {
            Some(old) => Some(Notification::Update { old, new: object }),
            None => Some(Notification::Add(object)),
        },
    });
    counter!("mirra_deltas_processed_total", 1);
    if failed > 0 {
        debug!(key = %key, ?kind, failed, "delta delivered with handler failures");
    }
}

/// Running informer tasks.
pub struct InformerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl InformerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "informer task failed");
            }
        }
    }

    pub async fn stop(self) {
        self.cancel();
        self.join().await;
    }
}
