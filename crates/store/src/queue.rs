//! Delta queue: per-key coalescing FIFO between the reflector and the drain loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge};
use mirra_core::{Delta, DeltaKind, ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Store;

struct Inner<K> {
    items: FxHashMap<ObjectKey, Delta<K>>,
    order: VecDeque<ObjectKey>,
    /// True once the first replace completed.
    populated: bool,
    /// Items from the first replace not yet popped and processed.
    initial_population: usize,
    /// Items from the first replace not yet popped.
    initial_unclaimed: usize,
    /// Delta popped but not yet committed by the consumer.
    in_flight: Option<Delta<K>>,
    closed: bool,
}

impl<K> Inner<K> {
    fn in_flight_kind(&self, key: &ObjectKey) -> Option<DeltaKind> {
        self.in_flight.as_ref().filter(|d| &d.key == key).map(|d| d.kind)
    }
}

/// Coalescing queue keyed by object key with FIFO order by first pending occurrence.
///
/// Exactly one consumer is expected; see [`DeltaQueue::pop`].
pub struct DeltaQueue<K> {
    inner: Arc<Mutex<Inner<K>>>,
    notify: Arc<Notify>,
    synced: Arc<watch::Sender<bool>>,
    known: Store<K>,
}

impl<K> Clone for DeltaQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
            synced: Arc::clone(&self.synced),
            known: self.known.clone(),
        }
    }
}

/// Result of combining a pending kind with a newly observed one.
fn combine(pending: DeltaKind, new: DeltaKind) -> Option<DeltaKind> {
    use DeltaKind::*;
    match (pending, new) {
        // Resync never overrides a real pending change.
        (_, Resynced) => None,
        (_, Deleted) => Some(Deleted),
        (Added, Added | Updated) => Some(Added),
        (Updated, Added | Updated) => Some(Updated),
        (Resynced | Deleted, Added | Updated) => Some(Updated),
    }
}

impl<K: Resource> DeltaQueue<K> {
    /// `known` is the store the drain loop commits into; replace and resync read it.
    pub fn new(known: Store<K>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                populated: false,
                initial_population: 0,
                initial_unclaimed: 0,
                in_flight: None,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            synced: Arc::new(synced),
            known,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_locked(inner: &mut Inner<K>, kind: DeltaKind, object: Arc<K>) {
        let key = object.key();
        match inner.items.get_mut(&key) {
            Some(pending) => {
                if let Some(next) = combine(pending.kind, kind) {
                    pending.kind = next;
                    pending.object = object;
                }
            }
            None => {
                inner.order.push_back(key.clone());
                inner.items.insert(key.clone(), Delta { key, kind, object });
            }
        }
    }

    fn push(&self, kind: DeltaKind, object: Arc<K>) {
        {
            let mut g = self.lock();
            Self::push_locked(&mut g, kind, object);
            gauge!("mirra_queue_depth", g.order.len() as f64);
        }
        counter!("mirra_deltas_enqueued_total", 1);
        self.notify.notify_one();
    }

    pub fn add(&self, object: Arc<K>) {
        self.push(DeltaKind::Added, object)
    }

    pub fn update(&self, object: Arc<K>) {
        self.push(DeltaKind::Updated, object)
    }

    pub fn delete(&self, object: Arc<K>) {
        self.push(DeltaKind::Deleted, object)
    }

    /// Bring the queue in line with a full listing.
    ///
    /// Keys known to the store, pending, or in flight but absent from
    /// `objects` get a `Deleted` delta carrying their last known object.
    pub fn replace(&self, objects: Vec<K>) {
        let mut g = self.lock();
        let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
        let count = objects.len();
        for o in objects {
            let key = o.key();
            // An in-flight delta decides what the store holds once it commits.
            let known = match g.in_flight_kind(&key) {
                Some(DeltaKind::Deleted) => false,
                Some(_) => true,
                None => self.known.contains(&key),
            };
            let kind = if known { DeltaKind::Updated } else { DeltaKind::Added };
            listed.insert(key);
            Self::push_locked(&mut g, kind, Arc::new(o));
        }

        let mut candidates: Vec<ObjectKey> = self.known.keys();
        candidates.extend(g.order.iter().cloned());
        candidates.extend(g.in_flight.as_ref().map(|d| d.key.clone()));
        let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut gone: Vec<Arc<K>> = Vec::new();
        for key in candidates {
            if listed.contains(&key) || !seen.insert(key.clone()) {
                continue;
            }
            // Prefer the pending object, then the in-flight one, then the committed one.
            if let Some(p) = g.items.get(&key) {
                if p.kind != DeltaKind::Deleted {
                    gone.push(Arc::clone(&p.object));
                }
                continue;
            }
            match g.in_flight.as_ref().filter(|d| d.key == key) {
                Some(d) if d.kind == DeltaKind::Deleted => {}
                Some(d) => gone.push(Arc::clone(&d.object)),
                None => {
                    if let Some(o) = self.known.get(&key) {
                        gone.push(o);
                    }
                }
            }
        }
        let deletes = gone.len();
        for o in gone {
            Self::push_locked(&mut g, DeltaKind::Deleted, o);
        }

        if !g.populated {
            g.populated = true;
            g.initial_population = g.order.len();
            g.initial_unclaimed = g.order.len();
            if g.initial_population == 0 {
                self.synced.send_replace(true);
            }
        }
        gauge!("mirra_queue_depth", g.order.len() as f64);
        debug!(listed = count, deletes, pending = g.order.len(), "queue replaced");
        drop(g);
        self.notify.notify_one();
    }

    /// Enqueue a `Resynced` delta for every committed object.
    ///
    /// Keys that already have a pending or in-flight delta are left as they are.
    pub fn resync(&self) -> usize {
        let mut g = self.lock();
        let mut n = 0usize;
        for key in self.known.keys() {
            if g.items.contains_key(&key) || g.in_flight_kind(&key).is_some() {
                continue;
            }
            if let Some(o) = self.known.get(&key) {
                Self::push_locked(&mut g, DeltaKind::Resynced, o);
                n += 1;
            }
        }
        gauge!("mirra_queue_depth", g.order.len() as f64);
        drop(g);
        if n > 0 {
            self.notify.notify_one();
        }
        n
    }

    /// Wait for the oldest pending delta and run `process` on it.
    ///
    /// `process` runs outside the queue lock and must commit the delta to the
    /// store before returning; until then the key counts as in flight for
    /// `replace` and `resync`. Returns `None` once `cancel` fires or the queue
    /// is closed while empty.
    pub async fn pop<F, R>(&self, cancel: &CancellationToken, process: F) -> Option<R>
    where
        F: FnOnce(Delta<K>) -> R,
    {
        let (delta, initial) = loop {
            {
                let mut g = self.lock();
                if let Some(key) = g.order.pop_front() {
                    if let Some(d) = g.items.remove(&key) {
                        gauge!("mirra_queue_depth", g.order.len() as f64);
                        let initial = g.initial_unclaimed > 0;
                        if initial {
                            g.initial_unclaimed -= 1;
                        }
                        g.in_flight = Some(d.clone());
                        break (d, initial);
                    }
                    continue;
                }
                if g.closed {
                    return None;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        };

        let out = process(delta);

        let mut g = self.lock();
        g.in_flight = None;
        if initial && g.initial_population > 0 {
            g.initial_population -= 1;
            if g.initial_population == 0 {
                self.synced.send_replace(true);
            }
        }
        Some(out)
    }

    /// True once the first replace was fully drained.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Wake the consumer; `pop` returns `None` once the queue is empty.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently pending, oldest first.
    pub fn pending_keys(&self) -> Vec<ObjectKey> {
        self.lock().order.iter().cloned().collect()
    }
}
