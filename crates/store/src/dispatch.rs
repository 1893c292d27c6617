//! Observer registration and synchronous fan-out of notifications.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::counter;
use tracing::{error, warn};

/// Callbacks invoked by the drain loop. Every method defaults to a no-op.
///
/// A resync delivers `on_update(obj, obj)` with the same object twice;
/// handlers should treat that as "still here", not as a change.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_update(&self, _old: &K, _new: &K) -> anyhow::Result<()> {
        Ok(())
    }

    /// `obj` is the object carried by the delete itself (the watch event's
    /// final state, or the last known object for deletes synthesized by a
    /// relist), not the copy the cache held before removal.
    fn on_delete(&self, _obj: &K) -> anyhow::Result<()> {
        Ok(())
    }
}

type AddFn<K> = Box<dyn Fn(&K) -> anyhow::Result<()> + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) -> anyhow::Result<()> + Send + Sync>;

/// Closure-based handler; any subset of callbacks may be set.
pub struct HandlerFuncs<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<AddFn<K>>,
}

impl<K> Default for HandlerFuncs<K> {
    fn default() -> Self {
        Self { add: None, update: None, delete: None }
    }
}

impl<K> HandlerFuncs<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_add(mut self, f: impl Fn(&K) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(mut self, f: impl Fn(&K, &K) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(mut self, f: impl Fn(&K) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K: Send + Sync> EventHandler<K> for HandlerFuncs<K> {
    fn on_add(&self, obj: &K) -> anyhow::Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &K, new: &K) -> anyhow::Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &K) -> anyhow::Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

/// What observers are told about one drained delta.
#[derive(Debug)]
pub enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> Notification<K> {
    fn name(&self) -> &'static str {
        match self {
            Notification::Add(_) => "add",
            Notification::Update { .. } => "update",
            Notification::Delete(_) => "delete",
        }
    }
}

/// Registered handlers plus the gate serializing delivery with registration.
pub struct Dispatcher<K> {
    handlers: Mutex<Vec<Arc<dyn EventHandler<K>>>>,
}

impl<K> Default for Dispatcher<K> {
    fn default() -> Self {
        Self { handlers: Mutex::new(Vec::new()) }
    }
}

impl<K: Send + Sync + 'static> Dispatcher<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn EventHandler<K>>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `handler`, first replaying `existing` to it as adds.
    ///
    /// Runs under the delivery gate, so the handler sees neither a gap nor a
    /// duplicate relative to deltas drained concurrently.
    pub fn register<I>(&self, handler: Arc<dyn EventHandler<K>>, existing: impl FnOnce() -> I)
    where
        I: IntoIterator<Item = Arc<K>>,
    {
        let mut handlers = self.lock();
        let idx = handlers.len();
        for obj in existing() {
            invoke(idx, &*handler, &Notification::Add(obj));
        }
        handlers.push(handler);
    }

    /// Apply a store mutation and deliver its notification under the gate.
    ///
    /// Returns the number of handlers that failed.
    pub fn deliver<F>(&self, apply: F) -> usize
    where
        F: FnOnce() -> Option<Notification<K>>,
    {
        let handlers = self.lock();
        let Some(n) = apply() else { return 0 };
        let mut failed = 0usize;
        for (i, h) in handlers.iter().enumerate() {
            if !invoke(i, &**h, &n) {
                failed += 1;
            }
        }
        failed
    }
}

// Returns false when the handler failed or panicked.
fn invoke<K>(idx: usize, handler: &dyn EventHandler<K>, n: &Notification<K>) -> bool {
    let res = catch_unwind(AssertUnwindSafe(|| match n {
        Notification::Add(o) => handler.on_add(o),
        Notification::Update { old, new } => handler.on_update(old, new),
        Notification::Delete(o) => handler.on_delete(o),
    }));
    match res {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(handler = idx, event = n.name(), error = %e, "handler failed");
            counter!("mirra_handler_errors_total", 1);
            false
        }
        Err(_) => {
            error!(handler = idx, event = n.name(), "handler panicked");
            counter!("mirra_handler_errors_total", 1);
            false
        }
    }
}
