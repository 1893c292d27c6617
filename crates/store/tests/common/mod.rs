#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use mirra_core::{InformerConfig, Object, ObjectList, Source, SourceError, WatchEvent, WatchStream};
use mirra_store::EventHandler;

pub type EventTx = mpsc::UnboundedSender<Result<WatchEvent<Object>, SourceError>>;

enum WatchScript {
    Open(mpsc::UnboundedReceiver<Result<WatchEvent<Object>, SourceError>>),
    Fail(SourceError),
}

#[derive(Default)]
struct Inner {
    lists: Mutex<VecDeque<Result<ObjectList<Object>, SourceError>>>,
    last_list: Mutex<Option<ObjectList<Object>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    list_calls: AtomicUsize,
    watch_versions: Mutex<Vec<String>>,
}

/// Scripted source: lists and watches are served in the order they were pushed.
///
/// Once the list script runs out the last successful list is repeated; once the
/// watch script runs out watches stay open without events.
#[derive(Clone, Default)]
pub struct FakeSource {
    inner: Arc<Inner>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, items: Vec<Object>, rv: &str) -> &Self {
        self.inner.lists.lock().unwrap().push_back(Ok(ObjectList { items, resource_version: rv.to_string() }));
        self
    }

    pub fn push_list_err(&self, e: SourceError) -> &Self {
        self.inner.lists.lock().unwrap().push_back(Err(e));
        self
    }

    pub fn push_watch(&self) -> EventTx {
        let (tx, rx) = mpsc::unbounded();
        self.inner.watches.lock().unwrap().push_back(WatchScript::Open(rx));
        tx
    }

    pub fn push_watch_err(&self, e: SourceError) -> &Self {
        self.inner.watches.lock().unwrap().push_back(WatchScript::Fail(e));
        self
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_versions(&self) -> Vec<String> {
        self.inner.watch_versions.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Source for FakeSource {
    type Object = Object;

    async fn list(&self) -> Result<ObjectList<Object>, SourceError> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.inner.lists.lock().unwrap().pop_front();
        match next {
            Some(Ok(list)) => {
                *self.inner.last_list.lock().unwrap() = Some(list.clone());
                Ok(list)
            }
            Some(Err(e)) => Err(e),
            None => self
                .inner
                .last_list
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| SourceError::Transient("no list scripted".into())),
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Object>, SourceError> {
        self.inner.watch_versions.lock().unwrap().push(resource_version.to_string());
        let next = self.inner.watches.lock().unwrap().pop_front();
        match next {
            Some(WatchScript::Open(rx)) => Ok(rx.boxed()),
            Some(WatchScript::Fail(e)) => Err(e),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

pub fn obj(ns: &str, name: &str, rv: &str) -> Object {
    Object::new(Some(ns), name, rv)
}

pub fn fast_config() -> InformerConfig {
    InformerConfig {
        resync_period: Duration::ZERO,
        watch_retry_budget: 2,
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
    }
}

/// Handler recording every notification as `kind:name@rv`.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, ev: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == ev)
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl EventHandler<Object> for Recorder {
    fn on_add(&self, obj: &Object) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("add:{}@{}", obj.name, obj.resource_version));
        Ok(())
    }

    fn on_update(&self, old: &Object, new: &Object) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("update:{}@{}->{}", new.name, old.resource_version, new.resource_version));
        Ok(())
    }

    fn on_delete(&self, obj: &Object) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("delete:{}@{}", obj.name, obj.resource_version));
        Ok(())
    }
}

/// Poll `cond` until it holds, panicking after a few seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
