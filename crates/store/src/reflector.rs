//! Reflector: drives list -> watch -> resync against a [`Source`] and feeds the delta queue.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use metrics::counter;
use mirra_core::{InformerConfig, Source, SourceError, WatchEvent};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::DeltaQueue;

/// How a single watch attempt ended.
#[derive(Debug)]
enum WatchEnd {
    /// Stream closed by the server or version expired: list again.
    Relist,
    /// Transient failure: re-watch from the last resource version.
    Failed(SourceError),
    Cancelled,
}

pub struct Reflector<S: Source> {
    source: Arc<S>,
    queue: DeltaQueue<S::Object>,
    config: InformerConfig,
    last_rv: Arc<ArcSwapOption<String>>,
}

impl<S: Source> Clone for Reflector<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            queue: self.queue.clone(),
            config: self.config.clone(),
            last_rv: Arc::clone(&self.last_rv),
        }
    }
}

impl<S: Source> Reflector<S> {
    pub fn new(source: Arc<S>, queue: DeltaQueue<S::Object>, config: InformerConfig) -> Self {
        Self { source, queue, config, last_rv: Arc::new(ArcSwapOption::empty()) }
    }

    /// Share the published resource version slot with another owner.
    pub fn with_version_slot(mut self, slot: Arc<ArcSwapOption<String>>) -> Self {
        self.last_rv = slot;
        self
    }

    /// Last resource version seen from a list or watch event.
    pub fn last_sync_resource_version(&self) -> Option<String> {
        self.last_rv.load_full().map(|v| v.as_ref().clone())
    }

    fn record_version(&self, rv: &str) {
        self.last_rv.store(Some(Arc::new(rv.to_string())));
    }

    /// List/watch until `cancel` fires. Errors are retried forever.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoff::new(self.config.backoff_initial, self.config.backoff_max);
        info!("reflector started");
        'list: loop {
            let listed = tokio::select! {
                _ = cancel.cancelled() => break 'list,
                res = self.source.list() => res,
            };
            let mut rv = match listed {
                Ok(list) => {
                    let items = list.items.len();
                    // Applied in full even if cancellation races with it.
                    self.queue.replace(list.items);
                    self.record_version(&list.resource_version);
                    counter!("mirra_relists_total", 1);
                    info!(items, rv = %list.resource_version, "list ok");
                    list.resource_version
                }
                Err(e) => {
                    warn!(error = %e, "list failed; backing off");
                    if !backoff.wait(&cancel).await {
                        break 'list;
                    }
                    continue 'list;
                }
            };

            let mut failures = 0u32;
            loop {
                match self.watch_once(&mut rv, &mut failures, &mut backoff, &cancel).await {
                    WatchEnd::Cancelled => break 'list,
                    WatchEnd::Relist => continue 'list,
                    WatchEnd::Failed(e) => {
                        failures += 1;
                        counter!("mirra_watch_restarts_total", 1);
                        if failures > self.config.watch_retry_budget {
                            warn!(error = %e, failures, "watch retry budget exhausted; relisting");
                            if !backoff.wait(&cancel).await {
                                break 'list;
                            }
                            continue 'list;
                        }
                        warn!(error = %e, attempt = failures, rv = %rv, "watch failed; re-watching");
                        if !backoff.wait(&cancel).await {
                            break 'list;
                        }
                    }
                }
            }
        }
        info!("reflector stopped");
    }

    async fn watch_once(
        &self,
        rv: &mut String,
        failures: &mut u32,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> WatchEnd {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return WatchEnd::Cancelled,
            res = self.source.watch(rv.as_str()) => res,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_stale() => {
                info!(error = %e, rv = %rv, "watch rejected stale version; relisting");
                return WatchEnd::Relist;
            }
            Err(e) => return WatchEnd::Failed(e),
        };
        debug!(rv = %rv, "watch opened");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return WatchEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ev)) => {
                    self.apply(ev, rv);
                    *failures = 0;
                    backoff.reset();
                }
                Some(Err(e)) if e.is_stale() => {
                    info!(error = %e, rv = %rv, "watch version expired; relisting");
                    return WatchEnd::Relist;
                }
                Some(Err(e)) => return WatchEnd::Failed(e),
                None => {
                    debug!(rv = %rv, "watch stream closed by server; relisting");
                    // Reset only by received events, so streams closing at once back off.
                    if !backoff.wait(cancel).await {
                        return WatchEnd::Cancelled;
                    }
                    return WatchEnd::Relist;
                }
            }
        }
    }

    fn apply(&self, ev: WatchEvent<S::Object>, rv: &mut String) {
        if let Some(next) = ev.resource_version() {
            *rv = next.to_string();
        }
        match ev {
            WatchEvent::Added(o) => self.queue.add(Arc::new(o)),
            WatchEvent::Modified(o) => self.queue.update(Arc::new(o)),
            WatchEvent::Deleted(o) => self.queue.delete(Arc::new(o)),
            WatchEvent::Bookmark(_) => {}
        }
        self.record_version(rv);
    }

    /// Periodically re-deliver every committed object until `cancel` fires.
    pub async fn run_resync(&self, cancel: CancellationToken) {
        let period = self.config.resync_period;
        if period.is_zero() {
            debug!("resync disabled");
            return;
        }
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let n = self.queue.resync();
                    debug!(queued = n, "resync tick");
                }
            }
        }
        debug!("resync stopped");
    }
}
