//! Quota-gated eviction.
//!
//! Expired leases and failed ingestion streams do not remove data directly.
//! They queue [`EvictionItem`]s, and the [`EvictionWorker`] removes them
//! one permit at a time as the [`EvictionQuotaKeeper`] allows.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info};
use tokio::sync::mpsc;

use super::{EvictionOutcome, Registry};
use crate::model::Source;
use crate::quota::{EvictionQuotaKeeper, QuotaStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    LeaseExpired,
    /// Scheduled explicitly, e.g. after an ingestion stream failed.
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionItem {
    pub id: String,
    pub source: Source,
    pub reason: EvictionReason,
}

impl EvictionItem {
    pub fn new(id: String, source: Source, reason: EvictionReason) -> Self {
        Self { id, source, reason }
    }

    fn key(&self) -> (String, Source) {
        (self.id.clone(), self.source.clone())
    }
}

pub struct EvictionQueue {
    rx: mpsc::UnboundedReceiver<EvictionItem>,
}

impl EvictionQueue {
    pub(super) fn new(rx: mpsc::UnboundedReceiver<EvictionItem>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<EvictionItem> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<EvictionItem> {
        self.rx.try_recv().ok()
    }
}

/// Drains the eviction queue under the quota keeper's control.
///
/// One permit is requested per queued item. Items whose removal turns out
/// not to shrink the registry (stale or fragment) hand their request back;
/// every other item waits for a permit.
pub struct EvictionWorker {
    registry: Arc<Registry>,
    queue: EvictionQueue,
    quota: QuotaStream,
    backlog: VecDeque<EvictionItem>,
    queued: HashSet<(String, Source)>,
    permits: u64,
}

impl EvictionWorker {
    pub fn new(
        registry: Arc<Registry>,
        queue: EvictionQueue,
        keeper: &EvictionQuotaKeeper,
    ) -> Self {
        Self {
            registry,
            queue,
            quota: keeper.quota(),
            backlog: VecDeque::new(),
            queued: HashSet::new(),
            permits: 0,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                item = self.queue.recv() => {
                    let Some(item) = item else { break };
                    let mut accepted = u64::from(self.accept(item));
                    while let Some(item) = self.queue.try_next() {
                        accepted += u64::from(self.accept(item));
                    }
                    self.quota.request(accepted);
                    self.drain();
                }
                grant = self.quota.next() => {
                    let Some(permits) = grant else { break };
                    self.permits += permits;
                    self.drain();
                }
            }
        }
        debug!("eviction worker stopped with {} items queued", self.backlog.len());
    }

    fn accept(&mut self, item: EvictionItem) -> bool {
        if !self.queued.insert(item.key()) {
            return false;
        }
        self.backlog.push_back(item);
        true
    }

    fn drain(&mut self) {
        while let Some(item) = self.backlog.front() {
            match self.registry.try_evict(item, self.permits > 0) {
                EvictionOutcome::NeedsPermit => break,
                EvictionOutcome::Evicted => self.permits -= 1,
                EvictionOutcome::Stale | EvictionOutcome::Fragment => {
                    if self.quota.cancel(1) == 0 {
                        // the request was already granted and received
                        self.permits = self.permits.saturating_sub(1);
                    }
                }
            }
            if let Some(done) = self.backlog.pop_front() {
                self.queued.remove(&done.key());
            }
        }
    }
}

/// Queues expired leases every `interval`.
pub async fn run_expiry_sweep(registry: Arc<Registry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let expired = registry.expire_leases();
        if expired > 0 {
            info!("{} expired leases queued for eviction", expired);
        }
    }
}
