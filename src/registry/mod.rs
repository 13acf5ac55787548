//! The multi-sourced instance registry.
//!
//! Instances are kept per id in a [`DashMap`], so writes to one id are
//! serialized by the shard lock while writes to different ids proceed in
//! parallel. Each mutation computes its notifications while holding the
//! shard lock and hands them to the index registry before releasing it, so
//! subscribers observe the changes of a single id in the order they were
//! made.
//!
//! Lock order is always shard, then index registry.

use std::fmt::Display;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::RegistryError;
use crate::interest::Interest;
use crate::model::{InstanceRecord, LeaseTerms, Source, SourceMatcher};
use crate::notification::{ChangeNotification, SourcedChangeNotification};

pub mod eviction;
mod holder;
mod index;

pub use eviction::{run_expiry_sweep, EvictionItem, EvictionQueue, EvictionReason, EvictionWorker};
pub use holder::RegistryStatus;
pub use index::InterestStream;

use holder::Holder;
use index::IndexRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Terms given to leased registrations that do not bring their own.
    pub lease: LeaseTerms,
}

/// Per-instance summary for an admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct HolderDiagnostics {
    pub id: String,
    pub snapshot_source: Source,
    pub sources: Vec<Source>,
    pub leases: Vec<Option<LeaseTerms>>,
}

/// What happened to a queued eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Nothing to do: the copy is gone or its lease was renewed.
    Stale,
    /// The copy was removed but the instance lives on through other sources.
    Fragment,
    /// The last copy was removed, shrinking the registry.
    Evicted,
    /// Removing the copy would shrink the registry and no permit was held.
    NeedsPermit,
}

pub struct Registry {
    holders: DashMap<String, Holder>,
    index: Mutex<IndexRegistry>,
    size: watch::Sender<usize>,
    evictions: mpsc::UnboundedSender<EvictionItem>,
    config: RegistryConfig,
}

impl Registry {
    /// Creates the registry together with the queue its quota-gated
    /// evictions are delivered to.
    pub fn new(config: RegistryConfig) -> (Arc<Registry>, EvictionQueue) {
        let (size, _) = watch::channel(0);
        let (evictions, queue) = mpsc::unbounded_channel();
        let registry = Registry {
            holders: DashMap::new(),
            index: Mutex::new(IndexRegistry::default()),
            size,
            evictions,
            config,
        };
        (Arc::new(registry), EvictionQueue::new(queue))
    }

    /// Registers `record` for `source`, with the default lease if the
    /// source's origin is leased.
    pub fn register(&self, record: InstanceRecord, source: Source) -> RegistryStatus {
        let terms = source.origin().is_leased().then_some(self.config.lease);
        self.store(record, source, terms)
    }

    /// Registers `record` with explicit lease terms. Terms are ignored for
    /// origins that are not leased.
    pub fn register_with_lease(
        &self,
        record: InstanceRecord,
        source: Source,
        terms: LeaseTerms,
    ) -> RegistryStatus {
        let terms = source.origin().is_leased().then_some(terms);
        self.store(record, source, terms)
    }

    fn store(
        &self,
        record: InstanceRecord,
        source: Source,
        terms: Option<LeaseTerms>,
    ) -> RegistryStatus {
        let status = {
            let mut holder = self.holders.entry(record.id().to_owned()).or_default();
            let (status, notifications) = holder.update(source, record, terms);
            self.dispatch(&notifications);
            status
        };
        if status == RegistryStatus::AddedFirst {
            self.publish_size();
        }
        status
    }

    pub fn unregister(&self, id: &str, source: &Source) -> RegistryStatus {
        let status = match self.holders.entry(id.to_owned()) {
            Entry::Vacant(_) => RegistryStatus::NotFound,
            Entry::Occupied(mut entry) => {
                let (status, notifications) = entry.get_mut().remove(source);
                self.dispatch(&notifications);
                if entry.get().is_empty() {
                    entry.remove();
                }
                status
            }
        };
        if status == RegistryStatus::RemovedLast {
            self.publish_size();
        }
        status
    }

    /// Renews the lease of `source`'s copy. Copies without a lease are
    /// reported as found and left alone.
    pub fn renew_lease(&self, id: &str, source: &Source) -> bool {
        self.holders
            .get_mut(id)
            .is_some_and(|mut holder| holder.renew(source))
    }

    /// Folds an ingestion stream into the registry under `source`.
    ///
    /// Returns when the stream ends. A graceful end removes every copy the
    /// source contributed; a failure routes them through the quota-gated
    /// eviction queue instead, so a quick reconnect does not make the
    /// instances flap.
    pub async fn connect<S, E>(&self, source: Source, notifications: S) -> Result<(), RegistryError>
    where
        S: Stream<Item = Result<ChangeNotification<InstanceRecord>, E>>,
        E: Display,
    {
        info!("ingestion stream from {} connected", source);
        futures_util::pin_mut!(notifications);

        while let Some(next) = notifications.next().await {
            match next {
                Ok(ChangeNotification::Add(record))
                | Ok(ChangeNotification::Modify { data: record, .. }) => {
                    self.register(record, source.clone());
                }
                Ok(ChangeNotification::Delete(record)) => {
                    if self.unregister(record.id(), &source) == RegistryStatus::NotFound {
                        debug!("{} deleted unknown instance {}", source, record.id());
                    }
                }
                Ok(ChangeNotification::BufferSentinel) => {
                    let sentinel = SourcedChangeNotification::new(
                        source.clone(),
                        ChangeNotification::BufferSentinel,
                    );
                    self.index.lock().dispatch(&[sentinel]);
                }
                Err(e) => {
                    warn!("ingestion stream from {} failed: {}", source, e);
                    let scheduled = self.schedule_eviction(&SourceMatcher::Exact(source.clone()));
                    debug!("scheduled {} copies from {} for eviction", scheduled, source);
                    return Err(RegistryError::Ingestion {
                        from: source,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let removed = self.evict_all(&SourceMatcher::Exact(source.clone()));
        info!("ingestion stream from {} completed; removed {} copies", source, removed);
        Ok(())
    }

    pub fn for_interest(&self, interest: Interest) -> InterestStream {
        self.for_interest_from(interest, SourceMatcher::Any)
    }

    /// Like [`for_interest`](Self::for_interest), but only for snapshots
    /// contributed by sources that match `sources`.
    pub fn for_interest_from(&self, interest: Interest, sources: SourceMatcher) -> InterestStream {
        self.index.lock().subscribe(interest, sources)
    }

    /// Current snapshots matching `interest`, ordered by id.
    pub fn snapshot(&self, interest: &Interest) -> Vec<InstanceRecord> {
        let mut records: Vec<InstanceRecord> = self
            .holders
            .iter()
            .filter_map(|holder| holder.head().map(|copy| copy.record.clone()))
            .filter(|record| interest.matches(record))
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    pub fn get(&self, id: &str) -> Option<InstanceRecord> {
        self.holders
            .get(id)
            .and_then(|holder| holder.head().map(|copy| copy.record.clone()))
    }

    pub fn size(&self) -> usize {
        *self.size.borrow()
    }

    pub fn size_stream(&self) -> watch::Receiver<usize> {
        self.size.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.index.lock().subscriber_count()
    }

    /// Removes every copy whose source matches, bypassing the eviction
    /// quota. Returns the number of copies removed.
    pub fn evict_all(&self, matcher: &SourceMatcher) -> usize {
        let mut removed = 0;
        for id in self.ids() {
            let Entry::Occupied(mut entry) = self.holders.entry(id) else {
                continue;
            };
            let sources: Vec<Source> = entry
                .get()
                .copies()
                .iter()
                .map(|copy| copy.source.clone())
                .filter(|source| matcher.matches(source))
                .collect();
            for source in sources {
                let (_, notifications) = entry.get_mut().remove(&source);
                self.dispatch(&notifications);
                removed += 1;
            }
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        if removed > 0 {
            self.publish_size();
        }
        removed
    }

    /// Queues every copy whose source matches for quota-gated eviction.
    /// Returns the number of copies queued.
    pub fn schedule_eviction(&self, matcher: &SourceMatcher) -> usize {
        let items: Vec<EvictionItem> = self
            .holders
            .iter()
            .flat_map(|holder| {
                let id = holder.key().clone();
                holder
                    .copies()
                    .iter()
                    .filter(|copy| matcher.matches(&copy.source))
                    .map(|copy| {
                        let reason = EvictionReason::Requested;
                        EvictionItem::new(id.clone(), copy.source.clone(), reason)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        self.enqueue(items)
    }

    /// Queues every copy whose lease has expired. Returns the number of
    /// copies queued.
    pub fn expire_leases(&self) -> usize {
        let items: Vec<EvictionItem> = self
            .holders
            .iter()
            .flat_map(|holder| {
                let id = holder.key().clone();
                holder
                    .expired_sources()
                    .into_iter()
                    .map(|source| {
                        EvictionItem::new(id.clone(), source, EvictionReason::LeaseExpired)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        self.enqueue(items)
    }

    /// Carries out one queued eviction. The last copy of an instance is
    /// only removed when `permit` is held.
    pub fn try_evict(&self, item: &EvictionItem, permit: bool) -> EvictionOutcome {
        let outcome = match self.holders.entry(item.id.clone()) {
            Entry::Vacant(_) => EvictionOutcome::Stale,
            Entry::Occupied(mut entry) => {
                let still_due = entry.get().copy_from(&item.source).is_some_and(|copy| {
                    match item.reason {
                        EvictionReason::Requested => true,
                        EvictionReason::LeaseExpired => {
                            copy.lease.as_ref().is_some_and(|lease| lease.is_expired())
                        }
                    }
                });
                if !still_due {
                    EvictionOutcome::Stale
                } else if entry.get().len() == 1 && !permit {
                    EvictionOutcome::NeedsPermit
                } else {
                    let (status, notifications) = entry.get_mut().remove(&item.source);
                    self.dispatch(&notifications);
                    if entry.get().is_empty() {
                        entry.remove();
                    }
                    match status {
                        RegistryStatus::RemovedLast => EvictionOutcome::Evicted,
                        _ => EvictionOutcome::Fragment,
                    }
                }
            }
        };
        if outcome == EvictionOutcome::Evicted {
            info!("evicted {} ({}, {:?})", item.id, item.source, item.reason);
            self.publish_size();
        }
        outcome
    }

    pub fn diagnostics(&self) -> Vec<HolderDiagnostics> {
        let mut diagnostics: Vec<HolderDiagnostics> = self
            .holders
            .iter()
            .filter_map(|holder| {
                let head = holder.head()?;
                Some(HolderDiagnostics {
                    id: holder.key().clone(),
                    snapshot_source: head.source.clone(),
                    sources: holder.copies().iter().map(|c| c.source.clone()).collect(),
                    leases: holder.copies().iter().map(|c| c.lease.map(|l| l.terms())).collect(),
                })
            })
            .collect();
        diagnostics.sort_by(|a, b| a.id.cmp(&b.id));
        diagnostics
    }

    /// Ends every interest stream. The registry keeps its data but stops
    /// accepting subscriptions.
    pub fn shutdown(&self) {
        self.index.lock().shutdown();
        info!("registry shut down with {} instances", self.size());
    }

    fn ids(&self) -> Vec<String> {
        self.holders.iter().map(|holder| holder.key().clone()).collect()
    }

    fn enqueue(&self, items: Vec<EvictionItem>) -> usize {
        let mut queued = 0;
        for item in items {
            if self.evictions.send(item).is_err() {
                warn!("eviction queue is closed; dropping scheduled evictions");
                break;
            }
            queued += 1;
        }
        queued
    }

    fn dispatch(&self, notifications: &[SourcedChangeNotification<InstanceRecord>]) {
        if !notifications.is_empty() {
            self.index.lock().dispatch(notifications);
        }
    }

    /// Must not be called while holding a shard lock: `len` visits every
    /// shard. The count is taken under the watch lock so concurrent
    /// publishers cannot overwrite a newer count with an older one.
    fn publish_size(&self) {
        self.size.send_if_modified(|size| {
            let len = self.holders.len();
            let changed = *size != len;
            *size = len;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Origin, Status};
    use crate::notification::StreamNotification;
    use futures_util::{stream, FutureExt};

    fn record(id: &str, status: Status) -> InstanceRecord {
        InstanceRecord::builder(id).app("web").status(status).build()
    }

    fn drain(stream: &mut InterestStream) -> Vec<StreamNotification<InstanceRecord>> {
        let mut items = Vec::new();
        while let Some(Some(item)) = stream.next().now_or_never() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn repeated_registration_is_idempotent() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let local = Source::new(Origin::Local, "i-1", 1);
        let mut stream = registry.for_interest(Interest::FullRegistry);
        drain(&mut stream);

        let up = record("i-1", Status::Up);
        assert_eq!(registry.register(up.clone(), local.clone()), RegistryStatus::AddedFirst);
        assert_eq!(registry.register(up, local), RegistryStatus::AddedChange);

        assert_eq!(registry.size(), 1);
        assert_eq!(drain(&mut stream).len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let local = Source::new(Origin::Local, "i-1", 1);
        assert_eq!(registry.unregister("nope", &local), RegistryStatus::NotFound);
        assert!(!registry.renew_lease("nope", &local));
    }

    #[tokio::test]
    async fn graceful_disconnect_removes_the_sources_copies() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let peer = Source::new(Origin::Replicated, "peer", 1);
        let updates = stream::iter(vec![
            Ok::<_, std::io::Error>(ChangeNotification::Add(record("a", Status::Up))),
            Ok(ChangeNotification::Add(record("b", Status::Up))),
            Ok(ChangeNotification::Delete(record("a", Status::Up))),
        ]);

        let mut sizes = registry.size_stream();
        registry.connect(peer, updates).await.unwrap();
        assert_eq!(registry.size(), 0);
        assert!(sizes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn failed_stream_schedules_eviction_instead_of_deleting() {
        let (registry, mut queue) = Registry::new(RegistryConfig::default());
        let peer = Source::new(Origin::Replicated, "peer", 1);
        let updates = stream::iter(vec![
            Ok(ChangeNotification::Add(record("a", Status::Up))),
            Err("connection reset"),
        ]);

        let err = registry.connect(peer.clone(), updates).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(registry.size(), 1);

        let item = queue.try_next().expect("queued eviction");
        assert_eq!(item.source, peer);
        assert_eq!(registry.try_evict(&item, false), EvictionOutcome::NeedsPermit);
        assert_eq!(registry.try_evict(&item, true), EvictionOutcome::Evicted);
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn prior_generations_are_flushed() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let old = Source::new(Origin::Replicated, "peer", 1);
        let other = Source::new(Origin::Replicated, "other", 1);
        let current = Source::new(Origin::Replicated, "peer", 2);

        registry.register(record("a", Status::Up), old.clone());
        registry.register(record("b", Status::Up), other);
        registry.register(record("b", Status::Up), old);

        assert_eq!(registry.evict_all(&SourceMatcher::PriorGenerations(current)), 2);
        assert_eq!(registry.size(), 1);
        assert!(registry.get("b").is_some());
    }

    #[tokio::test]
    async fn diagnostics_list_every_source() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let local = Source::new(Origin::Local, "i-1", 1);
        let peer = Source::new(Origin::Replicated, "peer", 1);
        registry.register(record("i-1", Status::Up), peer.clone());
        registry.register(record("i-1", Status::Up), local.clone());

        let diagnostics = registry.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].snapshot_source, local);
        assert_eq!(diagnostics[0].sources, vec![local, peer]);
        assert!(serde_json::to_string(&diagnostics).unwrap().contains("\"id\":\"i-1\""));
    }

    #[test]
    fn size_settles_on_the_final_count_under_concurrent_writers() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        std::thread::scope(|scope| {
            for writer in 0..8 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..50 {
                        let id = format!("w{writer}-{i}");
                        let source = Source::new(Origin::Local, id.as_str(), 1);
                        registry.register(record(&id, Status::Up), source.clone());
                        if i % 5 == 0 {
                            registry.unregister(&id, &source);
                        }
                    }
                });
            }
        });
        assert_eq!(registry.size(), 8 * 40);
        assert_eq!(registry.size(), registry.holders.len());
    }

    #[tokio::test]
    async fn shutdown_ends_subscriptions() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let mut stream = registry.for_interest(Interest::FullRegistry);
        registry.shutdown();

        let items: Vec<_> = (&mut stream).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_live_sentinel());
    }
}
