//! Interest indexes.
//!
//! The index registry sits behind the registry's mutation path. It keeps a
//! materialized view of every instance's current snapshot so that a new
//! subscription can be answered with a consistent initial state, and one
//! [`Index`] per distinct (interest, source filter) pair that turns the
//! registry's change notifications into that subscription's live stream.

use std::collections::HashMap;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::interest::Interest;
use crate::model::{InstanceRecord, Source, SourceMatcher};
use crate::notification::{
    ChangeNotification, ChannelStream, SourcedChangeNotification, StreamNotification,
};

/// Snapshot entries tagged `Snapshot`, a live `BufferSentinel`, then live
/// updates.
pub type InterestStream = ChannelStream<StreamNotification<InstanceRecord>>;

type Subscriber = mpsc::UnboundedSender<StreamNotification<InstanceRecord>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    interest: Interest,
    sources: SourceMatcher,
}

#[derive(Default)]
pub(crate) struct IndexRegistry {
    full: HashMap<String, (InstanceRecord, Source)>,
    indexes: HashMap<IndexKey, Index>,
    closed: bool,
}

struct Index {
    interest: Interest,
    sources: SourceMatcher,
    matched: HashMap<String, (InstanceRecord, Source)>,
    subscribers: Vec<Subscriber>,
}

impl IndexRegistry {
    pub(crate) fn subscribe(
        &mut self,
        interest: Interest,
        sources: SourceMatcher,
    ) -> InterestStream {
        if self.closed || interest == Interest::EmptyRegistry {
            return ChannelStream::closed();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let full = &self.full;
        let key = IndexKey {
            interest: interest.clone(),
            sources: sources.clone(),
        };
        let index = self.indexes.entry(key).or_insert_with(|| {
            debug!("creating index for {}", interest);
            Index::seeded(interest, sources, full)
        });

        let mut snapshot: Vec<_> = index.matched.values().collect();
        snapshot.sort_by(|(a, _), (b, _)| a.id().cmp(b.id()));
        for (record, source) in snapshot {
            let added = ChangeNotification::Add(record.clone());
            let _ = tx.send(StreamNotification::snapshot(Some(source.clone()), added));
        }
        let _ = tx.send(StreamNotification::live_sentinel());

        index.subscribers.push(tx);
        ChannelStream::new(rx)
    }

    pub(crate) fn dispatch(&mut self, notifications: &[SourcedChangeNotification<InstanceRecord>]) {
        if self.closed {
            return;
        }
        for sourced in notifications {
            let known = match &sourced.notification {
                ChangeNotification::Add(data) | ChangeNotification::Modify { data, .. } => {
                    let entry = (data.clone(), sourced.source.clone());
                    self.full.insert(data.id().to_owned(), entry).is_some()
                }
                ChangeNotification::Delete(data) => self.full.remove(data.id()).is_some(),
                ChangeNotification::BufferSentinel => true,
            };
            for index in self.indexes.values_mut() {
                index.apply(sourced, known);
            }
        }

        self.indexes.retain(|key, index| {
            index.subscribers.retain(|tx| !tx.is_closed());
            if index.subscribers.is_empty() {
                debug!("dropping index for {}: no subscribers left", key.interest);
            }
            !index.subscribers.is_empty()
        });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.indexes.values().map(|index| index.subscribers.len()).sum()
    }

    /// Ends every subscription stream and refuses new ones.
    pub(crate) fn shutdown(&mut self) {
        self.closed = true;
        self.indexes.clear();
        self.full.clear();
    }
}

impl Index {
    fn seeded(
        interest: Interest,
        sources: SourceMatcher,
        full: &HashMap<String, (InstanceRecord, Source)>,
    ) -> Self {
        let matched = full
            .iter()
            .filter(|(_, (record, source))| sources.matches(source) && interest.matches(record))
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        Self {
            interest,
            sources,
            matched,
            subscribers: Vec::new(),
        }
    }

    /// `known` tells whether the instance existed in the registry before
    /// this notification, so a Modify for an instance nobody ever added can
    /// be told apart from one that merely starts to match.
    fn apply(&mut self, sourced: &SourcedChangeNotification<InstanceRecord>, known: bool) {
        let source = &sourced.source;
        if !self.sources.matches(source) {
            return;
        }

        let forwarded = match &sourced.notification {
            ChangeNotification::Add(data) => {
                if self.interest.matches(data) {
                    self.matched
                        .insert(data.id().to_owned(), (data.clone(), source.clone()));
                    Some(sourced.notification.clone())
                } else {
                    self.matched
                        .remove(data.id())
                        .map(|_| ChangeNotification::Delete(data.clone()))
                }
            }
            ChangeNotification::Modify { data, .. } => {
                if self.interest.matches(data) {
                    let entry = (data.clone(), source.clone());
                    if self.matched.insert(data.id().to_owned(), entry).is_some() {
                        Some(sourced.notification.clone())
                    } else {
                        if known {
                            debug!("{} now matches {}", data.id(), self.interest);
                        } else {
                            warn!(
                                "modify for {} from {} without a prior add; sending it as an add",
                                data.id(),
                                source
                            );
                        }
                        Some(ChangeNotification::Add(data.clone()))
                    }
                } else {
                    self.matched
                        .remove(data.id())
                        .map(|_| ChangeNotification::Delete(data.clone()))
                }
            }
            ChangeNotification::Delete(data) => self
                .matched
                .remove(data.id())
                .map(|_| sourced.notification.clone()),
            ChangeNotification::BufferSentinel => Some(ChangeNotification::BufferSentinel),
        };

        if let Some(notification) = forwarded {
            let live = StreamNotification::live(Some(source.clone()), notification);
            self.subscribers.retain(|tx| tx.send(live.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Origin, Status};
    use crate::notification::StreamState;
    use futures_util::{FutureExt, StreamExt};

    fn local() -> Source {
        Source::new(Origin::Local, "node", 1)
    }

    fn record(id: &str, app: &str) -> InstanceRecord {
        InstanceRecord::builder(id).app(app).status(Status::Up).build()
    }

    fn sourced(
        notification: ChangeNotification<InstanceRecord>,
    ) -> SourcedChangeNotification<InstanceRecord> {
        SourcedChangeNotification::new(local(), notification)
    }

    fn drain(stream: &mut InterestStream) -> Vec<StreamNotification<InstanceRecord>> {
        let mut items = Vec::new();
        while let Some(Some(item)) = stream.next().now_or_never() {
            items.push(item);
        }
        items
    }

    #[test]
    fn snapshot_precedes_live_marker() {
        let mut registry = IndexRegistry::default();
        registry.dispatch(&[
            sourced(ChangeNotification::Add(record("a", "web"))),
            sourced(ChangeNotification::Add(record("b", "db"))),
        ]);

        let mut stream = registry.subscribe(Interest::application("web"), SourceMatcher::Any);
        let items = drain(&mut stream);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].state, StreamState::Snapshot);
        assert_eq!(items[0].notification.data().map(InstanceRecord::id), Some("a"));
        assert!(items[1].is_live_sentinel());
    }

    #[test]
    fn leaving_the_interest_emits_delete() {
        let mut registry = IndexRegistry::default();
        let mut stream = registry.subscribe(Interest::application("web"), SourceMatcher::Any);
        drain(&mut stream);

        let web = record("a", "web");
        let db = web.to_builder().app("db").build();
        registry.dispatch(&[
            sourced(ChangeNotification::Add(web.clone())),
            sourced(ChangeNotification::Modify {
                data: db.clone(),
                deltas: db.diff_older(&web),
            }),
            sourced(ChangeNotification::Delete(db)),
        ]);

        let items = drain(&mut stream);
        let kinds: Vec<_> = items
            .iter()
            .map(|n| matches!(n.notification, ChangeNotification::Delete(_)))
            .collect();
        assert_eq!(kinds, [false, true]);
        assert!(items.iter().all(|n| n.state == StreamState::Live));
    }

    #[test]
    fn modify_into_the_interest_arrives_as_add() {
        let mut registry = IndexRegistry::default();
        let db = record("a", "db");
        registry.dispatch(&[sourced(ChangeNotification::Add(db.clone()))]);

        let mut stream = registry.subscribe(Interest::application("web"), SourceMatcher::Any);
        assert_eq!(drain(&mut stream).len(), 1);

        let web = db.to_builder().app("web").build();
        registry.dispatch(&[sourced(ChangeNotification::Modify {
            data: web.clone(),
            deltas: web.diff_older(&db),
        })]);

        let items = drain(&mut stream);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].notification, ChangeNotification::Add(web));
    }

    #[test]
    fn source_filter_hides_other_origins() {
        let mut registry = IndexRegistry::default();
        let mut stream =
            registry.subscribe(Interest::FullRegistry, SourceMatcher::Origin(Origin::Local));
        drain(&mut stream);

        let peer = Source::new(Origin::Replicated, "peer", 3);
        registry.dispatch(&[
            SourcedChangeNotification::new(peer, ChangeNotification::Add(record("r", "web"))),
            sourced(ChangeNotification::Add(record("l", "web"))),
        ]);

        let items = drain(&mut stream);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source, Some(local()));
    }

    #[test]
    fn dropped_subscribers_release_their_index() {
        let mut registry = IndexRegistry::default();
        let stream = registry.subscribe(Interest::application("web"), SourceMatcher::Any);
        assert_eq!(registry.subscriber_count(), 1);

        drop(stream);
        registry.dispatch(&[sourced(ChangeNotification::Add(record("a", "db")))]);
        assert_eq!(registry.subscriber_count(), 0);
        assert!(registry.indexes.is_empty());
    }

    #[test]
    fn empty_interest_stream_ends_at_once() {
        let mut registry = IndexRegistry::default();
        let mut stream = registry.subscribe(Interest::EmptyRegistry, SourceMatcher::Any);
        assert_eq!(stream.next().now_or_never(), Some(None));
        assert!(registry.indexes.is_empty());
    }
}
