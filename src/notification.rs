//! Change notifications.
//!
//! Every mutation of the registry, and every change of a resolved cluster
//! topology, is described as a [`ChangeNotification`]. Subscribers receive
//! them wrapped in a [`StreamNotification`] that says whether the entry is
//! part of the initial snapshot or a live update, and which [`Source`]
//! produced it.

use std::collections::HashMap;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{Delta, InstanceRecord, Source};

/// A single change to a keyed collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeNotification<T> {
    Add(T),
    Modify { data: T, deltas: Vec<Delta> },
    Delete(T),
    /// Marks the end of a batch. Carries no data.
    BufferSentinel,
}

impl<T> ChangeNotification<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            ChangeNotification::Add(data)
            | ChangeNotification::Modify { data, .. }
            | ChangeNotification::Delete(data) => Some(data),
            ChangeNotification::BufferSentinel => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            ChangeNotification::Add(data)
            | ChangeNotification::Modify { data, .. }
            | ChangeNotification::Delete(data) => Some(data),
            ChangeNotification::BufferSentinel => None,
        }
    }

    pub fn is_data(&self) -> bool {
        !self.is_sentinel()
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, ChangeNotification::BufferSentinel)
    }
}

/// Whether a notification belongs to the initial state of a subscription
/// or to the updates that follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Snapshot,
    Live,
}

/// A change notification tagged with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedChangeNotification<T> {
    pub source: Source,
    pub notification: ChangeNotification<T>,
}

impl<T> SourcedChangeNotification<T> {
    pub fn new(source: Source, notification: ChangeNotification<T>) -> Self {
        Self {
            source,
            notification,
        }
    }
}

/// What a subscriber actually receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamNotification<T> {
    pub state: StreamState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub notification: ChangeNotification<T>,
}

impl<T> StreamNotification<T> {
    pub fn snapshot(source: Option<Source>, notification: ChangeNotification<T>) -> Self {
        Self {
            state: StreamState::Snapshot,
            source,
            notification,
        }
    }

    pub fn live(source: Option<Source>, notification: ChangeNotification<T>) -> Self {
        Self {
            state: StreamState::Live,
            source,
            notification,
        }
    }

    /// The marker that closes the snapshot part of a subscription.
    pub fn live_sentinel() -> Self {
        Self::live(None, ChangeNotification::BufferSentinel)
    }

    pub fn is_live_sentinel(&self) -> bool {
        self.state == StreamState::Live && self.notification.is_sentinel()
    }
}

/// Items that can be tracked by identity across notifications.
pub trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

impl Keyed for InstanceRecord {
    type Key = String;

    fn key(&self) -> String {
        self.id().to_owned()
    }
}

/// A stream fed by an unbounded channel. Dropping it closes the channel,
/// which is how the producing side learns that nobody is listening any more.
pub struct ChannelStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> ChannelStream<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// A stream that has already ended.
    pub(crate) fn closed() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self { rx }
    }
}

impl<T> Stream for ChannelStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Groups a notification stream into batches ending at each
/// `BufferSentinel`. The sentinel itself is not part of the batch. Whatever
/// is left when the stream ends is emitted as a final batch.
pub fn delineated_batches<S, T>(
    notifications: S,
) -> impl Stream<Item = Vec<ChangeNotification<T>>>
where
    S: Stream<Item = ChangeNotification<T>> + Unpin,
{
    stream::unfold(Some(notifications), |state| async move {
        let mut notifications = state?;
        let mut batch = Vec::new();
        loop {
            match notifications.next().await {
                Some(ChangeNotification::BufferSentinel) => {
                    return Some((batch, Some(notifications)));
                }
                Some(notification) => batch.push(notification),
                None if batch.is_empty() => return None,
                None => return Some((batch, None)),
            }
        }
    })
}

/// Reduces a batch to at most one notification per key, keeping the
/// position of each key's first appearance. Sentinels are dropped.
pub fn collapse<T: Keyed>(batch: Vec<ChangeNotification<T>>) -> Vec<ChangeNotification<T>> {
    let mut positions: HashMap<T::Key, usize> = HashMap::new();
    let mut collapsed: Vec<ChangeNotification<T>> = Vec::new();

    for notification in batch {
        let Some(key) = notification.data().map(Keyed::key) else {
            continue;
        };
        match positions.get(&key) {
            None => {
                positions.insert(key, collapsed.len());
                collapsed.push(notification);
            }
            Some(&at) => {
                let previous =
                    std::mem::replace(&mut collapsed[at], ChangeNotification::BufferSentinel);
                collapsed[at] = merge(previous, notification);
            }
        }
    }
    collapsed
}

fn merge<T>(previous: ChangeNotification<T>, next: ChangeNotification<T>) -> ChangeNotification<T> {
    use ChangeNotification::*;

    match (previous, next) {
        (Add(_), Modify { data, .. }) => Add(data),
        (Modify { mut deltas, .. }, Modify { data, deltas: more }) => {
            deltas.extend(more);
            Modify { data, deltas }
        }
        (_, next) => next,
    }
}

/// The values left standing after applying `batch` in order to an empty
/// collection.
pub fn evaluate<T: Keyed>(batch: Vec<ChangeNotification<T>>) -> Vec<T> {
    let mut order: Vec<T::Key> = Vec::new();
    let mut live: HashMap<T::Key, T> = HashMap::new();

    for notification in batch {
        match notification {
            ChangeNotification::Add(data) | ChangeNotification::Modify { data, .. } => {
                let key = data.key();
                if live.insert(key.clone(), data).is_none() {
                    order.push(key);
                }
            }
            ChangeNotification::Delete(data) => {
                let key = data.key();
                if live.remove(&key).is_some() {
                    order.retain(|k| k != &key);
                }
            }
            ChangeNotification::BufferSentinel => {}
        }
    }
    order.into_iter().filter_map(|key| live.remove(&key)).collect()
}
