//! Per-instance aggregate of every source's copy.

use serde::Serialize;

use crate::model::{InstanceRecord, Lease, LeaseTerms, Origin, Source};
use crate::notification::{ChangeNotification, SourcedChangeNotification};

/// Outcome of a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    /// The first copy of the instance was stored.
    AddedFirst,
    /// A copy was stored next to, or instead of, an existing one.
    AddedChange,
    /// A copy was removed and others remain.
    RemovedFragment,
    /// The last copy was removed, and with it the instance.
    RemovedLast,
    NotFound,
}

impl RegistryStatus {
    pub fn is_found(self) -> bool {
        self != RegistryStatus::NotFound
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SourcedCopy {
    pub(crate) source: Source,
    pub(crate) record: InstanceRecord,
    pub(crate) lease: Option<Lease>,
}

/// Copies in write order; the first one is the snapshot everybody sees.
#[derive(Debug, Default)]
pub(crate) struct Holder {
    copies: Vec<SourcedCopy>,
}

type Notifications = Vec<SourcedChangeNotification<InstanceRecord>>;

impl Holder {
    pub(crate) fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.copies.len()
    }

    pub(crate) fn head(&self) -> Option<&SourcedCopy> {
        self.copies.first()
    }

    pub(crate) fn copies(&self) -> &[SourcedCopy] {
        &self.copies
    }

    pub(crate) fn copy_from(&self, source: &Source) -> Option<&SourcedCopy> {
        self.copies.iter().find(|copy| copy.source == *source)
    }

    /// Stores `record` as the copy of `source`, replacing any copy from an
    /// earlier connection generation of the same peer.
    pub(crate) fn update(
        &mut self,
        source: Source,
        record: InstanceRecord,
        terms: Option<LeaseTerms>,
    ) -> (RegistryStatus, Notifications) {
        let lease = terms.map(Lease::new);
        let copy = SourcedCopy {
            source: source.clone(),
            record: record.clone(),
            lease,
        };

        if self.copies.is_empty() {
            self.copies.push(copy);
            let added = SourcedChangeNotification::new(source, ChangeNotification::Add(record));
            return (RegistryStatus::AddedFirst, vec![added]);
        }

        let previous_head = self.copies[0].record.clone();
        match self.copies.iter().position(|c| c.source.same_peer(&source)) {
            Some(0) => {
                self.copies[0] = copy;
                let notifications = modification(source, &record, &previous_head);
                (RegistryStatus::AddedChange, notifications)
            }
            Some(at) => {
                self.copies[at] = copy;
                (RegistryStatus::AddedChange, Vec::new())
            }
            None if source.origin() == Origin::Local
                && self.copies[0].source.origin() != Origin::Local =>
            {
                self.copies.insert(0, copy);
                let notifications = modification(source, &record, &previous_head);
                (RegistryStatus::AddedChange, notifications)
            }
            None => {
                self.copies.push(copy);
                (RegistryStatus::AddedChange, Vec::new())
            }
        }
    }

    /// Removes the copy stored by exactly `source`.
    pub(crate) fn remove(&mut self, source: &Source) -> (RegistryStatus, Notifications) {
        let Some(at) = self.copies.iter().position(|c| c.source == *source) else {
            return (RegistryStatus::NotFound, Vec::new());
        };
        let removed = self.copies.remove(at);

        let Some(head) = self.copies.first() else {
            let deleted = SourcedChangeNotification::new(
                removed.source,
                ChangeNotification::Delete(removed.record),
            );
            return (RegistryStatus::RemovedLast, vec![deleted]);
        };
        if at != 0 {
            return (RegistryStatus::RemovedFragment, Vec::new());
        }

        let notifications = if removed.source.origin() == Origin::Local
            && head.source.origin() != Origin::Local
        {
            vec![
                SourcedChangeNotification::new(
                    removed.source,
                    ChangeNotification::Delete(removed.record),
                ),
                SourcedChangeNotification::new(
                    head.source.clone(),
                    ChangeNotification::Add(head.record.clone()),
                ),
            ]
        } else {
            modification(head.source.clone(), &head.record, &removed.record)
        };
        (RegistryStatus::RemovedFragment, notifications)
    }

    pub(crate) fn renew(&mut self, source: &Source) -> bool {
        match self.copies.iter_mut().find(|c| c.source == *source) {
            Some(SourcedCopy {
                lease: Some(lease), ..
            }) => {
                lease.renew();
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub(crate) fn expired_sources(&self) -> Vec<Source> {
        self.copies
            .iter()
            .filter(|c| c.lease.as_ref().is_some_and(Lease::is_expired))
            .map(|c| c.source.clone())
            .collect()
    }
}

fn modification(
    source: Source,
    current: &InstanceRecord,
    previous: &InstanceRecord,
) -> Notifications {
    let deltas = current.diff_older(previous);
    if deltas.is_empty() {
        return Vec::new();
    }
    let modify = ChangeNotification::Modify {
        data: current.clone(),
        deltas,
    };
    vec![SourcedChangeNotification::new(source, modify)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;

    fn record(status: Status) -> InstanceRecord {
        InstanceRecord::builder("i-1").app("app").status(status).build()
    }

    fn kinds(notifications: &Notifications) -> Vec<&'static str> {
        notifications
            .iter()
            .map(|n| match n.notification {
                ChangeNotification::Add(_) => "add",
                ChangeNotification::Modify { .. } => "modify",
                ChangeNotification::Delete(_) => "delete",
                ChangeNotification::BufferSentinel => "sentinel",
            })
            .collect()
    }

    #[test]
    fn later_sources_are_stored_silently() {
        let replicated = Source::new(Origin::Replicated, "peer", 1);
        let other = Source::new(Origin::Replicated, "other", 1);
        let mut holder = Holder::default();

        let (status, notes) = holder.update(replicated.clone(), record(Status::Up), None);
        assert_eq!(status, RegistryStatus::AddedFirst);
        assert_eq!(kinds(&notes), ["add"]);

        let (status, notes) = holder.update(other, record(Status::Down), None);
        assert_eq!(status, RegistryStatus::AddedChange);
        assert!(notes.is_empty());
        assert_eq!(holder.head().map(|c| c.record.status()), Some(Status::Up));
    }

    #[test]
    fn local_copy_preempts_and_is_withdrawn_as_delete_then_add() {
        let replicated = Source::new(Origin::Replicated, "peer", 1);
        let local = Source::new(Origin::Local, "i-1", 1);
        let mut holder = Holder::default();

        holder.update(replicated.clone(), record(Status::Up), None);
        let (_, notes) =
            holder.update(local.clone(), record(Status::Down), Some(LeaseTerms::default()));
        assert_eq!(kinds(&notes), ["modify"]);
        assert_eq!(holder.head().map(|c| &c.source), Some(&local));

        let (status, notes) = holder.remove(&local);
        assert_eq!(status, RegistryStatus::RemovedFragment);
        assert_eq!(kinds(&notes), ["delete", "add"]);

        let (status, notes) = holder.remove(&replicated);
        assert_eq!(status, RegistryStatus::RemovedLast);
        assert_eq!(kinds(&notes), ["delete"]);
        assert!(holder.is_empty());
    }

    #[test]
    fn new_generation_replaces_but_stale_generation_cannot_remove() {
        let first = Source::new(Origin::Replicated, "peer", 1);
        let second = Source::new(Origin::Replicated, "peer", 2);
        let mut holder = Holder::default();

        holder.update(first.clone(), record(Status::Up), None);
        holder.update(second.clone(), record(Status::Up), None);
        assert_eq!(holder.len(), 1);

        assert_eq!(holder.remove(&first).0, RegistryStatus::NotFound);
        assert_eq!(holder.remove(&second).0, RegistryStatus::RemovedLast);
    }
}
