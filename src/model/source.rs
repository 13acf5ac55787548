//! Provenance of registry data.
//!
//! Every copy of an instance record stored in the registry is tagged with
//! the [`Source`] that contributed it: the local registration channel, a
//! replication peer, the bootstrap loader or an interest subscription.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a copy of registry data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    /// Registered directly with this node by the instance itself.
    Local,
    /// Received from a peer node over a replication channel.
    Replicated,
    /// Loaded from a peer while this node was starting up.
    Bootstrap,
    /// Received through an interest subscription to another node.
    Interested,
}

impl Origin {
    /// Copies from leased origins expire unless renewed. The others live as
    /// long as the connection that delivered them.
    pub fn is_leased(self) -> bool {
        matches!(self, Origin::Local | Origin::Bootstrap)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Origin::Local => "LOCAL",
            Origin::Replicated => "REPLICATED",
            Origin::Bootstrap => "BOOTSTRAP",
            Origin::Interested => "INTERESTED",
        };
        f.write_str(name)
    }
}

/// Provenance tag identifying one upstream connection or peer.
///
/// `name` identifies the peer (or the registering instance) and `id` the
/// connection generation, so a reconnect from the same peer yields a new
/// source that compares unequal to the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    origin: Origin,
    name: String,
    id: u64,
}

impl Source {
    pub fn new(origin: Origin, name: impl Into<String>, id: u64) -> Self {
        Self {
            origin,
            name: name.into(),
            id,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True if both sources come from the same origin and peer, regardless
    /// of connection generation.
    pub fn same_peer(&self, other: &Source) -> bool {
        self.origin == other.origin && self.name == other.name
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.origin, self.name, self.id)
    }
}

/// Predicate over sources, used for bulk eviction and source-filtered
/// interest streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceMatcher {
    Any,
    Origin(Origin),
    /// Same origin and peer name, any generation.
    Peer { origin: Origin, name: String },
    Exact(Source),
    /// Same origin and peer name as the given source, but an older or
    /// otherwise different generation.
    PriorGenerations(Source),
}

impl SourceMatcher {
    pub fn matches(&self, source: &Source) -> bool {
        match self {
            SourceMatcher::Any => true,
            SourceMatcher::Origin(origin) => source.origin == *origin,
            SourceMatcher::Peer { origin, name } => {
                source.origin == *origin && source.name == *name
            }
            SourceMatcher::Exact(expected) => source == expected,
            SourceMatcher::PriorGenerations(current) => {
                current.same_peer(source) && current.id != source.id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_generations_skip_the_current_one() {
        let current = Source::new(Origin::Replicated, "peer-a", 7);
        let matcher = SourceMatcher::PriorGenerations(current.clone());

        assert!(matcher.matches(&Source::new(Origin::Replicated, "peer-a", 6)));
        assert!(!matcher.matches(&current));
        assert!(!matcher.matches(&Source::new(Origin::Replicated, "peer-b", 6)));
        assert!(!matcher.matches(&Source::new(Origin::Local, "peer-a", 6)));
    }

    #[test]
    fn only_local_and_bootstrap_copies_are_leased() {
        assert!(Origin::Local.is_leased());
        assert!(Origin::Bootstrap.is_leased());
        assert!(!Origin::Replicated.is_leased());
        assert!(!Origin::Interested.is_leased());
    }
}
