//! Roster: the core of a leased, multi-sourced service registry.
//!
//! Instances register with a node under a [`Source`](model::Source) and keep
//! their registration alive by renewing a lease. The [`Registry`] merges the
//! copies that different sources hold of the same instance, streams changes
//! to interest subscribers and evicts expired registrations no faster than
//! the [`EvictionQuotaKeeper`] allows. Peers are found through
//! [`resolver`]s, seeded through [`bootstrap`] and kept in sync through
//! [`replication`].
//!
//! Wire formats and transports are left to the embedding application: the
//! seams are the [`InterestClient`](bootstrap::InterestClient) and
//! [`ReplicationTransport`](replication::ReplicationTransport) traits.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod interest;
pub mod model;
pub mod notification;
pub mod quota;
pub mod registry;
pub mod replication;
pub mod resolver;

pub use interest::Interest;
pub use notification::{ChangeNotification, StreamNotification, StreamState};
pub use quota::EvictionQuotaKeeper;
pub use registry::{Registry, RegistryConfig, RegistryStatus};
