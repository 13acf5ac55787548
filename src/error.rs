//! Error types, one per subsystem.
//!
//! Lookups that simply find nothing are not errors: the registry reports
//! them through [`RegistryStatus`](crate::registry::RegistryStatus) or a
//! `bool`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::Source;

#[derive(Debug, Error)]
pub enum InterestError {
    #[error("invalid pattern `{pattern}`: {cause}")]
    InvalidPattern {
        pattern: String,
        #[source]
        cause: regex::Error,
    },
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("{}:{line}: {message}", .path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("cannot read {}: {cause}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error("lookup of {name} failed: {message}")]
    Lookup { name: String, message: String },
    #[error("invalid cluster address `{0}`")]
    InvalidAddress(String),
    #[error("{0} resolved to no endpoints")]
    Empty(String),
    #[error("cannot create resolver: {0}")]
    Factory(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {peer}: {message}")]
    Connect { peer: String, message: String },
    #[error("channel to {peer} closed: {message}")]
    Closed { peer: String, message: String },
    #[error("no acknowledgement from {peer} within {timeout:?}")]
    Timeout { peer: String, timeout: Duration },
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no bootstrap peers available")]
    NoPeers,
    #[error("none of {attempted} bootstrap peers returned registry data")]
    Exhausted { attempted: usize },
    #[error("bootstrap did not finish within {0:?}")]
    Timeout(Duration),
    #[error("stream from {peer} ended before its snapshot was complete")]
    Incomplete { peer: String },
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("ingestion stream from {from} failed: {reason}")]
    Ingestion { from: Source, reason: String },
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("refusing replication from {0}: it is this node")]
    Loop(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
