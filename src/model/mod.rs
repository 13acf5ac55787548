//! Data structures describing registered instances.
//!
//! These types are serialised using [`serde`](https://serde.rs/) so that
//! any transport can carry them, but nothing in this crate depends on a
//! particular wire format.

pub mod datacenter;
pub mod delta;
pub mod instance;
pub mod lease;
pub mod source;

pub use datacenter::{AwsDataCenterInfo, DataCenterInfo};
pub use delta::{Delta, Field, FieldValue};
pub use instance::{InstanceRecord, InstanceRecordBuilder, ServicePort, Status};
pub use lease::{Lease, LeaseTerms};
pub use source::{Origin, Source, SourceMatcher};
