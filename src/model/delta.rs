//! Field-level differences between two versions of an instance record.
//!
//! A [`Delta`] names one field of one instance and carries its new value.
//! Modify notifications carry the set of deltas that turn the previous
//! version into the current one, so a transport can ship only what changed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::datacenter::DataCenterInfo;
use super::instance::{ServicePort, Status};

/// The mutable fields of an instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Application,
    VipAddress,
    SecureVipAddress,
    Status,
    Ports,
    HealthCheckUrls,
    Metadata,
    DataCenter,
}

/// New value of a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value")]
pub enum FieldValue {
    Application(String),
    VipAddress(Option<String>),
    SecureVipAddress(Option<String>),
    Status(Status),
    Ports(BTreeSet<ServicePort>),
    HealthCheckUrls(BTreeSet<String>),
    Metadata(BTreeMap<String, String>),
    DataCenter(DataCenterInfo),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Application(_) => Field::Application,
            FieldValue::VipAddress(_) => Field::VipAddress,
            FieldValue::SecureVipAddress(_) => Field::SecureVipAddress,
            FieldValue::Status(_) => Field::Status,
            FieldValue::Ports(_) => Field::Ports,
            FieldValue::HealthCheckUrls(_) => Field::HealthCheckUrls,
            FieldValue::Metadata(_) => Field::Metadata,
            FieldValue::DataCenter(_) => Field::DataCenter,
        }
    }
}

/// A change of one field on the instance identified by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    id: String,
    value: FieldValue,
}

impl Delta {
    pub fn new(id: impl Into<String>, value: FieldValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn field(&self) -> Field {
        self.value.field()
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn into_value(self) -> FieldValue {
        self.value
    }
}
