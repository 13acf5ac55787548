use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::datacenter::DataCenterInfo;
use super::delta::{Delta, FieldValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Up,
    Down,
    Starting,
    OutOfService,
    #[default]
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::Starting => "STARTING",
            Status::OutOfService => "OUT_OF_SERVICE",
            Status::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A named network port exposed by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl ServicePort {
    pub fn new(port: u16) -> Self {
        Self {
            name: None,
            port,
            secure: false,
        }
    }

    pub fn named(name: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            name: Some(name.into()),
            port,
            secure,
        }
    }
}

/// One running, addressable copy of a service.
///
/// The id is fixed at construction. Everything else changes either by
/// applying a [`Delta`] or by replacing the whole record, and every change
/// bumps `last_dirty_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    id: String,
    app: String,
    vip_address: Option<String>,
    secure_vip_address: Option<String>,
    status: Status,
    ports: BTreeSet<ServicePort>,
    health_check_urls: BTreeSet<String>,
    metadata: BTreeMap<String, String>,
    datacenter: DataCenterInfo,
    last_updated_timestamp: u64,
    last_dirty_timestamp: u64,
}

impl InstanceRecord {
    pub fn builder(id: impl Into<String>) -> InstanceRecordBuilder {
        InstanceRecordBuilder::new(id)
    }

    /// A builder pre-filled with this record, for producing an updated copy.
    pub fn to_builder(&self) -> InstanceRecordBuilder {
        InstanceRecordBuilder {
            record: self.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn vip_address(&self) -> Option<&str> {
        self.vip_address.as_deref()
    }

    pub fn secure_vip_address(&self) -> Option<&str> {
        self.secure_vip_address.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn ports(&self) -> &BTreeSet<ServicePort> {
        &self.ports
    }

    pub fn health_check_urls(&self) -> &BTreeSet<String> {
        &self.health_check_urls
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn datacenter(&self) -> &DataCenterInfo {
        &self.datacenter
    }

    pub fn last_updated_timestamp(&self) -> u64 {
        self.last_updated_timestamp
    }

    pub fn last_dirty_timestamp(&self) -> u64 {
        self.last_dirty_timestamp
    }

    /// Deltas that turn `older` into `self`. Timestamps are bookkeeping and
    /// never show up as a difference.
    pub fn diff_older(&self, older: &InstanceRecord) -> Vec<Delta> {
        let mut deltas = Vec::new();
        let mut push = |value: FieldValue| deltas.push(Delta::new(self.id.clone(), value));

        if self.app != older.app {
            push(FieldValue::Application(self.app.clone()));
        }
        if self.vip_address != older.vip_address {
            push(FieldValue::VipAddress(self.vip_address.clone()));
        }
        if self.secure_vip_address != older.secure_vip_address {
            push(FieldValue::SecureVipAddress(self.secure_vip_address.clone()));
        }
        if self.status != older.status {
            push(FieldValue::Status(self.status));
        }
        if self.ports != older.ports {
            push(FieldValue::Ports(self.ports.clone()));
        }
        if self.health_check_urls != older.health_check_urls {
            push(FieldValue::HealthCheckUrls(self.health_check_urls.clone()));
        }
        if self.metadata != older.metadata {
            push(FieldValue::Metadata(self.metadata.clone()));
        }
        if self.datacenter != older.datacenter {
            push(FieldValue::DataCenter(self.datacenter.clone()));
        }
        deltas
    }

    /// Applies a delta in place. Returns false, leaving the record
    /// untouched, if the delta targets another instance.
    pub fn apply_delta(&mut self, delta: &Delta) -> bool {
        if delta.id() != self.id {
            return false;
        }
        match delta.value().clone() {
            FieldValue::Application(app) => self.app = app,
            FieldValue::VipAddress(vip) => self.vip_address = vip,
            FieldValue::SecureVipAddress(vip) => self.secure_vip_address = vip,
            FieldValue::Status(status) => self.status = status,
            FieldValue::Ports(ports) => self.ports = ports,
            FieldValue::HealthCheckUrls(urls) => self.health_check_urls = urls,
            FieldValue::Metadata(metadata) => self.metadata = metadata,
            FieldValue::DataCenter(datacenter) => self.datacenter = datacenter,
        }
        self.touch();
        true
    }

    fn touch(&mut self) {
        let now = now_millis().max(self.last_dirty_timestamp + 1);
        self.last_dirty_timestamp = now;
        self.last_updated_timestamp = now;
    }
}

pub struct InstanceRecordBuilder {
    record: InstanceRecord,
}

impl InstanceRecordBuilder {
    fn new(id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            record: InstanceRecord {
                id: id.into(),
                app: String::new(),
                vip_address: None,
                secure_vip_address: None,
                status: Status::default(),
                ports: BTreeSet::new(),
                health_check_urls: BTreeSet::new(),
                metadata: BTreeMap::new(),
                datacenter: DataCenterInfo::default(),
                last_updated_timestamp: now,
                last_dirty_timestamp: now,
            },
        }
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.record.app = app.into();
        self
    }

    pub fn vip_address(mut self, vip: impl Into<String>) -> Self {
        self.record.vip_address = Some(vip.into());
        self
    }

    pub fn secure_vip_address(mut self, vip: impl Into<String>) -> Self {
        self.record.secure_vip_address = Some(vip.into());
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.record.status = status;
        self
    }

    pub fn port(mut self, port: ServicePort) -> Self {
        self.record.ports.insert(port);
        self
    }

    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.record.health_check_urls.insert(url.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.record.metadata.insert(key.into(), value.into());
        self
    }

    pub fn datacenter(mut self, datacenter: DataCenterInfo) -> Self {
        self.record.datacenter = datacenter;
        self
    }

    /// Finishes the record. A builder seeded from an existing record counts
    /// as a mutation and moves the dirty timestamp forward.
    pub fn build(mut self) -> InstanceRecord {
        self.record.touch();
        self.record
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
