use serde::{Deserialize, Serialize};

/// Where an instance runs. The variant decides which location attributes
/// are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataCenterInfo {
    /// A plain host with no placement metadata.
    Basic {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// A cloud VM with an instance id and an availability zone.
    Aws(AwsDataCenterInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsDataCenterInfo {
    pub instance_id: String,
    pub zone: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
}

impl DataCenterInfo {
    pub fn basic(name: impl Into<String>) -> Self {
        DataCenterInfo::Basic {
            name: name.into(),
            address: None,
        }
    }

    /// Availability zone, if the datacenter has the notion.
    pub fn zone(&self) -> Option<&str> {
        match self {
            DataCenterInfo::Basic { .. } => None,
            DataCenterInfo::Aws(aws) => Some(aws.zone.as_str()),
        }
    }

    /// Address other nodes should use to reach the instance. Cloud instances
    /// prefer their public address.
    pub fn default_address(&self) -> Option<&str> {
        match self {
            DataCenterInfo::Basic { address, .. } => address.as_deref(),
            DataCenterInfo::Aws(aws) => aws
                .public_address
                .as_deref()
                .or(aws.private_address.as_deref()),
        }
    }
}

impl Default for DataCenterInfo {
    fn default() -> Self {
        DataCenterInfo::basic("default")
    }
}
