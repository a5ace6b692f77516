//! Response bodies of the REST API

use serde::{Deserialize, Serialize};

use crate::crd::{DataCenter, DataCenterPhase, DataCenterStatus};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCenterSummary {
    pub name: String,
    pub namespace: String,
    pub cluster: String,
    pub datacenter: String,
    pub phase: DataCenterPhase,
    pub replicas: i32,
    pub ready_replicas: i32,
}

impl From<&DataCenter> for DataCenterSummary {
    fn from(dc: &DataCenter) -> Self {
        let status = dc.status.clone().unwrap_or_default();
        Self {
            name: dc.metadata.name.clone().unwrap_or_default(),
            namespace: dc.namespace_or_default(),
            cluster: dc.spec.cluster_name.clone(),
            datacenter: dc.spec.datacenter_name.clone(),
            phase: status.phase,
            replicas: dc.spec.replicas,
            ready_replicas: status.ready_replicas,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataCenterListResponse {
    pub items: Vec<DataCenterSummary>,
    pub total: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCenterDetailResponse {
    #[serde(flatten)]
    pub summary: DataCenterSummary,
    pub parked: bool,
    pub keyspaces: Vec<String>,
    pub status: DataCenterStatus,
    pub created_at: Option<String>,
}

impl From<&DataCenter> for DataCenterDetailResponse {
    fn from(dc: &DataCenter) -> Self {
        Self {
            summary: DataCenterSummary::from(dc),
            parked: dc.spec.parked,
            keyspaces: dc.spec.keyspaces.iter().map(|k| k.name.clone()).collect(),
            status: dc.status.clone().unwrap_or_default(),
            created_at: dc
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
