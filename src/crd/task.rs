//! Task Custom Resource Definition
//!
//! A Task is a one-shot maintenance directive targeting one datacenter.
//! Exactly one of the operation sub-objects must be populated.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::datacenter::cluster_key;
use super::types::TaskPhase;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "elassandra.strapdata.com",
    version = "v1beta1",
    kind = "Task",
    namespaced,
    status = "TaskStatus",
    shortname = "etask",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Datacenter","type":"string","jsonPath":".spec.datacenter"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub cluster: String,
    pub datacenter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairTaskSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupTaskSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<RebuildTaskSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decommission: Option<DecommissionTaskSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupTaskSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestTaskSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepairTaskSpec {
    /// Repair a single keyspace, every keyspace when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupTaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RebuildTaskSpec {
    /// Datacenter to stream data from
    pub src_dc_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecommissionTaskSpec {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupTaskSpec {
    /// Destination of the snapshot upload, e.g. `s3://bucket/prefix`
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_tag: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestTaskSpec {
    /// Fail the task instead of succeeding, used to exercise error paths
    #[serde(default)]
    pub fail: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub phase: TaskPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    /// Per-pod outcome
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pods: BTreeMap<String, TaskPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl Task {
    pub fn cluster_key(&self) -> String {
        cluster_key(&self.namespace_or_default(), &self.spec.cluster)
    }

    pub fn object_key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    pub fn phase(&self) -> TaskPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_terminated(&self) -> bool {
        self.phase().is_terminated()
    }
}
