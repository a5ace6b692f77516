//! DataCenter Custom Resource Definition
//!
//! A DataCenter represents one Elassandra/Cassandra datacenter, a set of
//! nodes spread over racks, belonging to a named cluster. Several
//! DataCenter resources with the same cluster name form a multi-DC cluster.

use std::collections::{BTreeMap, BTreeSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Authentication, Condition, CqlStatus, CredentialsStatus, DataCenterPhase, KeyspaceSpec,
    KibanaSpec, RackStatus, ReaperPhase, ReaperSpec, RoleSpec, ScheduledBackup, WebhookSpec,
};

/// Structured validation error for `DataCenterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "elassandra.strapdata.com",
    version = "v1beta1",
    kind = "DataCenter",
    namespaced,
    status = "DataCenterStatus",
    shortname = "edc",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Datacenter","type":"string","jsonPath":".spec.datacenterName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataCenterSpec {
    pub cluster_name: String,
    pub datacenter_name: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub authentication: Authentication,

    /// Stop every pod while keeping volumes and configuration
    #[serde(default)]
    pub parked: bool,

    /// Suffix of the elastic admin keyspace when several datacenter groups share a cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter_group: Option<String>,

    /// Secret holding role passwords, defaults to `elassandra-<cluster>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyspaces: Vec<KeyspaceSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleSpec>,

    #[serde(default)]
    pub reaper: ReaperSpec,

    #[serde(default)]
    pub kibana: KibanaSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduled_backups: Vec<ScheduledBackup>,
}

fn default_replicas() -> i32 {
    1
}

impl DataCenterSpec {
    /// Validate names and declarations before anything is sent to CQL
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if !is_valid_dns_label(&self.cluster_name) {
            errors.push(SpecValidationError::new(
                "spec.clusterName",
                "clusterName must be a lowercase DNS label",
            ));
        }
        if !is_valid_dns_label(&self.datacenter_name) {
            errors.push(SpecValidationError::new(
                "spec.datacenterName",
                "datacenterName must be a lowercase DNS label",
            ));
        }
        if self.replicas < 0 {
            errors.push(SpecValidationError::new(
                "spec.replicas",
                "replicas must not be negative",
            ));
        }

        let mut seen = BTreeSet::new();
        for (i, ks) in self.keyspaces.iter().enumerate() {
            if !is_valid_cql_identifier(&ks.name) {
                errors.push(SpecValidationError::new(
                    format!("spec.keyspaces[{i}].name"),
                    format!("invalid keyspace name {:?}", ks.name),
                ));
            }
            if ks.rf < 1 {
                errors.push(SpecValidationError::new(
                    format!("spec.keyspaces[{i}].rf"),
                    "rf must be at least 1",
                ));
            }
            if !seen.insert(ks.name.as_str()) {
                errors.push(SpecValidationError::new(
                    format!("spec.keyspaces[{i}].name"),
                    format!("duplicate keyspace {}", ks.name),
                ));
            }
        }

        for (i, role) in self.roles.iter().enumerate() {
            if !is_valid_cql_identifier(&role.username) {
                errors.push(SpecValidationError::new(
                    format!("spec.roles[{i}].username"),
                    format!("invalid role name {:?}", role.username),
                ));
            }
        }

        for (i, backup) in self.scheduled_backups.iter().enumerate() {
            if backup.schedule.parse::<cron::Schedule>().is_err() {
                errors.push(SpecValidationError::new(
                    format!("spec.scheduledBackups[{i}].schedule"),
                    format!("invalid cron expression {:?}", backup.schedule),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// CQL identifiers managed by the operator: alphanumerics and underscores, at most 48 chars
pub fn is_valid_cql_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 48
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Observed state of a DataCenter, written only by the operator
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataCenterStatus {
    #[serde(default)]
    pub phase: DataCenterPhase,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub cql_status: CqlStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cql_status_message: Option<String>,

    #[serde(default)]
    pub credentials_status: CredentialsStatus,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rack_statuses: BTreeMap<String, RackStatus>,

    /// True once every node joined the ring at least once
    #[serde(default)]
    pub bootstrapped: bool,

    /// Keyspaces already created by the operator
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub keyspaces_created: BTreeSet<String>,

    /// Ready replica count used for the last replication factor adjustment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace_replicas_observed: Option<i32>,

    #[serde(default)]
    pub reaper_phase: ReaperPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kibana_spaces: Vec<String>,

    /// Plugins that were active on the previous pass
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub active_plugins: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_phase: Option<DataCenterPhase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DataCenter {
    /// Serialization key shared by every datacenter of a cluster
    pub fn cluster_key(&self) -> String {
        cluster_key(&self.namespace_or_default(), &self.spec.cluster_name)
    }

    /// Identity of the datacenter: `namespace/cluster/datacenter`
    pub fn datacenter_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.namespace_or_default(),
            self.spec.cluster_name,
            self.spec.datacenter_name
        )
    }

    /// Cache key of the resource itself: `namespace/name`
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Prefix shared by the StatefulSets, Services and pods of this datacenter
    pub fn resource_prefix(&self) -> String {
        format!(
            "elassandra-{}-{}",
            self.spec.cluster_name, self.spec.datacenter_name
        )
    }

    /// Headless service resolving every node of the datacenter
    pub fn service_host(&self) -> String {
        format!(
            "{}.{}.svc.cluster.local",
            self.resource_prefix(),
            self.namespace_or_default()
        )
    }

    pub fn credentials_secret_name(&self) -> String {
        self.spec
            .credentials_secret
            .clone()
            .unwrap_or_else(|| format!("elassandra-{}", self.spec.cluster_name))
    }

    /// Elassandra admin keyspace, suffixed by the datacenter group if any
    pub fn elastic_admin_keyspace(&self) -> String {
        match &self.spec.datacenter_group {
            Some(group) if !group.is_empty() => format!("elastic_admin_{group}"),
            _ => "elastic_admin".to_string(),
        }
    }

    /// Pod names ordered by rack then ordinal
    pub fn pod_names(&self) -> Vec<String> {
        let racks = self
            .status
            .as_ref()
            .map(|s| s.rack_statuses.clone())
            .unwrap_or_default();
        racks
            .iter()
            .flat_map(|(rack, status)| {
                let prefix = self.resource_prefix();
                (0..status.replicas.max(0)).map(move |i| format!("{prefix}-{rack}-{i}"))
            })
            .collect()
    }
}

pub fn cluster_key(namespace: &str, cluster_name: &str) -> String {
    format!("{namespace}/{cluster_name}")
}
