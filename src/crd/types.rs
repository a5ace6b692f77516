//! Shared types for the DataCenter and Task resources
//!
//! # Type Hierarchy
//!
//! - [`DataCenterPhase`] - lifecycle phase of a datacenter, with [`DataCenterPhase::is_ready`]
//! - [`TaskPhase`] - lifecycle phase of a task, with [`TaskPhase::is_terminated`]
//! - [`CqlStatus`] / [`CredentialsStatus`] - CQL connectivity bookkeeping
//! - Plugin specs: [`ReaperSpec`], [`KibanaSpec`], [`WebhookSpec`]
//! - User declarations: [`KeyspaceSpec`], [`RoleSpec`], [`ScheduledBackup`]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a DataCenter
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataCenterPhase {
    /// StatefulSets are being created, no pod exists yet
    #[default]
    Creating,
    /// Pods exist but the datacenter has not reached its desired size yet
    Starting,
    ScalingUp,
    ScalingDown,
    Running,
    /// Spec changed, a rolling update is in progress
    Updating,
    /// Last reconciliation failed
    Error,
    RollingBack,
    /// Pods are being stopped
    Parking,
    /// All pods stopped, resources kept
    Parked,
}

impl DataCenterPhase {
    /// Phases in which CQL-dependent reconciliation may proceed.
    ///
    /// Every phase except the initial bring-up and the park transitions.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            DataCenterPhase::Running
                | DataCenterPhase::Updating
                | DataCenterPhase::Error
                | DataCenterPhase::ScalingUp
                | DataCenterPhase::ScalingDown
                | DataCenterPhase::RollingBack
        )
    }

    pub fn is_parked(&self) -> bool {
        matches!(self, DataCenterPhase::Parking | DataCenterPhase::Parked)
    }
}

impl std::fmt::Display for DataCenterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataCenterPhase::Creating => "CREATING",
            DataCenterPhase::Starting => "STARTING",
            DataCenterPhase::ScalingUp => "SCALING_UP",
            DataCenterPhase::ScalingDown => "SCALING_DOWN",
            DataCenterPhase::Running => "RUNNING",
            DataCenterPhase::Updating => "UPDATING",
            DataCenterPhase::Error => "ERROR",
            DataCenterPhase::RollingBack => "ROLLING_BACK",
            DataCenterPhase::Parking => "PARKING",
            DataCenterPhase::Parked => "PARKED",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle phase of a Task
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    #[default]
    Waiting,
    Running,
    Succeed,
    Failed,
    /// Nothing to do, e.g. the target datacenter does not exist
    Ignored,
}

impl TaskPhase {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TaskPhase::Succeed | TaskPhase::Failed | TaskPhase::Ignored
        )
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPhase::Waiting => "WAITING",
            TaskPhase::Running => "RUNNING",
            TaskPhase::Succeed => "SUCCEED",
            TaskPhase::Failed => "FAILED",
            TaskPhase::Ignored => "IGNORED",
        };
        write!(f, "{s}")
    }
}

/// Observed CQL connectivity
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CqlStatus {
    #[default]
    NotStarted,
    Established,
    Errored,
}

/// Which credentials the operator last connected with
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialsStatus {
    #[default]
    Unknown,
    /// No authentication required
    Anonymous,
    /// cassandra role with the well-known default password
    Default,
    /// cassandra role with the password from the credentials secret
    Cassandra,
    /// The operator's own managed role
    Operator,
}

/// CQL authentication mode of the datacenter
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authentication {
    None,
    #[default]
    Cassandra,
}

/// Reaper registration progress
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReaperPhase {
    #[default]
    None,
    /// The reaper role exists and has been granted its keyspace
    RoleCreated,
    /// The cluster is registered in the reaper backend
    Registered,
}

/// Per-rack observation from the rack StatefulSet
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RackStatus {
    pub replicas: i32,
    pub ready_replicas: i32,
}

/// User-declared keyspace managed by the operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyspaceSpec {
    pub name: String,
    /// Target replication factor for this datacenter
    #[serde(default = "default_rf")]
    pub rf: i32,
}

fn default_rf() -> i32 {
    3
}

/// User-declared CQL role managed by the operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub username: String,
    /// Secret holding the password, defaults to the cluster credentials secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Key within the secret, defaults to `cassandra.<username>_password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub superuser: bool,
    #[serde(default = "default_true")]
    pub login: bool,
    /// Complete GRANT statements executed after the role is created
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_statements: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Cassandra Reaper repair scheduler
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReaperSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Reaper API base URL, defaults to the in-cluster reaper service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_jmx_port")]
    pub jmx_port: i32,
}

fn default_jmx_port() -> i32 {
    7199
}

/// Kibana dashboards, one index keyspace per space
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KibanaSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spaces: Vec<KibanaSpace>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KibanaSpace {
    pub name: String,
    #[serde(default = "default_rf")]
    pub rf: i32,
}

/// Outbound notification of phase changes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSpec {
    pub url: String,
}

/// Cron-driven backup, materialized as a Task when the schedule fires
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledBackup {
    pub name: String,
    /// Cron expression with seconds, e.g. `0 0 2 * * *`
    pub schedule: String,
    /// Backup target, e.g. `s3://bucket/prefix`
    pub target: String,
}

/// Condition following Kubernetes API conventions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_phases() {
        let ready = [
            DataCenterPhase::Running,
            DataCenterPhase::Updating,
            DataCenterPhase::Error,
            DataCenterPhase::ScalingUp,
            DataCenterPhase::ScalingDown,
            DataCenterPhase::RollingBack,
        ];
        for phase in ready {
            assert!(phase.is_ready(), "{phase} should be ready");
        }
        for phase in [
            DataCenterPhase::Creating,
            DataCenterPhase::Starting,
            DataCenterPhase::Parking,
            DataCenterPhase::Parked,
        ] {
            assert!(!phase.is_ready(), "{phase} should not be ready");
        }
    }

    #[test]
    fn test_task_terminal_phases() {
        assert!(!TaskPhase::Waiting.is_terminated());
        assert!(!TaskPhase::Running.is_terminated());
        assert!(TaskPhase::Succeed.is_terminated());
        assert!(TaskPhase::Failed.is_terminated());
        assert!(TaskPhase::Ignored.is_terminated());
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&DataCenterPhase::ScalingUp).unwrap();
        assert_eq!(json, "\"SCALING_UP\"");
        let phase: TaskPhase = serde_json::from_str("\"SUCCEED\"").unwrap();
        assert_eq!(phase, TaskPhase::Succeed);
    }
}
