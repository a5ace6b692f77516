//! Operator configuration and shared controller state

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::Client;

use super::cache::ResourceCache;
use super::datacenter::DataCenterReconciler;
use super::node_agent::HttpNodeAgent;
use super::task::{KubeTaskStatusStore, TaskReconciler};
use super::work_queue::{QueuePolicy, WorkQueue};
use crate::cql::{
    KeyspaceReconciler, KubeSecretProvider, ResourceManager, RoleReconciler, ScyllaConnector,
    DEFAULT_CASSANDRA_PASSWORD,
};
use crate::crd::{DataCenter, Task};
use crate::error::Result;
use crate::http::{HttpClient, RetryPolicy};
use crate::plugins::{KibanaPlugin, ManagedPlugin, PluginRegistry, ReaperPlugin, WebhookPlugin};

#[derive(Parser, Clone, Debug)]
pub struct OperatorArgs {
    /// Namespace the operator runs in, holds the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Only watch this namespace, every namespace when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[arg(long, env = "CQL_PORT", default_value_t = 9042)]
    pub cql_port: u16,

    #[arg(long, env = "CQL_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub cql_connect_timeout_secs: u64,

    #[arg(long, env = "CQL_REQUEST_TIMEOUT_SECS", default_value_t = 12)]
    pub cql_request_timeout_secs: u64,

    /// Password of the cassandra role on a freshly bootstrapped cluster
    #[arg(
        long,
        env = "DEFAULT_CASSANDRA_PASSWORD",
        default_value = DEFAULT_CASSANDRA_PASSWORD,
        hide_env_values = true
    )]
    pub default_cassandra_password: String,

    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 4)]
    pub reconcile_workers: usize,

    #[arg(long, env = "TASK_WORKERS", default_value_t = 2)]
    pub task_workers: usize,

    /// Pending request policy of the datacenter reconcile queue
    #[arg(long, env = "QUEUE_POLICY", value_enum, default_value_t = QueuePolicy::LatestWins)]
    pub queue_policy: QueuePolicy,

    /// Delay before relisting after a watch error
    #[arg(long, env = "WATCH_BACKOFF_SECS", default_value_t = 5)]
    pub watch_backoff_secs: u64,

    #[arg(long, env = "API_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub api_bind_address: String,

    #[arg(long, env = "NODE_AGENT_PORT", default_value_t = super::node_agent::NODE_AGENT_PORT)]
    pub node_agent_port: u16,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    #[arg(long, env = "HTTP_MAX_ATTEMPTS", default_value_t = 3)]
    pub http_max_attempts: u32,

    #[arg(long, env = "BACKUP_CHECK_INTERVAL_SECS", default_value_t = 60)]
    pub backup_check_interval_secs: u64,

    #[arg(
        long,
        env = "LEADER_ELECTION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub leader_election: bool,
}

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub namespace: String,
    pub watch_namespace: Option<String>,
    pub cql_port: u16,
    pub cql_connect_timeout: Duration,
    pub cql_request_timeout: Duration,
    pub default_cassandra_password: String,
    pub reconcile_workers: usize,
    pub task_workers: usize,
    pub queue_policy: QueuePolicy,
    pub watch_backoff: Duration,
    pub api_bind_address: String,
    pub node_agent_port: u16,
    pub http_timeout: Duration,
    pub http_retry: RetryPolicy,
    pub backup_check_interval: Duration,
    pub leader_election: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            watch_namespace: None,
            cql_port: 9042,
            cql_connect_timeout: Duration::from_secs(5),
            cql_request_timeout: Duration::from_secs(12),
            default_cassandra_password: DEFAULT_CASSANDRA_PASSWORD.to_string(),
            reconcile_workers: 4,
            task_workers: 2,
            queue_policy: QueuePolicy::LatestWins,
            watch_backoff: Duration::from_secs(5),
            api_bind_address: "0.0.0.0:8080".to_string(),
            node_agent_port: super::node_agent::NODE_AGENT_PORT,
            http_timeout: Duration::from_secs(30),
            http_retry: RetryPolicy::default(),
            backup_check_interval: Duration::from_secs(60),
            leader_election: true,
        }
    }
}

impl From<OperatorArgs> for OperatorConfig {
    fn from(args: OperatorArgs) -> Self {
        Self {
            namespace: args.namespace,
            watch_namespace: args.watch_namespace.filter(|ns| !ns.is_empty()),
            cql_port: args.cql_port,
            cql_connect_timeout: Duration::from_secs(args.cql_connect_timeout_secs),
            cql_request_timeout: Duration::from_secs(args.cql_request_timeout_secs),
            default_cassandra_password: args.default_cassandra_password,
            reconcile_workers: args.reconcile_workers.max(1),
            task_workers: args.task_workers.max(1),
            queue_policy: args.queue_policy,
            watch_backoff: Duration::from_secs(args.watch_backoff_secs),
            api_bind_address: args.api_bind_address,
            node_agent_port: args.node_agent_port,
            http_timeout: Duration::from_secs(args.http_timeout_secs),
            http_retry: RetryPolicy {
                max_attempts: args.http_max_attempts.max(1),
                ..RetryPolicy::default()
            },
            backup_check_interval: Duration::from_secs(args.backup_check_interval_secs.max(1)),
            leader_election: args.leader_election,
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub is_leader: Arc<AtomicBool>,
    pub datacenters: ResourceCache<DataCenter>,
    pub tasks: ResourceCache<Task>,
    pub statefulsets: ResourceCache<StatefulSet>,
    pub reconcile_queue: WorkQueue,
    pub task_queue: WorkQueue,
    pub datacenter_reconciler: Arc<DataCenterReconciler>,
    pub task_reconciler: Arc<TaskReconciler>,
}

impl ControllerState {
    /// Wire the reconcilers, plugins and queues from the configuration
    pub fn new(client: Client, config: OperatorConfig, is_leader: Arc<AtomicBool>) -> Result<Self> {
        let http = HttpClient::new(config.http_timeout, config.http_retry)?;

        let plugins = PluginRegistry::new(vec![
            Arc::new(ManagedPlugin),
            Arc::new(ReaperPlugin::new(http.clone())),
            Arc::new(KibanaPlugin),
            Arc::new(WebhookPlugin::new(http.clone())),
        ]);
        let connector = Arc::new(ScyllaConnector::new(
            config.cql_port,
            config.cql_connect_timeout,
            config.cql_request_timeout,
        ));
        let datacenter_reconciler = DataCenterReconciler::new(
            connector,
            config.default_cassandra_password.clone(),
            KeyspaceReconciler::new(ResourceManager::new()),
            RoleReconciler::new(
                ResourceManager::new(),
                Arc::new(KubeSecretProvider::new(client.clone())),
            ),
            plugins,
        );
        let task_reconciler = TaskReconciler::new(
            Arc::new(HttpNodeAgent::new(http, config.node_agent_port)),
            Arc::new(KubeTaskStatusStore::new(client.clone())),
        );

        Ok(Self {
            reconcile_queue: WorkQueue::new("reconcile", config.queue_policy, config.reconcile_workers),
            // Every task event is kept, the task reconciler skips tasks it already ran
            task_queue: WorkQueue::new("task", QueuePolicy::Fifo, config.task_workers),
            client,
            config,
            is_leader,
            datacenters: ResourceCache::new(),
            tasks: ResourceCache::new(),
            statefulsets: ResourceCache::new(),
            datacenter_reconciler: Arc::new(datacenter_reconciler),
            task_reconciler: Arc::new(task_reconciler),
        })
    }

    /// StatefulSets in the namespace of a datacenter, from the cache.
    ///
    /// Rack membership is decided by labels in [`super::phase::Observation`].
    pub fn datacenter_statefulsets(&self, dc: &DataCenter) -> Vec<StatefulSet> {
        let namespace = dc.namespace_or_default();
        self.statefulsets
            .values()
            .into_iter()
            .filter(|sts| sts.metadata.namespace.as_deref() == Some(namespace.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_conversion() {
        let args = OperatorArgs::parse_from([
            "elassandra-operator",
            "--watch-namespace",
            "",
            "--reconcile-workers",
            "0",
            "--queue-policy",
            "fifo",
            "--leader-election",
            "false",
            "--http-max-attempts",
            "5",
        ]);
        let config = OperatorConfig::from(args);
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.reconcile_workers, 1);
        assert_eq!(config.queue_policy, QueuePolicy::Fifo);
        assert!(!config.leader_election);
        assert_eq!(config.http_retry.max_attempts, 5);
        assert_eq!(config.cql_port, 9042);
        assert_eq!(config.default_cassandra_password, "cassandra");
    }
}
