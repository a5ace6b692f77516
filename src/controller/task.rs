//! Task execution
//!
//! A task runs its operation on every pod of the target datacenter, one pod
//! at a time, and stops at the first failure. Terminal tasks are never run
//! again, and a task started by this process is never started twice even
//! when the cache still shows it `Running`.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::metrics;
use super::node_agent::{NodeAgent, NodeOperation};
use crate::crd::{DataCenter, Task, TaskPhase, TaskSpec, TaskStatus};
use crate::error::{Error, Result};

/// What a task asks for, resolved from its single populated sub-object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOperation {
    Node(NodeOperation),
    /// Completes without touching any pod
    Test { fail: bool },
}

impl TaskOperation {
    pub fn type_name(&self) -> String {
        match self {
            TaskOperation::Node(op) => op.to_string(),
            TaskOperation::Test { .. } => "test".to_string(),
        }
    }
}

/// Resolve the operation of a task, exactly one sub-object must be set
pub fn resolve_operation(task: &Task) -> Result<TaskOperation> {
    let TaskSpec {
        repair,
        cleanup,
        rebuild,
        decommission,
        backup,
        test,
        ..
    } = &task.spec;

    let mut operations = Vec::new();
    if let Some(repair) = repair {
        operations.push(TaskOperation::Node(NodeOperation::Repair {
            keyspace: repair.keyspace.clone(),
        }));
    }
    if let Some(cleanup) = cleanup {
        operations.push(TaskOperation::Node(NodeOperation::Cleanup {
            keyspace: cleanup.keyspace.clone(),
        }));
    }
    if let Some(rebuild) = rebuild {
        operations.push(TaskOperation::Node(NodeOperation::Rebuild {
            src_dc_name: rebuild.src_dc_name.clone(),
        }));
    }
    if decommission.is_some() {
        operations.push(TaskOperation::Node(NodeOperation::Decommission));
    }
    if let Some(backup) = backup {
        operations.push(TaskOperation::Node(NodeOperation::Backup {
            target: backup.target.clone(),
            snapshot_tag: backup
                .snapshot_tag
                .clone()
                .unwrap_or_else(|| task.name_any()),
        }));
    }
    if let Some(test) = test {
        operations.push(TaskOperation::Test { fail: test.fail });
    }

    match operations.len() {
        1 => Ok(operations.remove(0)),
        0 => Err(Error::TaskError("no operation set".to_string())),
        n => Err(Error::TaskError(format!(
            "{n} operations set, exactly one is expected"
        ))),
    }
}

/// Persists task status, the Kubernetes status subresource in production
#[async_trait]
pub trait TaskStatusStore: Send + Sync {
    async fn update_status(&self, task: &Task, status: &TaskStatus) -> Result<()>;
}

pub struct KubeTaskStatusStore {
    client: Client,
}

impl KubeTaskStatusStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskStatusStore for KubeTaskStatusStore {
    async fn update_status(&self, task: &Task, status: &TaskStatus) -> Result<()> {
        let api: Api<Task> = Api::namespaced(self.client.clone(), &task.namespace_or_default());
        let patch = json!({ "status": status });
        api.patch_status(
            &task.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

pub struct TaskReconciler {
    agent: Arc<dyn NodeAgent>,
    store: Arc<dyn TaskStatusStore>,
    /// Tasks this process started, by uid
    started: Mutex<HashSet<String>>,
}

impl TaskReconciler {
    pub fn new(agent: Arc<dyn NodeAgent>, store: Arc<dyn TaskStatusStore>) -> Self {
        Self {
            agent,
            store,
            started: Mutex::new(HashSet::new()),
        }
    }

    /// Mark the task as started, false if it already was
    fn claim(&self, task: &Task) -> bool {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_identity(task))
    }

    /// Drop the bookkeeping of a deleted task
    pub fn forget(&self, task: &Task) {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_identity(task));
    }

    /// Run a task against its datacenter, `None` when the datacenter does not exist.
    ///
    /// Returns the phase the task ended in.
    #[instrument(skip_all, fields(task = %task.object_key()))]
    pub async fn reconcile(&self, task: &Task, dc: Option<&DataCenter>) -> Result<TaskPhase> {
        if task.is_terminated() {
            debug!(phase = %task.phase(), "Task already terminated");
            return Ok(task.phase());
        }
        if !self.claim(task) {
            debug!(phase = %task.phase(), "Task already started by this operator");
            return Ok(task.phase());
        }

        let started = Instant::now();
        let mut status = TaskStatus {
            phase: TaskPhase::Running,
            start_date: Some(Utc::now().to_rfc3339()),
            ..Default::default()
        };

        let operation = match resolve_operation(task) {
            Ok(operation) => operation,
            Err(e) => {
                warn!("Invalid task: {}", e);
                status.phase = TaskPhase::Failed;
                status.last_message = Some(e.to_string());
                return self.finish(task, "unknown", status, started).await;
            }
        };
        let type_name = operation.type_name();

        let Some(dc) = dc else {
            info!(
                cluster = %task.spec.cluster,
                datacenter = %task.spec.datacenter,
                "Datacenter not found, task ignored"
            );
            status.phase = TaskPhase::Ignored;
            status.last_message = Some("datacenter not found".to_string());
            return self.finish(task, &type_name, status, started).await;
        };

        self.store.update_status(task, &status).await?;
        info!(operation = %type_name, "Task started");

        match &operation {
            TaskOperation::Test { fail } => {
                status.phase = if *fail {
                    TaskPhase::Failed
                } else {
                    TaskPhase::Succeed
                };
            }
            TaskOperation::Node(op) => {
                let (phase, pods, message) = self.run_on_pods(dc, op).await;
                status.phase = phase;
                status.pods = pods;
                status.last_message = message;
            }
        }
        self.finish(task, &type_name, status, started).await
    }

    async fn run_on_pods(
        &self,
        dc: &DataCenter,
        operation: &NodeOperation,
    ) -> (TaskPhase, BTreeMap<String, TaskPhase>, Option<String>) {
        let mut pods = BTreeMap::new();
        let service_host = dc.service_host();

        for pod in dc.pod_names() {
            let host = format!("{pod}.{service_host}");
            match self.agent.execute(&host, operation).await {
                Ok(()) => {
                    debug!(pod = %pod, "Pod operation succeeded");
                    pods.insert(pod, TaskPhase::Succeed);
                }
                Err(e) => {
                    warn!(pod = %pod, "Pod operation failed: {}", e);
                    let message = format!("{pod}: {e}");
                    pods.insert(pod, TaskPhase::Failed);
                    return (TaskPhase::Failed, pods, Some(message));
                }
            }
        }
        (TaskPhase::Succeed, pods, None)
    }

    async fn finish(
        &self,
        task: &Task,
        type_name: &str,
        mut status: TaskStatus,
        started: Instant,
    ) -> Result<TaskPhase> {
        status.duration_ms = Some(started.elapsed().as_millis() as i64);
        self.store.update_status(task, &status).await?;
        metrics::inc_task(type_name, &status.phase.to_string());
        info!(phase = %status.phase, "Task finished");
        Ok(status.phase)
    }
}

fn task_identity(task: &Task) -> String {
    task.uid().unwrap_or_else(|| task.object_key())
}
