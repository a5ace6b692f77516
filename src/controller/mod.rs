//! Controller module for DataCenter and Task reconciliation
//! This module contains the watch pipelines, the per-cluster work queues,
//! and the reconciliation passes for Elassandra datacenters and tasks.

pub mod backup_scheduler;
pub mod cache;
pub mod conditions;
mod context;
mod datacenter;
#[cfg(test)]
mod datacenter_test;
mod finalizers;
pub mod metrics;
pub mod node_agent;
pub mod phase;
pub mod pipeline;
mod reconciler;
mod task;
pub mod watch;
pub mod work_queue;

pub use cache::ResourceCache;
pub use context::{ControllerState, OperatorArgs, OperatorConfig};
pub use datacenter::DataCenterReconciler;
pub use finalizers::DATACENTER_FINALIZER;
pub use node_agent::{HttpNodeAgent, NodeAgent, NodeOperation};
pub use pipeline::EventPipeline;
pub use reconciler::run_controller;
pub use task::{resolve_operation, TaskOperation, TaskReconciler, TaskStatusStore};
pub use watch::{create_stream, EventType, KubeAdapter, ResourceAdapter, ResourceEvent};
pub use work_queue::{QueuePolicy, Reconciliation, ReconciliationKind, WorkQueue};
