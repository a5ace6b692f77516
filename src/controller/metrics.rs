//! Prometheus metrics for the Elassandra operator
//!
//! # Exported metrics
//! The `/metrics` endpoint exports the following metrics:
//! - `elassandra_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `elassandra_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `elassandra_workqueue_pending` (gauge): cluster keys waiting for a lane, labeled by queue.
//! - `elassandra_workqueue_ongoing` (gauge): reconciliations currently running, labeled by queue.
//! - `elassandra_watch_restarts_total` (counter): watch stream restarts labeled by resource kind.
//! - `elassandra_plugin_errors_total` (counter): isolated plugin failures labeled by plugin.
//! - `elassandra_tasks_total` (counter): finished tasks labeled by task type and phase.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "datacenter"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind/category, e.g. "kube", "cql", "connectivity"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatchLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PluginLabels {
    pub plugin: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub task_type: String,
    pub phase: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WORKQUEUE_PENDING: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static WORKQUEUE_ONGOING: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static WATCH_RESTARTS_TOTAL: Lazy<Family<WatchLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PLUGIN_ERRORS_TOTAL: Lazy<Family<PluginLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static TASKS_TOTAL: Lazy<Family<TaskLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "elassandra_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "elassandra_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "elassandra_workqueue_pending",
        "Reconciliations waiting behind an ongoing one for the same cluster",
        WORKQUEUE_PENDING.clone(),
    );
    registry.register(
        "elassandra_workqueue_ongoing",
        "Reconciliations currently executing",
        WORKQUEUE_ONGOING.clone(),
    );
    registry.register(
        "elassandra_watch_restarts_total",
        "Total number of watch stream restarts",
        WATCH_RESTARTS_TOTAL.clone(),
    );
    registry.register(
        "elassandra_plugin_errors_total",
        "Total number of plugin failures",
        PLUGIN_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "elassandra_tasks_total",
        "Total number of finished tasks",
        TASKS_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_sizes(queue: &str, pending: usize, ongoing: usize) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    WORKQUEUE_PENDING
        .get_or_create(&labels)
        .set(pending as i64);
    WORKQUEUE_ONGOING
        .get_or_create(&labels)
        .set(ongoing as i64);
}

pub fn inc_watch_restart(kind: &str) {
    let labels = WatchLabels {
        kind: kind.to_string(),
    };
    WATCH_RESTARTS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_plugin_error(plugin: &str) {
    let labels = PluginLabels {
        plugin: plugin.to_string(),
    };
    PLUGIN_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_task(task_type: &str, phase: &str) {
    let labels = TaskLabels {
        task_type: task_type.to_string(),
        phase: phase.to_string(),
    };
    TASKS_TOTAL.get_or_create(&labels).inc();
}
