//! Controller wiring for DataCenter and Task resources
//!
//! Three event pipelines (DataCenter, Task, StatefulSet) feed the shared
//! caches and submit reconciliations to the per-cluster work queues. The
//! units of work read the latest cached object when they run, so a lane
//! that coalesced several events still acts on the newest state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    Resource, ResourceExt,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, instrument, warn};

use super::backup_scheduler::BackupScheduler;
use super::context::ControllerState;
use super::finalizers::{has_finalizer, is_being_deleted, DATACENTER_FINALIZER};
use super::phase::{CLUSTER_LABEL, DATACENTER_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use super::pipeline::EventPipeline;
use super::watch::{EventType, KubeAdapter, ResourceEvent};
use super::work_queue::{Reconciliation, ReconciliationKind};
use crate::crd::{DataCenter, Task};
use crate::error::{Error, Result};

/// Every cached datacenter is reconciled again after this delay
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

const LEADERSHIP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let watch_namespace = state.config.watch_namespace.as_deref();
    let datacenters: Api<DataCenter> = watched_api(&client, watch_namespace);
    let tasks: Api<Task> = watched_api(&client, watch_namespace);
    let statefulsets: Api<StatefulSet> = watched_api(&client, watch_namespace);

    info!(
        namespace = watch_namespace.unwrap_or("*"),
        "Starting DataCenter controller"
    );

    // Verify CRDs exist
    for (kind, probe) in [
        ("DataCenter", datacenters.list(&ListParams::default().limit(1)).await.map(|_| ())),
        ("Task", tasks.list(&ListParams::default().limit(1)).await.map(|_| ())),
    ] {
        if let Err(e) = probe {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            return Err(Error::ConfigError(format!("{kind} CRD not installed")));
        }
    }

    while !state.is_leader.load(Ordering::Relaxed) {
        debug!("Waiting for leadership before starting pipelines");
        tokio::time::sleep(LEADERSHIP_POLL_INTERVAL).await;
    }

    let backoff = state.config.watch_backoff;
    let mut datacenter_pipeline = EventPipeline::with_cache(
        KubeAdapter::new(datacenters),
        backoff,
        state.datacenters.clone(),
    );
    let mut task_pipeline =
        EventPipeline::with_cache(KubeAdapter::new(tasks), backoff, state.tasks.clone());
    let mut statefulset_pipeline = EventPipeline::with_cache(
        KubeAdapter::new(statefulsets)
            .with_label_selector(format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")),
        backoff,
        state.statefulsets.clone(),
    );

    tokio::spawn(dispatch_datacenter_events(
        Arc::clone(&state),
        datacenter_pipeline.subscribe(),
    ));
    tokio::spawn(dispatch_task_events(
        Arc::clone(&state),
        task_pipeline.subscribe(),
    ));
    tokio::spawn(dispatch_statefulset_events(
        Arc::clone(&state),
        statefulset_pipeline.subscribe(),
    ));

    let pipelines = [
        datacenter_pipeline.start(),
        task_pipeline.start(),
        statefulset_pipeline.start(),
    ];

    tokio::spawn(
        BackupScheduler::new(
            client,
            state.datacenters.clone(),
            state.config.backup_check_interval,
            Arc::clone(&state.is_leader),
        )
        .run(),
    );
    tokio::spawn(resync(Arc::clone(&state)));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping controller"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
    for pipeline in pipelines {
        pipeline.abort();
    }
    Ok(())
}

fn watched_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn dispatch_datacenter_events(
    state: Arc<ControllerState>,
    mut events: UnboundedReceiver<ResourceEvent<DataCenter>>,
) {
    while let Some(event) = events.recv().await {
        let event_type = event.event_type();
        let Some(dc) = event.resource() else {
            continue;
        };
        if event_type == EventType::Deleted {
            debug!(datacenter = %dc.datacenter_key(), "DataCenter removed from cache");
            continue;
        }
        submit_datacenter(&state, dc, ReconciliationKind::DataCenter, event_type);
    }
}

/// Route StatefulSet changes to the datacenter owning them, through its cluster lane
async fn dispatch_statefulset_events(
    state: Arc<ControllerState>,
    mut events: UnboundedReceiver<ResourceEvent<StatefulSet>>,
) {
    while let Some(event) = events.recv().await {
        let event_type = event.event_type();
        let Some(sts) = event.resource() else {
            continue;
        };
        let labels = sts.labels();
        let (Some(cluster), Some(datacenter)) =
            (labels.get(CLUSTER_LABEL), labels.get(DATACENTER_LABEL))
        else {
            debug!(statefulset = %sts.name_any(), "StatefulSet without datacenter labels");
            continue;
        };
        let namespace = sts.namespace().unwrap_or_else(|| "default".to_string());
        let owner = state.datacenters.values().into_iter().find(|dc| {
            dc.namespace_or_default() == namespace
                && &dc.spec.cluster_name == cluster
                && &dc.spec.datacenter_name == datacenter
        });
        match owner {
            Some(dc) => submit_datacenter(&state, &dc, ReconciliationKind::StatefulSet, event_type),
            None => debug!(
                statefulset = %sts.name_any(),
                cluster = %cluster,
                datacenter = %datacenter,
                "No cached DataCenter owns this StatefulSet"
            ),
        }
    }
}

async fn dispatch_task_events(
    state: Arc<ControllerState>,
    mut events: UnboundedReceiver<ResourceEvent<Task>>,
) {
    while let Some(event) = events.recv().await {
        let event_type = event.event_type();
        let Some(task) = event.resource() else {
            continue;
        };
        if event_type == EventType::Deleted {
            state.task_reconciler.forget(task);
            continue;
        }
        if task.is_terminated() {
            continue;
        }
        if !state.is_leader.load(Ordering::Relaxed) {
            debug!(task = %task.object_key(), "Not the leader, skipping task");
            continue;
        }
        let key = task.object_key();
        let work_state = Arc::clone(&state);
        state.task_queue.submit(
            task.cluster_key(),
            Reconciliation::new(ReconciliationKind::Task, event_type, key.clone(), move || {
                reconcile_task(work_state, key)
            }),
        );
    }
}

fn submit_datacenter(
    state: &Arc<ControllerState>,
    dc: &DataCenter,
    kind: ReconciliationKind,
    event_type: EventType,
) {
    if !state.is_leader.load(Ordering::Relaxed) {
        debug!(datacenter = %dc.datacenter_key(), "Not the leader, skipping reconciliation");
        return;
    }
    let key = dc.object_key();
    let work_state = Arc::clone(state);
    state.reconcile_queue.submit(
        dc.cluster_key(),
        Reconciliation::new(kind, event_type, key.clone(), move || {
            reconcile_datacenter(work_state, key)
        }),
    );
}

async fn resync(state: Arc<ControllerState>) {
    let mut ticker = tokio::time::interval(RESYNC_INTERVAL);
    // The first tick completes immediately, the pipelines already cover startup
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for dc in state.datacenters.values() {
            submit_datacenter(&state, &dc, ReconciliationKind::DataCenter, EventType::Modified);
        }
    }
}

/// Reconcile the cached DataCenter under `key`
///
/// Runs inside the cluster lane of the reconcile queue. Deletion goes
/// through the finalizer so the datacenter leaves keyspace replication
/// before the object disappears.
#[instrument(skip(state), fields(datacenter = %key))]
async fn reconcile_datacenter(state: Arc<ControllerState>, key: String) -> Result<()> {
    let Some(dc) = state.datacenters.get(&key) else {
        debug!("DataCenter no longer cached");
        return Ok(());
    };
    let api: Api<DataCenter> = Api::namespaced(state.client.clone(), &dc.namespace_or_default());
    debug!(
        deleting = is_being_deleted(&dc),
        finalized = has_finalizer(&dc),
        "Reconciling DataCenter"
    );

    let result = finalizer(&api, DATACENTER_FINALIZER, Arc::new(dc), |event| async {
        match event {
            FinalizerEvent::Apply(dc) => apply_datacenter(&state, &api, &dc).await,
            FinalizerEvent::Cleanup(dc) => cleanup_datacenter(&state, &dc).await,
        }
    })
    .await
    .map_err(Error::from);
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!("DataCenter deleted during reconciliation");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn apply_datacenter(
    state: &ControllerState,
    api: &Api<DataCenter>,
    dc: &DataCenter,
) -> Result<Action> {
    let statefulsets = state.datacenter_statefulsets(dc);
    let status = state
        .datacenter_reconciler
        .reconcile(dc, &statefulsets)
        .await;

    if dc.status.as_ref() != Some(&status) {
        let previous = match &dc.status {
            Some(previous) => serde_json::to_value(previous)?,
            None => json!({}),
        };
        let current = serde_json::to_value(&status)?;
        let patch = json!({ "status": status_merge_patch(&previous, &current) });
        api.patch_status(
            &dc.name_any(),
            &PatchParams::apply(MANAGED_BY_VALUE),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
        debug!(phase = %status.phase, "DataCenter status updated");
    }
    Ok(Action::await_change())
}

/// JSON merge patch turning `previous` into `current`.
///
/// Fields left out of `current` are sent as `null` so the server removes
/// them instead of keeping the stored value.
fn status_merge_patch(previous: &Value, current: &Value) -> Value {
    match (previous, current) {
        (Value::Object(previous), Value::Object(current)) => {
            let mut patch = Map::new();
            for (field, value) in current {
                match previous.get(field) {
                    Some(old) if old == value => {}
                    Some(old) => {
                        patch.insert(field.clone(), status_merge_patch(old, value));
                    }
                    None => {
                        patch.insert(field.clone(), value.clone());
                    }
                }
            }
            for field in previous.keys() {
                if !current.contains_key(field) {
                    patch.insert(field.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => current.clone(),
    }
}

async fn cleanup_datacenter(state: &ControllerState, dc: &DataCenter) -> Result<Action> {
    info!(datacenter = %dc.datacenter_key(), "Removing datacenter from the cluster");
    let status = state.datacenter_reconciler.remove_datacenter(dc).await;
    if let Some(message) = status.last_message {
        info!(datacenter = %dc.datacenter_key(), "{}", message);
    }
    Ok(Action::await_change())
}

/// Run the cached Task under `key` unless it already terminated
#[instrument(skip(state), fields(task = %key))]
async fn reconcile_task(state: Arc<ControllerState>, key: String) -> Result<()> {
    let Some(task) = state.tasks.get(&key) else {
        debug!("Task no longer cached");
        return Ok(());
    };
    if task.is_terminated() {
        debug!(phase = %task.phase(), "Task already terminated");
        return Ok(());
    }

    let namespace = task.namespace_or_default();
    let dc = state.datacenters.values().into_iter().find(|dc| {
        dc.namespace_or_default() == namespace
            && dc.spec.cluster_name == task.spec.cluster
            && dc.spec.datacenter_name == task.spec.datacenter
    });

    let phase = state.task_reconciler.reconcile(&task, dc.as_ref()).await?;
    info!(phase = %phase, "Task reconciled");
    Ok(())
}
