//! Per-cluster serialized work queue
//!
//! Every cluster key owns at most one lane. A lane runs one reconciliation
//! at a time and keeps the requests submitted meanwhile, either all of them
//! in order ([`QueuePolicy::Fifo`]) or only the newest one per object
//! ([`QueuePolicy::LatestWins`]). The lane disappears once it has nothing
//! left to run, so an idle key costs nothing.
//!
//! Lanes of different keys run concurrently, bounded by the queue's worker
//! permits. Failures and panics of a unit of work are logged and counted
//! and never stop the lane.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::metrics;
use super::watch::EventType;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReconciliationKind {
    DataCenter,
    StatefulSet,
    Task,
    /// Plugin-owned deployments such as reaper or kibana
    Deployment,
}

impl std::fmt::Display for ReconciliationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconciliationKind::DataCenter => "DATACENTER",
            ReconciliationKind::StatefulSet => "STATEFULSET",
            ReconciliationKind::Task => "TASK",
            ReconciliationKind::Deployment => "DEPLOYMENT",
        };
        write!(f, "{s}")
    }
}

/// How requests submitted while a key is busy are kept
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum QueuePolicy {
    /// Run every request, oldest first
    Fifo,
    /// Keep only the newest request of each object, in the position of the first
    #[default]
    LatestWins,
}

/// A deferred unit of work for one object, run in the lane of its cluster key
pub struct Reconciliation {
    pub kind: ReconciliationKind,
    pub event_type: EventType,
    /// Object the work reconciles, requests for the same object coalesce
    pub object_key: String,
    pub submitted_at: Instant,
    work: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl Reconciliation {
    pub fn new<F, Fut>(
        kind: ReconciliationKind,
        event_type: EventType,
        object_key: impl Into<String>,
        work: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            kind,
            event_type,
            object_key: object_key.into(),
            submitted_at: Instant::now(),
            work: Box::new(move || work().boxed()),
        }
    }
}

impl std::fmt::Debug for Reconciliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciliation")
            .field("kind", &self.kind)
            .field("event_type", &self.event_type)
            .field("object_key", &self.object_key)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<Reconciliation>,
}

struct QueueInner {
    name: String,
    policy: QueuePolicy,
    lanes: Mutex<HashMap<String, Lane>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, policy: QueuePolicy, workers: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                policy,
                lanes: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers.max(1))),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `reconciliation` now if the key is idle, otherwise queue it behind the ongoing one
    pub fn submit(&self, key: impl Into<String>, reconciliation: Reconciliation) {
        let key = key.into();
        let start = {
            let mut lanes = self.inner.lanes();
            match lanes.get_mut(&key) {
                Some(lane) => {
                    let superseded = match self.inner.policy {
                        QueuePolicy::LatestWins => lane
                            .pending
                            .iter_mut()
                            .find(|r| r.object_key == reconciliation.object_key),
                        QueuePolicy::Fifo => None,
                    };
                    match superseded {
                        Some(slot) => {
                            let dropped = std::mem::replace(slot, reconciliation);
                            debug!(
                                queue = %self.inner.name,
                                cluster = %key,
                                object = %dropped.object_key,
                                kind = %dropped.kind,
                                event = %dropped.event_type,
                                "Superseded pending reconciliation"
                            );
                        }
                        None => lane.pending.push_back(reconciliation),
                    }
                    None
                }
                None => {
                    lanes.insert(key.clone(), Lane::default());
                    Some(reconciliation)
                }
            }
        };
        self.inner.update_gauges();

        if let Some(first) = start {
            tokio::spawn(Arc::clone(&self.inner).drive(key, first));
        }
    }

    /// Requests waiting behind an ongoing reconciliation
    pub fn pending_len(&self) -> usize {
        self.inner.lanes().values().map(|l| l.pending.len()).sum()
    }

    /// Keys with a reconciliation in flight
    pub fn ongoing_len(&self) -> usize {
        self.inner.lanes().len()
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.inner.lanes().contains_key(key)
    }
}

impl QueueInner {
    fn lanes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_gauges(&self) {
        let (pending, ongoing) = {
            let lanes = self.lanes();
            (
                lanes.values().map(|l| l.pending.len()).sum(),
                lanes.len(),
            )
        };
        metrics::set_queue_sizes(&self.name, pending, ongoing);
    }

    /// Run the lane of `key` until it has nothing pending, then remove it
    async fn drive(self: Arc<Self>, key: String, first: Reconciliation) {
        let mut next = Some(first);
        while let Some(reconciliation) = next {
            self.run(&key, reconciliation).await;
            next = {
                let mut lanes = self.lanes();
                match lanes.get_mut(&key).and_then(|l| l.pending.pop_front()) {
                    Some(r) => Some(r),
                    None => {
                        lanes.remove(&key);
                        None
                    }
                }
            };
            self.update_gauges();
        }
    }

    async fn run(&self, key: &str, reconciliation: Reconciliation) {
        let Reconciliation {
            kind,
            event_type,
            object_key,
            submitted_at,
            work,
        } = reconciliation;

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(queue = %self.name, cluster = %key, "Worker pool closed, dropping reconciliation");
                return;
            }
        };

        let started = Instant::now();
        let waited = started.duration_since(submitted_at);
        debug!(
            queue = %self.name,
            cluster = %key,
            object = %object_key,
            kind = %kind,
            event = %event_type,
            waited_ms = waited.as_millis() as u64,
            "Reconciliation started"
        );

        // A separate task turns a panic into a JoinError
        let outcome = tokio::spawn(work()).await;
        let elapsed = started.elapsed();
        metrics::observe_reconcile_duration_seconds(&self.name, elapsed.as_secs_f64());

        match outcome {
            Ok(Ok(())) => info!(
                queue = %self.name,
                cluster = %key,
                object = %object_key,
                kind = %kind,
                event = %event_type,
                duration_ms = elapsed.as_millis() as u64,
                "Reconciliation done"
            ),
            Ok(Err(e)) => {
                metrics::inc_reconcile_error(&self.name, e.metric_kind());
                warn!(
                    queue = %self.name,
                    cluster = %key,
                    object = %object_key,
                    kind = %kind,
                    event = %event_type,
                    waited_ms = waited.as_millis() as u64,
                    duration_ms = elapsed.as_millis() as u64,
                    "Reconciliation failed: {}",
                    e
                );
            }
            Err(e) => {
                metrics::inc_reconcile_error(&self.name, "panic");
                error!(
                    queue = %self.name,
                    cluster = %key,
                    object = %object_key,
                    kind = %kind,
                    event = %event_type,
                    duration_ms = elapsed.as_millis() as u64,
                    "Reconciliation aborted: {}",
                    e
                );
            }
        }
    }
}
