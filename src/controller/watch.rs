//! Watch event source
//!
//! Turns a list+watch API into an endless stream of [`ResourceEvent`]s: a
//! full snapshot tagged [`ResourceEvent::Initial`], then the live tail.
//! Whenever the watch ends or fails the stream starts over from a fresh
//! list instead of resuming at the last resource version, so a long gap or
//! a compacted history can never leave consumers with a partial view.
//! Resources seen before the relist but missing from the fresh list are
//! reported as [`ResourceEvent::Deleted`] once the new snapshot is out.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::metrics;
use crate::error::{Error, Result};

/// Server-side watch timeout, the stream is relisted after it expires
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Initial,
    Added,
    Modified,
    Deleted,
    Error,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Initial => "INITIAL",
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug)]
pub enum ResourceEvent<R> {
    Initial { key: String, resource: R },
    Added { key: String, resource: R },
    Modified { key: String, resource: R },
    Deleted { key: String, resource: R },
    Error { message: String },
}

impl<R> ResourceEvent<R> {
    pub fn event_type(&self) -> EventType {
        match self {
            ResourceEvent::Initial { .. } => EventType::Initial,
            ResourceEvent::Added { .. } => EventType::Added,
            ResourceEvent::Modified { .. } => EventType::Modified,
            ResourceEvent::Deleted { .. } => EventType::Deleted,
            ResourceEvent::Error { .. } => EventType::Error,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ResourceEvent::Initial { key, .. }
            | ResourceEvent::Added { key, .. }
            | ResourceEvent::Modified { key, .. }
            | ResourceEvent::Deleted { key, .. } => Some(key),
            ResourceEvent::Error { .. } => None,
        }
    }

    pub fn resource(&self) -> Option<&R> {
        match self {
            ResourceEvent::Initial { resource, .. }
            | ResourceEvent::Added { resource, .. }
            | ResourceEvent::Modified { resource, .. }
            | ResourceEvent::Deleted { resource, .. } => Some(resource),
            ResourceEvent::Error { .. } => None,
        }
    }
}

pub struct ResourceList<R> {
    pub items: Vec<R>,
    pub resource_version: String,
}

/// Native watch event, before key extraction
#[derive(Clone, Debug)]
pub enum RawWatchEvent<R> {
    Added(R),
    Modified(R),
    Deleted(R),
    /// Resource version checkpoint without payload
    Bookmark(String),
    Error(String),
}

/// List and watch access to one resource kind
#[async_trait]
pub trait ResourceAdapter: Send + Sync + 'static {
    type Resource: Clone + Send + Sync + 'static;

    fn kind(&self) -> &str;

    fn key(&self, resource: &Self::Resource) -> String;

    fn resource_version(&self, resource: &Self::Resource) -> Option<String>;

    async fn list(&self) -> Result<ResourceList<Self::Resource>>;

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<RawWatchEvent<Self::Resource>>>>;
}

enum Phase<R> {
    List {
        after_error: bool,
    },
    Initial {
        items: VecDeque<R>,
        /// Deleted while no watch was running
        vanished: VecDeque<(String, R)>,
        resource_version: String,
    },
    Tail {
        events: BoxStream<'static, Result<RawWatchEvent<R>>>,
        resource_version: String,
    },
}

struct StreamState<A: ResourceAdapter> {
    adapter: Arc<A>,
    backoff: Duration,
    phase: Phase<A::Resource>,
    /// Last state of every resource emitted so far
    known: HashMap<String, A::Resource>,
}

/// Endless list-then-watch stream for the adapter's resource kind
pub fn create_stream<A: ResourceAdapter>(
    adapter: Arc<A>,
    backoff: Duration,
) -> BoxStream<'static, ResourceEvent<A::Resource>> {
    let state = StreamState {
        adapter,
        backoff,
        phase: Phase::List { after_error: false },
        known: HashMap::new(),
    };
    stream::unfold(state, |mut state| async move {
        let event = state.next_event().await;
        Some((event, state))
    })
    .boxed()
}

impl<A: ResourceAdapter> StreamState<A> {
    async fn next_event(&mut self) -> ResourceEvent<A::Resource> {
        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::List { after_error: false });
            match phase {
                Phase::List { after_error } => {
                    if after_error {
                        tokio::time::sleep(self.backoff).await;
                    }
                    match self.adapter.list().await {
                        Ok(list) => {
                            debug!(
                                kind = self.adapter.kind(),
                                items = list.items.len(),
                                "Listed resources at version {}",
                                list.resource_version
                            );
                            let listed: HashMap<String, A::Resource> = list
                                .items
                                .iter()
                                .map(|r| (self.adapter.key(r), r.clone()))
                                .collect();
                            let previous = std::mem::replace(&mut self.known, listed);
                            let vanished = previous
                                .into_iter()
                                .filter(|(key, _)| !self.known.contains_key(key))
                                .collect();
                            self.phase = Phase::Initial {
                                items: list.items.into(),
                                vanished,
                                resource_version: list.resource_version,
                            };
                        }
                        Err(e) => return self.restart(format!("list failed: {e}")),
                    }
                }
                Phase::Initial {
                    mut items,
                    mut vanished,
                    resource_version,
                } => {
                    if let Some(resource) = items.pop_front() {
                        let key = self.adapter.key(&resource);
                        self.phase = Phase::Initial {
                            items,
                            vanished,
                            resource_version,
                        };
                        return ResourceEvent::Initial { key, resource };
                    }
                    if let Some((key, resource)) = vanished.pop_front() {
                        debug!(kind = self.adapter.kind(), key = %key, "Resource gone after relist");
                        self.phase = Phase::Initial {
                            items,
                            vanished,
                            resource_version,
                        };
                        return ResourceEvent::Deleted { key, resource };
                    }
                    match self.adapter.watch(&resource_version).await {
                        Ok(events) => {
                            self.phase = Phase::Tail {
                                events,
                                resource_version,
                            }
                        }
                        Err(e) => return self.restart(format!("watch failed: {e}")),
                    }
                }
                Phase::Tail {
                    mut events,
                    mut resource_version,
                } => {
                    let event = match events.next().await {
                        Some(Ok(RawWatchEvent::Bookmark(version))) => {
                            resource_version = version;
                            None
                        }
                        Some(Ok(RawWatchEvent::Added(resource))) => {
                            Some(self.tag(&mut resource_version, resource, EventType::Added))
                        }
                        Some(Ok(RawWatchEvent::Modified(resource))) => {
                            Some(self.tag(&mut resource_version, resource, EventType::Modified))
                        }
                        Some(Ok(RawWatchEvent::Deleted(resource))) => {
                            Some(self.tag(&mut resource_version, resource, EventType::Deleted))
                        }
                        Some(Ok(RawWatchEvent::Error(message))) => {
                            return self.restart(message);
                        }
                        Some(Err(e)) => return self.restart(e.to_string()),
                        None => {
                            debug!(kind = self.adapter.kind(), "Watch closed, relisting");
                            metrics::inc_watch_restart(self.adapter.kind());
                            continue;
                        }
                    };
                    self.phase = Phase::Tail {
                        events,
                        resource_version,
                    };
                    if let Some(event) = event {
                        return event;
                    }
                }
            }
        }
    }

    fn tag(
        &mut self,
        resource_version: &mut String,
        resource: A::Resource,
        event_type: EventType,
    ) -> ResourceEvent<A::Resource> {
        if let Some(version) = self.adapter.resource_version(&resource) {
            *resource_version = version;
        }
        let key = self.adapter.key(&resource);
        if event_type == EventType::Deleted {
            self.known.remove(&key);
        } else {
            self.known.insert(key.clone(), resource.clone());
        }
        match event_type {
            EventType::Added => ResourceEvent::Added { key, resource },
            EventType::Deleted => ResourceEvent::Deleted { key, resource },
            _ => ResourceEvent::Modified { key, resource },
        }
    }

    /// Schedule a relist after the backoff and surface the error downstream
    fn restart(&mut self, message: String) -> ResourceEvent<A::Resource> {
        warn!(kind = self.adapter.kind(), "Watch stream error: {}", message);
        metrics::inc_watch_restart(self.adapter.kind());
        self.phase = Phase::List { after_error: true };
        ResourceEvent::Error { message }
    }
}

/// [`ResourceAdapter`] over a kube [`Api`]
pub struct KubeAdapter<K> {
    api: Api<K>,
    kind: String,
    label_selector: Option<String>,
}

impl<K> KubeAdapter<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            kind: K::kind(&()).to_string(),
            label_selector: None,
        }
    }

    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    fn list_params(&self) -> ListParams {
        match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }

    fn watch_params(&self) -> WatchParams {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        match &self.label_selector {
            Some(selector) => params.labels(selector),
            None => params,
        }
    }
}

#[async_trait]
impl<K> ResourceAdapter for KubeAdapter<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    type Resource = K;

    fn kind(&self) -> &str {
        &self.kind
    }

    fn key(&self, resource: &K) -> String {
        format!(
            "{}/{}",
            resource.namespace().unwrap_or_else(|| "default".to_string()),
            resource.name_any()
        )
    }

    fn resource_version(&self, resource: &K) -> Option<String> {
        resource.resource_version()
    }

    async fn list(&self) -> Result<ResourceList<K>> {
        let list = self.api.list(&self.list_params()).await?;
        Ok(ResourceList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<RawWatchEvent<K>>>> {
        let events = self
            .api
            .watch(&self.watch_params(), resource_version)
            .await?;
        Ok(events
            .map(|event| match event {
                Ok(WatchEvent::Added(o)) => Ok(RawWatchEvent::Added(o)),
                Ok(WatchEvent::Modified(o)) => Ok(RawWatchEvent::Modified(o)),
                Ok(WatchEvent::Deleted(o)) => Ok(RawWatchEvent::Deleted(o)),
                Ok(WatchEvent::Bookmark(b)) => {
                    Ok(RawWatchEvent::Bookmark(b.metadata.resource_version))
                }
                Ok(WatchEvent::Error(e)) => Ok(RawWatchEvent::Error(format!(
                    "{} (code {})",
                    e.message, e.code
                ))),
                Err(e) => Err(Error::KubeError(e)),
            })
            .boxed())
    }
}
