//! Event pipeline: watch stream + cache + subscriber fan-out
//!
//! Subscribers register before [`EventPipeline::start`], which consumes the
//! pipeline. The cache is updated before an event reaches any subscriber,
//! so a subscriber reading the cache always sees at least that event.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::ResourceCache;
use super::watch::{create_stream, ResourceAdapter, ResourceEvent};

pub struct EventPipeline<A: ResourceAdapter> {
    adapter: Arc<A>,
    cache: ResourceCache<A::Resource>,
    subscribers: Vec<mpsc::UnboundedSender<ResourceEvent<A::Resource>>>,
    backoff: Duration,
}

impl<A: ResourceAdapter> EventPipeline<A> {
    pub fn new(adapter: A, backoff: Duration) -> Self {
        Self::with_cache(adapter, backoff, ResourceCache::new())
    }

    /// Pipeline feeding an existing cache handle
    pub fn with_cache(adapter: A, backoff: Duration, cache: ResourceCache<A::Resource>) -> Self {
        Self {
            adapter: Arc::new(adapter),
            cache,
            subscribers: Vec::new(),
            backoff,
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ResourceEvent<A::Resource>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Handle on the cache, valid after the pipeline is started
    pub fn cache(&self) -> ResourceCache<A::Resource> {
        self.cache.clone()
    }

    pub fn get_from_cache(&self, key: &str) -> Option<A::Resource> {
        self.cache.get(key)
    }

    pub fn start(self) -> JoinHandle<()> {
        let EventPipeline {
            adapter,
            cache,
            mut subscribers,
            backoff,
        } = self;
        let kind = adapter.kind().to_string();
        info!(kind = %kind, subscribers = subscribers.len(), "Starting event pipeline");

        tokio::spawn(async move {
            let mut events = create_stream(adapter, backoff);
            while let Some(event) = events.next().await {
                cache.apply(&event);
                subscribers.retain(|subscriber| {
                    if subscriber.send(event.clone()).is_ok() {
                        true
                    } else {
                        warn!(kind = %kind, "Subscriber closed, removing it from the pipeline");
                        false
                    }
                });
            }
            debug!(kind = %kind, "Event pipeline stopped");
        })
    }
}
