use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::{DomainEvent, QueueEventType};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type EventHandler = Arc<dyn Fn(DomainEvent) -> HandlerFuture + Send + Sync>;

type Registry = Arc<RwLock<HashMap<QueueEventType, Vec<(u64, EventHandler)>>>>;

/// In-process typed publish/subscribe bus.
///
/// Publishing never blocks the caller: events go through an unbounded channel
/// drained by a single dispatcher task, so subscribers of one event type see
/// events in publish order. Every handler invocation is wrapped in a
/// catch-log-continue adapter at the dispatch layer; a failing or panicking
/// handler never stops the bus or its peers.
pub struct EventBus {
    registry: Registry,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<DomainEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DomainEvent>();
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));

        let dispatch_registry = Arc::clone(&registry);
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let handlers: Vec<(u64, EventHandler)> = {
                    let guard = dispatch_registry.read().await;
                    guard.get(&event.event_type).cloned().unwrap_or_default()
                };

                for (subscription_id, handler) in handlers {
                    // Run in a separate task so a panic is contained here
                    let invocation = tokio::spawn(handler(event.clone()));
                    match invocation.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(
                                "Handler {} failed for {:?} event {}: {}",
                                subscription_id, event.event_type, event.event_id, e
                            );
                        }
                        Err(e) => {
                            error!(
                                "Handler {} panicked for {:?} event {}: {}",
                                subscription_id, event.event_type, event.event_id, e
                            );
                        }
                    }
                }
            }
            debug!("Event bus dispatcher stopped");
        });

        Arc::new(Self {
            registry,
            next_id: AtomicU64::new(1),
            tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Register a handler for one event type. The returned handle is the only
    /// way to remove the subscription again.
    pub async fn subscribe<F>(&self, event_type: QueueEventType, handler: F) -> SubscriptionHandle
    where
        F: Fn(DomainEvent) -> HandlerFuture + Send + Sync + 'static,
    {
        let subscription_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.registry.write().await;
        guard
            .entry(event_type)
            .or_default()
            .push((subscription_id, Arc::new(handler)));

        debug!("Subscribed handler {} to {:?}", subscription_id, event_type);

        SubscriptionHandle {
            subscription_id,
            event_type,
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn publish(&self, event: DomainEvent) {
        debug!("Publishing {:?} event {}", event.event_type, event.event_id);
        if self.tx.send(event).is_err() {
            warn!("Event bus already shut down, dropping event");
        }
    }

    /// Drop all subscriptions and stop the dispatcher. Intended for process
    /// restarts and test teardown.
    pub async fn shutdown(&self) {
        self.registry.write().await.clear();

        let handle = self.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

pub struct SubscriptionHandle {
    subscription_id: u64,
    event_type: QueueEventType,
    registry: Registry,
}

impl SubscriptionHandle {
    pub async fn unsubscribe(self) {
        let mut guard = self.registry.write().await;
        if let Some(handlers) = guard.get_mut(&self.event_type) {
            handlers.retain(|(id, _)| *id != self.subscription_id);
        }
        debug!(
            "Unsubscribed handler {} from {:?}",
            self.subscription_id, self.event_type
        );
    }
}
