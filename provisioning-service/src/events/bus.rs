use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{DomainEvent, EventBus, EventHandler};

/// In-process transport: a bounded queue drained by [`EventDispatcher`].
#[derive(Clone)]
pub struct InProcessEventBus {
    event_tx: mpsc::Sender<DomainEvent>,
}

impl InProcessEventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (Self { event_tx }, event_rx)
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: DomainEvent) -> Result<(), AppError> {
        let name = event.name();
        let saga_id = event.saga_id();

        self.event_tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::error!(event = %name, saga_id = %saga_id, "Event queue full");
                AppError::InternalError(anyhow::anyhow!("Event queue full"))
            }
            mpsc::error::TrySendError::Closed(_) => {
                tracing::error!(event = %name, saga_id = %saga_id, "Event dispatcher stopped");
                AppError::ServiceUnavailable
            }
        })?;

        tracing::debug!(event = %name, saga_id = %saga_id, "Event published");
        Ok(())
    }
}

/// Fans every queued event out to the handlers subscribed to its name,
/// one task per handler.
pub struct EventDispatcher {
    event_rx: mpsc::Receiver<DomainEvent>,
    handlers: Vec<Arc<dyn EventHandler>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl EventDispatcher {
    pub fn new(event_rx: mpsc::Receiver<DomainEvent>, shutdown: CancellationToken) -> Self {
        Self {
            event_rx,
            handlers: Vec::new(),
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn subscribe(&mut self, handler: Arc<dyn EventHandler>) {
        tracing::info!(
            handler = handler.name(),
            event = %handler.subscribes_to(),
            "Event handler subscribed"
        );
        self.handlers.push(handler);
    }

    /// Runs until shutdown is requested or every publisher is dropped, then
    /// waits for in-flight handlers.
    pub async fn run(mut self) {
        tracing::info!(handlers = self.handlers.len(), "Event dispatcher started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Event dispatcher shutting down");
                    break;
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.dispatch(event),
                        None => {
                            tracing::info!("Event channel closed, dispatcher exiting");
                            break;
                        }
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Event dispatcher stopped");
    }

    fn dispatch(&self, event: DomainEvent) {
        let name = event.name();
        let event = Arc::new(event);
        let mut delivered = 0usize;

        for handler in self
            .handlers
            .iter()
            .filter(|h| h.subscribes_to() == name)
        {
            let handler = handler.clone();
            let event = event.clone();
            delivered += 1;

            self.tracker.spawn(async move {
                tracing::debug!(
                    handler = handler.name(),
                    event = %event.name(),
                    saga_id = %event.saga_id(),
                    "Delivering event"
                );
                handler.handle(&event).await;
            });
        }

        if delivered == 0 {
            tracing::debug!(event = %name, "No handler subscribed to event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AuthIdentityFailed, EventName};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Collect {
        listens: EventName,
        seen: Mutex<Vec<DomainEvent>>,
    }

    #[async_trait]
    impl EventHandler for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        fn subscribes_to(&self) -> EventName {
            self.listens
        }

        async fn handle(&self, event: &DomainEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    fn failed(username: &str) -> DomainEvent {
        DomainEvent::AuthIdentityFailed(AuthIdentityFailed {
            saga_id: Uuid::new_v4(),
            username: username.into(),
        })
    }

    #[tokio::test]
    async fn test_routes_by_event_name() {
        let (bus, rx) = InProcessEventBus::new(8);
        let mut dispatcher = EventDispatcher::new(rx, CancellationToken::new());

        let interested = Arc::new(Collect {
            listens: EventName::AuthIdentityFailed,
            seen: Mutex::new(Vec::new()),
        });
        let other = Arc::new(Collect {
            listens: EventName::UserFailed,
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.subscribe(interested.clone());
        dispatcher.subscribe(other.clone());

        bus.publish(failed("ada@example.com")).await.unwrap();
        drop(bus);
        dispatcher.run().await;

        assert_eq!(interested.seen.lock().unwrap().len(), 1);
        assert!(other.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_publish() {
        let (bus, _rx) = InProcessEventBus::new(1);
        bus.publish(failed("a@example.com")).await.unwrap();

        let err = bus.publish(failed("b@example.com")).await.unwrap_err();
        assert!(err.to_string().contains("Event queue full"));
    }

    #[tokio::test]
    async fn test_publish_after_dispatcher_gone_is_unavailable() {
        let (bus, rx) = InProcessEventBus::new(1);
        drop(rx);

        let err = bus.publish(failed("a@example.com")).await.unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatcher() {
        let (_bus, rx) = InProcessEventBus::new(1);
        let shutdown = CancellationToken::new();
        let dispatcher = EventDispatcher::new(rx, shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), dispatcher.run())
            .await
            .unwrap();
    }
}
