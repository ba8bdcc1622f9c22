use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{DomainEvent, EventBus, EventName};

/// Keeps published events in memory instead of delivering them.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<DomainEvent>>,
    fail_publish: AtomicBool,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later publish fail with `ServiceUnavailable`.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_named(&self, name: EventName) -> Vec<DomainEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: DomainEvent) -> Result<(), AppError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable);
        }

        self.events
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Event log mutex poisoned: {}", e)))?
            .push(event);
        Ok(())
    }
}
