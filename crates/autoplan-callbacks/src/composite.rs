use std::sync::Arc;

use async_trait::async_trait;
use autoplan_core::{AutoplanError, CallbackHandler, PlanEvent};

/// Forwards each event to several handlers in order.
///
/// A failing handler does not keep the event from the handlers after it.
/// Every failure is collected into a single [`AutoplanError::Callback`].
pub struct CompositeCallback {
    handlers: Vec<Arc<dyn CallbackHandler>>,
}

impl CompositeCallback {
    pub fn new(handlers: Vec<Arc<dyn CallbackHandler>>) -> Self {
        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl CallbackHandler for CompositeCallback {
    async fn on_event(&self, event: PlanEvent) -> Result<(), AutoplanError> {
        let mut failures = Vec::new();
        for (position, handler) in self.handlers.iter().enumerate() {
            if let Err(e) = handler.on_event(event.clone()).await {
                tracing::debug!(handler = position, event = event.kind(), error = %e, "handler failed");
                failures.push(format!("handler {position}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AutoplanError::Callback(format!(
                "{} of {} handlers failed on {}: {}",
                failures.len(),
                self.handlers.len(),
                event.kind(),
                failures.join("; ")
            )))
        }
    }
}
