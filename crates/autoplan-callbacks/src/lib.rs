mod composite;
mod tracing_cb;

pub use composite::CompositeCallback;
pub use tracing_cb::TracingCallback;

use std::sync::Arc;

use async_trait::async_trait;
use autoplan_core::{AutoplanError, CallbackHandler, PlanEvent, StepResult};
use serde_json::Value;
use tokio::sync::RwLock;

/// Keeps every event it receives, in order.
#[derive(Default, Clone)]
pub struct RecordingCallback {
    events: Arc<RwLock<Vec<PlanEvent>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PlanEvent> {
        self.events.read().await.clone()
    }

    /// Step outcomes in the order they were reported.
    pub async fn step_results(&self) -> Vec<StepResult> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                PlanEvent::StepResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    /// The combined output, once a `FinalResult` has been recorded.
    pub async fn final_output(&self) -> Option<Value> {
        self.events
            .read()
            .await
            .iter()
            .rev()
            .find_map(|event| match event {
                PlanEvent::FinalResult { output, .. } => Some(output.clone()),
                _ => None,
            })
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl CallbackHandler for RecordingCallback {
    async fn on_event(&self, event: PlanEvent) -> Result<(), AutoplanError> {
        self.events.write().await.push(event);
        Ok(())
    }
}
