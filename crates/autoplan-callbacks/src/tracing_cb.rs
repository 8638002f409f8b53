use async_trait::async_trait;
use autoplan_core::{AutoplanError, CallbackHandler, PlanEvent, StepStatus};

/// Logs plan events through `tracing`.
pub struct TracingCallback;

impl TracingCallback {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TracingCallback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallbackHandler for TracingCallback {
    async fn on_event(&self, event: PlanEvent) -> Result<(), AutoplanError> {
        match event {
            PlanEvent::PartialPlanResult { session_id, plan } => {
                tracing::debug!(session_id = %session_id, partial = %plan, "partial plan");
            }
            PlanEvent::PlanResult { session_id, plan } => {
                tracing::info!(
                    session_id = %session_id,
                    steps = plan.len(),
                    rationale = %plan.rationale,
                    "plan ready"
                );
            }
            PlanEvent::StepResult { session_id, result } => match result.status {
                StepStatus::Failed => tracing::warn!(
                    session_id = %session_id,
                    step = result.step_index,
                    tool = %result.tool,
                    error = result.error.as_deref().unwrap_or_default(),
                    "step failed"
                ),
                StepStatus::Skipped => tracing::info!(
                    session_id = %session_id,
                    step = result.step_index,
                    tool = %result.tool,
                    dependency = ?result.skipped_because,
                    "step skipped"
                ),
                _ => tracing::info!(
                    session_id = %session_id,
                    step = result.step_index,
                    tool = %result.tool,
                    "step succeeded"
                ),
            },
            PlanEvent::FinalResult { session_id, output } => {
                tracing::info!(session_id = %session_id, output = %output, "final result");
            }
        }
        Ok(())
    }
}
