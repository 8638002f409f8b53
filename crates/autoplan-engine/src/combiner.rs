use async_trait::async_trait;
use autoplan_core::{AutoplanError, Plan, StepResult};
use serde_json::Value;

use crate::ExecutionContext;

/// Builds the caller-visible output once every step is terminal.
///
/// Called at most once per session, with one result per step in index order
/// (Failed and Skipped entries included).
#[async_trait]
pub trait Combiner: Send + Sync {
    async fn combine(
        &self,
        ctx: &ExecutionContext,
        plan: &Plan,
        results: &[StepResult],
    ) -> Result<Value, AutoplanError>;
}

/// Outputs of the steps at `indices`, or `CombinationUnavailable` naming every
/// listed step that did not succeed.
pub fn require_succeeded<'a>(
    results: &'a [StepResult],
    indices: &[usize],
) -> Result<Vec<&'a Value>, AutoplanError> {
    let mut values = Vec::with_capacity(indices.len());
    let mut unavailable = Vec::new();
    for &index in indices {
        match results.get(index).and_then(|r| r.value.as_ref().filter(|_| r.is_succeeded())) {
            Some(value) => values.push(value),
            None => unavailable.push(index),
        }
    }
    if unavailable.is_empty() {
        return Ok(values);
    }
    let listed = unavailable
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(AutoplanError::CombinationUnavailable {
        steps: unavailable,
        reason: format!("step(s) {listed} did not succeed"),
    })
}

#[derive(Debug, Clone)]
enum Selection {
    All,
    Last,
    Indices(Vec<usize>),
}

/// Combines by returning step outputs directly.
#[derive(Debug, Clone)]
pub struct StepOutputsCombiner {
    selection: Selection,
}

impl StepOutputsCombiner {
    /// Output of the final step.
    pub fn last() -> Self {
        Self {
            selection: Selection::Last,
        }
    }

    /// Array of every step's output; every step must have succeeded.
    pub fn all() -> Self {
        Self {
            selection: Selection::All,
        }
    }

    /// Array of the outputs of the given steps.
    pub fn of(indices: Vec<usize>) -> Self {
        Self {
            selection: Selection::Indices(indices),
        }
    }
}

#[async_trait]
impl Combiner for StepOutputsCombiner {
    async fn combine(
        &self,
        _ctx: &ExecutionContext,
        plan: &Plan,
        results: &[StepResult],
    ) -> Result<Value, AutoplanError> {
        match &self.selection {
            Selection::Last => {
                let Some(last) = plan.len().checked_sub(1) else {
                    return Err(AutoplanError::CombinationUnavailable {
                        steps: Vec::new(),
                        reason: "plan has no steps".to_string(),
                    });
                };
                let values = require_succeeded(results, &[last])?;
                Ok(values.into_iter().next().cloned().unwrap_or(Value::Null))
            }
            Selection::All => {
                let indices: Vec<usize> = (0..plan.len()).collect();
                let values = require_succeeded(results, &indices)?;
                Ok(Value::Array(values.into_iter().cloned().collect()))
            }
            Selection::Indices(indices) => {
                let values = require_succeeded(results, indices)?;
                Ok(Value::Array(values.into_iter().cloned().collect()))
            }
        }
    }
}

type CombineFn = dyn Fn(&Plan, &[StepResult]) -> Result<Value, AutoplanError> + Send + Sync;

/// A combiner backed by a synchronous closure.
pub struct FnCombiner {
    func: Box<CombineFn>,
}

impl FnCombiner {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Plan, &[StepResult]) -> Result<Value, AutoplanError> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Combiner for FnCombiner {
    async fn combine(
        &self,
        _ctx: &ExecutionContext,
        plan: &Plan,
        results: &[StepResult],
    ) -> Result<Value, AutoplanError> {
        (self.func)(plan, results)
    }
}
