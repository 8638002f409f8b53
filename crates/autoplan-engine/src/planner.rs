use std::pin::Pin;

use async_trait::async_trait;
use autoplan_core::{AutoplanError, Plan};
use futures::Stream;
use serde_json::Value;

use crate::ExecutionContext;

/// One item of a streamed plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanChunk {
    /// A partially parsed plan, for progress display only.
    Partial(Value),
    /// The finished plan. Nothing is yielded after it.
    Complete(Plan),
}

pub type PlanStream<'a> = Pin<Box<dyn Stream<Item = Result<PlanChunk, AutoplanError>> + Send + 'a>>;

/// Produces the plan for a session. How it does so (prompting a model,
/// replaying a script) is up to the implementation.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, ctx: &ExecutionContext) -> Result<Plan, AutoplanError>;

    /// Stream the plan as it is produced. The default yields the result of
    /// [`plan`](Planner::plan) as a single complete chunk.
    fn stream_plan<'a>(&'a self, ctx: &'a ExecutionContext) -> PlanStream<'a> {
        Box::pin(async_stream::stream! {
            match self.plan(ctx).await {
                Ok(plan) => yield Ok(PlanChunk::Complete(plan)),
                Err(e) => yield Err(e),
            }
        })
    }
}

/// Parse a plan from its JSON exchange format.
pub fn parse_plan(text: &str) -> Result<Plan, AutoplanError> {
    serde_json::from_str(text).map_err(|e| AutoplanError::Parsing(format!("invalid plan: {e}")))
}

/// A planner that always returns the same plan, optionally preceded by
/// scripted partial plans.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    plan: Plan,
    partials: Vec<Value>,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            partials: Vec::new(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, AutoplanError> {
        parse_plan(text).map(Self::new)
    }

    pub fn with_partials(mut self, partials: Vec<Value>) -> Self {
        self.partials = partials;
        self
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _ctx: &ExecutionContext) -> Result<Plan, AutoplanError> {
        Ok(self.plan.clone())
    }

    fn stream_plan<'a>(&'a self, _ctx: &'a ExecutionContext) -> PlanStream<'a> {
        Box::pin(async_stream::stream! {
            for partial in &self.partials {
                yield Ok(PlanChunk::Partial(partial.clone()));
            }
            yield Ok(PlanChunk::Complete(self.plan.clone()));
        })
    }
}
