mod combiner;
mod context;
mod planner;
mod session;
mod validate;

pub use combiner::{require_succeeded, Combiner, FnCombiner, StepOutputsCombiner};
pub use context::ExecutionContext;
pub use planner::{parse_plan, PlanChunk, PlanStream, Planner, StaticPlanner};
pub use session::{EventStream, PlanExecutor, SessionHandle, SessionReport, StepResults};
pub use validate::validate_plan;
