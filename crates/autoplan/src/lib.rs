//! Autoplan: run planner-produced tool plans.
//!
//! This crate re-exports the Autoplan sub-crates for single-import usage.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `default` | `tools`, `chains`, `engine`, `callbacks` |
//! | `tools` | `ToolRegistry`, `FnTool`, `ToolExecutor` |
//! | `chains` | `chain`, `chain_with_name`, `ChainedTool` |
//! | `engine` | `PlanExecutor`, `Planner`, `Combiner`, `validate_plan` (implies `tools`) |
//! | `callbacks` | `TracingCallback`, `RecordingCallback`, `CompositeCallback` |
//! | `full` | All features enabled |
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use autoplan::core::{ParamType, Plan, Step};
//! use autoplan::engine::{ExecutionContext, PlanExecutor, StepOutputsCombiner};
//! use autoplan::tools::{FnTool, ToolRegistry};
//! ```

/// Core traits and types: Tool, ParameterSchema, Plan, Step, PlanEvent, AutoplanError.
/// Always available.
pub use autoplan_core as core;

/// Tool registry, closure-backed tools and invocation with timeouts.
#[cfg(feature = "tools")]
pub use autoplan_tools as tools;

/// Chained tools with merged parameter schemas.
#[cfg(feature = "chains")]
pub use autoplan_chains as chains;

/// Plan validation, planners, combiners and the concurrent plan executor.
#[cfg(feature = "engine")]
pub use autoplan_engine as engine;

/// Plan event observers.
#[cfg(feature = "callbacks")]
pub use autoplan_callbacks as callbacks;

pub use autoplan_core::{AutoplanError, Plan, PlanEvent, Step, Tool};
