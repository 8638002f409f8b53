use std::sync::Arc;

use autoplan::callbacks::TracingCallback;
use autoplan::chains::chain_with_name;
use autoplan::core::{AutoplanError, ExecutionConfig, ParamType, PlanEvent, Tool};
use autoplan::engine::{ExecutionContext, FnCombiner, PlanExecutor, StaticPlanner};
use autoplan::tools::{FnTool, ToolRegistry};
use serde_json::{json, Value};

const PLAN: &str = r#"{
    "rationale": "Double the first number, add the second, then compare with a fresh product.",
    "steps": [
        {"rationale": "start from 7", "objective": "double it and add 3",
         "tool": "DoubleThenAdd", "bindings": {"x": {"literal": 7}, "y": {"literal": 3}}},
        {"rationale": "independent branch", "objective": "multiply 6 by 4",
         "tool": "multiply", "bindings": {"a": {"literal": 6}, "b": {"literal": 4}}},
        {"rationale": "combine both branches", "objective": "sum the results",
         "tool": "sum", "bindings": {"a": {"priorResultIndex": 0}, "b": {"priorResultIndex": 1}}},
        {"rationale": "this one fails", "objective": "divide by zero",
         "tool": "divide", "bindings": {"a": {"priorResultIndex": 2}, "b": {"literal": 0}}},
        {"rationale": "never runs", "objective": "double the quotient",
         "tool": "double", "bindings": {"x": {"priorResultIndex": 3}}}
    ]
}"#;

fn int(args: &Value, name: &str) -> i64 {
    args[name].as_i64().unwrap_or_default()
}

fn binary(name: &str, description: &str, op: fn(i64, i64) -> Result<i64, AutoplanError>) -> FnTool {
    FnTool::builder(name)
        .description(description)
        .param("a", ParamType::Integer)
        .param("b", ParamType::Integer)
        .output(ParamType::Integer)
        .accepts_prior_results()
        .build(move |args| async move { op(int(&args, "a"), int(&args, "b")).map(|v| json!(v)) })
}

fn tools() -> Result<ToolRegistry, AutoplanError> {
    let double: Arc<dyn Tool> = Arc::new(
        FnTool::builder("double")
            .description("Multiply x by two")
            .param("x", ParamType::Integer)
            .output(ParamType::Integer)
            .accepts_prior_results()
            .build(|args| async move { Ok(json!(int(&args, "x") * 2)) }),
    );
    let add: Arc<dyn Tool> = Arc::new(
        FnTool::builder("add")
            .description("Add y to the previous result")
            .param("result", ParamType::Integer)
            .param("y", ParamType::Integer)
            .output(ParamType::Integer)
            .build(|args| async move { Ok(json!(int(&args, "result") + int(&args, "y"))) }),
    );

    let registry = ToolRegistry::new();
    registry.register(Arc::new(chain_with_name(
        "double_then_add",
        vec![double.clone(), add],
    )?))?;
    registry.register(double)?;
    registry.register(Arc::new(binary("multiply", "Multiply a by b", |a, b| Ok(a * b))))?;
    registry.register(Arc::new(binary("sum", "Add a and b", |a, b| Ok(a + b))))?;
    registry.register(Arc::new(binary("divide", "Divide a by b", |a, b| {
        a.checked_div(b)
            .ok_or_else(|| AutoplanError::Tool(format!("cannot divide {a} by {b}")))
    })))?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), AutoplanError> {
    tracing_subscriber::fmt::init();

    let registry = tools()?;
    println!("=== Tools offered to the planner ===");
    for definition in registry.definitions() {
        println!("  {} {}", definition.name, definition.parameters);
    }

    let planner = StaticPlanner::from_json(PLAN)?.with_partials(vec![
        json!({"rationale": "Double the first number"}),
        json!({"steps": [{"tool": "DoubleThenAdd"}]}),
    ]);
    let ctx = ExecutionContext::new(registry)
        .with_config(ExecutionConfig::default().with_max_concurrency(2));
    let combiner = FnCombiner::new(|_plan, results| {
        let summary: Vec<Value> = results
            .iter()
            .map(|r| json!({"step": r.step_index, "status": r.status, "value": r.value}))
            .collect();
        Ok(json!(summary))
    });
    let executor = PlanExecutor::new(ctx, Arc::new(combiner))
        .with_callback(Arc::new(TracingCallback::new()));

    println!("\n=== Events ===");
    let mut session = executor.run(Arc::new(planner));
    while let Some(item) = session.next_event().await {
        match item {
            Ok(PlanEvent::PartialPlanResult { plan, .. }) => println!("  partial plan: {plan}"),
            Ok(PlanEvent::PlanResult { plan, .. }) => {
                println!("  plan with {} steps: {}", plan.len(), plan.rationale)
            }
            Ok(PlanEvent::StepResult { result, .. }) => println!(
                "  step {} ({}) -> {:?} {}",
                result.step_index,
                result.tool,
                result.status,
                result
                    .value
                    .map(|v| v.to_string())
                    .or(result.error)
                    .unwrap_or_default()
            ),
            Ok(PlanEvent::FinalResult { output, .. }) => println!("  final: {output}"),
            Err(e) => println!("  session failed: {e}"),
        }
    }

    let report = session.wait().await?;
    println!("\nsession {} finished, success = {}", report.session_id, report.is_success());
    Ok(())
}
