use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoplan_callbacks::RecordingCallback;
use autoplan_chains::chain;
use autoplan_core::{
    AutoplanError, CallbackHandler, ParamType, Plan, PlanEvent, Step, StepStatus, Tool,
};
use autoplan_engine::{
    parse_plan, ExecutionContext, PlanExecutor, Planner, StaticPlanner, StepOutputsCombiner,
};
use autoplan_tools::{FnTool, ToolRegistry};
use serde_json::json;

fn number(name: &str, f: fn(i64) -> i64) -> Arc<dyn Tool> {
    Arc::new(
        FnTool::builder(name)
            .param("x", ParamType::Integer)
            .output(ParamType::Integer)
            .accepts_prior_results()
            .build(move |args| async move { Ok(json!(f(args["x"].as_i64().unwrap_or(0)))) }),
    )
}

fn sleepy(calls: Arc<AtomicUsize>) -> Arc<dyn Tool> {
    Arc::new(
        FnTool::builder("sleepy")
            .optional_param("x", ParamType::Any)
            .accepts_prior_results()
            .build(move |_args| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!("late"))
                }
            }),
    )
}

fn registry(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    registry
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_keeps_finished_results() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = PlanExecutor::new(
        ExecutionContext::new(registry(vec![
            number("inc", |x| x + 1),
            sleepy(Arc::clone(&calls)),
        ])),
        Arc::new(StepOutputsCombiner::all()),
    );
    let mut handle = executor.execute(Plan::new(
        "cancel me",
        vec![
            Step::new("inc").bind("x", 1),
            Step::new("sleepy"),
            Step::new("sleepy").bind_prior_result("x", 1),
        ],
    ));

    let mut items = Vec::new();
    while let Some(item) = handle.next_event().await {
        let first_done = matches!(
            &item,
            Ok(PlanEvent::StepResult { result, .. }) if result.step_index == 0
        );
        items.push(item);
        if first_done {
            handle.cancel();
        }
    }

    assert!(!items
        .iter()
        .any(|i| matches!(i, Ok(PlanEvent::FinalResult { .. }))));
    assert!(matches!(items.last(), Some(Err(AutoplanError::Cancelled(_)))));
    assert_eq!(items.iter().filter(|i| i.is_err()).count(), 1);

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancellation did not interrupt the tool")
        .unwrap();
    assert!(report.cancelled);
    assert!(report.output.is_none());
    assert_eq!(report.results[0].status, StepStatus::Succeeded);
    assert_eq!(report.results[0].value, Some(json!(2)));
    assert_eq!(report.results[1].status, StepStatus::Failed);
    assert_eq!(report.results[2].status, StepStatus::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn planner_partials_precede_the_plan() {
    let plan = parse_plan(
        r#"{
            "rationale": "double then triple",
            "steps": [
                {"rationale": "first", "objective": "double", "tool": "double",
                 "bindings": {"x": {"literal": 2}}},
                {"rationale": "second", "objective": "triple", "tool": "triple",
                 "bindings": {"x": {"priorResultIndex": 0}}}
            ]
        }"#,
    )
    .unwrap();
    let planner = StaticPlanner::new(plan).with_partials(vec![
        json!({"rationale": "double"}),
        json!({"rationale": "double then triple", "steps": [{"tool": "double"}]}),
    ]);
    let executor = PlanExecutor::new(
        ExecutionContext::new(registry(vec![
            number("double", |x| x * 2),
            number("triple", |x| x * 3),
        ])),
        Arc::new(StepOutputsCombiner::last()),
    );

    let mut handle = executor.run(Arc::new(planner));
    let mut kinds = Vec::new();
    while let Some(item) = handle.next_event().await {
        kinds.push(item.unwrap().kind());
    }
    assert_eq!(
        kinds,
        vec![
            "partial_plan_result",
            "partial_plan_result",
            "plan_result",
            "step_result",
            "step_result",
            "final_result"
        ]
    );
    let report = handle.wait().await.unwrap();
    assert_eq!(report.output, Some(json!(12)));
    assert_eq!(report.plan.unwrap().rationale, "double then triple");
}

struct BrokenPlanner;

#[async_trait]
impl Planner for BrokenPlanner {
    async fn plan(&self, _ctx: &ExecutionContext) -> Result<Plan, AutoplanError> {
        Err(AutoplanError::Planner("model returned garbage".to_string()))
    }
}

#[tokio::test]
async fn planner_failure_is_terminal() {
    let executor = PlanExecutor::new(
        ExecutionContext::new(ToolRegistry::new()),
        Arc::new(StepOutputsCombiner::last()),
    );
    let mut handle = executor.run(Arc::new(BrokenPlanner));
    let first = handle.next_event().await;
    assert!(matches!(first, Some(Err(AutoplanError::Planner(_)))));
    assert!(handle.next_event().await.is_none());

    let report = handle.wait().await.unwrap();
    assert!(report.plan.is_none());
    assert!(!report.cancelled);
}

struct StalledPlanner;

#[async_trait]
impl Planner for StalledPlanner {
    async fn plan(&self, _ctx: &ExecutionContext) -> Result<Plan, AutoplanError> {
        std::future::pending::<Result<Plan, AutoplanError>>().await
    }
}

#[tokio::test]
async fn cancellation_during_planning_is_terminal() {
    let executor = PlanExecutor::new(
        ExecutionContext::new(ToolRegistry::new()),
        Arc::new(StepOutputsCombiner::last()),
    );
    let mut handle = executor.run(Arc::new(StalledPlanner));
    handle.cancel();

    let mut items = Vec::new();
    while let Some(item) = handle.next_event().await {
        items.push(item);
    }
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(AutoplanError::Cancelled(_))));

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("planning was not interrupted")
        .unwrap();
    assert!(report.cancelled);
    assert!(report.plan.is_none());
    assert!(report.output.is_none());
}

#[tokio::test]
async fn finish_after_consuming_the_final_result() {
    let executor = PlanExecutor::new(
        ExecutionContext::new(registry(vec![number("inc", |x| x + 1)])),
        Arc::new(StepOutputsCombiner::last()),
    );
    let mut handle = executor.execute(Plan::new("consumed", vec![Step::new("inc").bind("x", 1)]));
    while let Some(item) = handle.next_event().await {
        if matches!(item, Ok(PlanEvent::FinalResult { .. })) {
            break;
        }
    }
    assert_eq!(handle.finish().await.unwrap(), json!(2));
}

#[tokio::test]
async fn finish_after_consuming_the_terminal_error() {
    let executor = PlanExecutor::new(
        ExecutionContext::new(ToolRegistry::new()),
        Arc::new(StepOutputsCombiner::last()),
    );
    let mut handle = executor.run(Arc::new(BrokenPlanner));
    assert!(matches!(
        handle.next_event().await,
        Some(Err(AutoplanError::Planner(_)))
    ));

    let err = handle.finish().await.unwrap_err();
    assert!(matches!(err, AutoplanError::Session(ref message) if message.contains("model returned garbage")));
}

#[test]
fn malformed_plan_text_is_a_parsing_error() {
    let err = parse_plan(r#"{"steps": [{"bindings": {}}]}"#).unwrap_err();
    assert!(matches!(err, AutoplanError::Parsing(_)));
}

#[tokio::test]
async fn chained_tool_runs_as_a_step() {
    let add: Arc<dyn Tool> = Arc::new(
        FnTool::builder("add")
            .param("result", ParamType::Integer)
            .param("y", ParamType::Integer)
            .build(|args| async move {
                Ok(json!(
                    args["result"].as_i64().unwrap_or(0) + args["y"].as_i64().unwrap_or(0)
                ))
            }),
    );
    let double_add: Arc<dyn Tool> = Arc::new(chain(vec![number("double", |x| x * 2), add]).unwrap());
    let executor = PlanExecutor::new(
        ExecutionContext::new(registry(vec![double_add, number("inc", |x| x + 1)])),
        Arc::new(StepOutputsCombiner::last()),
    );

    let output = executor
        .execute(Plan::new(
            "chain inside a plan",
            vec![
                Step::new("inc").bind("x", 0),
                Step::new("DoubleAdd").bind_prior_result("x", 0).bind("y", 2),
            ],
        ))
        .finish()
        .await
        .unwrap();
    assert_eq!(output, json!(4));
}

#[tokio::test]
async fn callback_sees_every_event() {
    let recorder = Arc::new(RecordingCallback::new());
    let executor = PlanExecutor::new(
        ExecutionContext::new(registry(vec![number("inc", |x| x + 1)])),
        Arc::new(StepOutputsCombiner::last()),
    )
    .with_callback(recorder.clone());

    let output = executor
        .execute(Plan::new("observed", vec![Step::new("inc").bind("x", 1)]))
        .finish()
        .await
        .unwrap();
    assert_eq!(output, json!(2));

    let kinds: Vec<_> = recorder.events().await.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["plan_result", "step_result", "final_result"]);
    let results = recorder.step_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value, Some(json!(2)));
    assert_eq!(recorder.final_output().await, Some(json!(2)));
}

struct FailingCallback;

#[async_trait]
impl CallbackHandler for FailingCallback {
    async fn on_event(&self, _event: PlanEvent) -> Result<(), AutoplanError> {
        Err(AutoplanError::Callback("sink unavailable".to_string()))
    }
}

#[tokio::test]
async fn callback_failure_does_not_fail_the_session() {
    let executor = PlanExecutor::new(
        ExecutionContext::new(registry(vec![number("inc", |x| x + 1)])),
        Arc::new(StepOutputsCombiner::last()),
    )
    .with_callback(Arc::new(FailingCallback));

    let output = executor
        .execute(Plan::new("ignored", vec![Step::new("inc").bind("x", 5)]))
        .finish()
        .await
        .unwrap();
    assert_eq!(output, json!(6));
}
