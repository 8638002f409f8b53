use std::sync::Arc;

use autoplan_core::{AutoplanError, ParamType, Plan, PlanEvent, Step, ValidationError};
use autoplan_engine::{validate_plan, ExecutionContext, PlanExecutor, StepOutputsCombiner};
use autoplan_tools::{FnTool, ToolRegistry};
use serde_json::json;

fn registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry
        .register(Arc::new(
            FnTool::builder("double")
                .param("x", ParamType::Integer)
                .output(ParamType::Integer)
                .accepts_prior_results()
                .build(|args| async move { Ok(json!(args["x"].as_i64().unwrap_or(0) * 2)) }),
        ))
        .unwrap();
    registry
        .register(Arc::new(
            FnTool::builder("shout")
                .param("text", ParamType::String)
                .optional_param("times", ParamType::Integer)
                .build(|args| async move { Ok(args["text"].clone()) }),
        ))
        .unwrap();
    registry
}

fn validate(steps: Vec<Step>) -> Result<(), ValidationError> {
    validate_plan(&Plan::new("test", steps), &registry())
}

#[test]
fn accepts_backward_references() {
    validate(vec![
        Step::new("double").bind("x", 1),
        Step::new("double").bind_prior_result("x", 0),
        Step::new("double").bind_prior_result("x", 1),
        Step::new("shout").bind("text", "hi").bind("times", serde_json::Value::Null),
    ])
    .unwrap();
}

#[test]
fn rejects_self_reference() {
    let err = validate(vec![
        Step::new("double").bind("x", 1),
        Step::new("double").bind_prior_result("x", 1),
    ])
    .unwrap_err();
    assert_eq!(
        err,
        ValidationError::SelfReference {
            step: 1,
            parameter: "x".to_string()
        }
    );
}

#[test]
fn rejects_forward_reference() {
    let err = validate(vec![
        Step::new("double").bind_prior_result("x", 1),
        Step::new("double").bind("x", 1),
    ])
    .unwrap_err();
    assert!(matches!(err, ValidationError::ForwardReference { step: 0, index: 1, .. }));
}

#[test]
fn rejects_out_of_range_indices() {
    let negative = validate(vec![Step::new("double").bind_prior_result("x", -1)]).unwrap_err();
    assert!(matches!(negative, ValidationError::OutOfRange { index: -1, len: 1, .. }));

    let beyond = validate(vec![
        Step::new("double").bind("x", 1),
        Step::new("double").bind_prior_result("x", 7),
    ])
    .unwrap_err();
    assert!(matches!(beyond, ValidationError::OutOfRange { step: 1, index: 7, .. }));
}

#[test]
fn reference_errors_take_precedence() {
    let err = validate(vec![
        Step::new("missing_tool"),
        Step::new("double").bind_prior_result("x", 1),
    ])
    .unwrap_err();
    assert!(matches!(err, ValidationError::SelfReference { .. }));
}

#[test]
fn rejects_unknown_tool() {
    let err = validate(vec![Step::new("triple").bind("x", 1)]).unwrap_err();
    assert_eq!(err.to_string(), "tool not found: triple (step 0)");
}

#[test]
fn rejects_missing_and_mistyped_parameters() {
    let missing = validate(vec![Step::new("shout").bind("times", 2)]).unwrap_err();
    assert!(matches!(
        missing,
        ValidationError::MissingParameter { step: Some(0), ref parameter, .. } if parameter == "text"
    ));

    let mistyped = validate(vec![Step::new("shout").bind("text", 5)]).unwrap_err();
    assert!(matches!(
        mistyped,
        ValidationError::ArgumentType { step: Some(0), expected: ParamType::String, .. }
    ));

    let unknown = validate(vec![Step::new("shout").bind("text", "a").bind("volume", 11)]).unwrap_err();
    assert!(matches!(unknown, ValidationError::UnknownParameter { .. }));
}

#[test]
fn prior_result_requires_accepting_tool() {
    let err = validate(vec![
        Step::new("shout").bind("text", "a"),
        Step::new("shout").bind_prior_result("text", 0),
    ])
    .unwrap_err();
    assert!(matches!(
        err,
        ValidationError::ArgumentType { step: Some(1), ref found, .. } if found == "prior result reference"
    ));
}

#[tokio::test]
async fn malformed_plan_emits_only_terminal_error() {
    let executor = PlanExecutor::new(
        ExecutionContext::new(registry()),
        Arc::new(StepOutputsCombiner::last()),
    );
    let mut handle = executor.execute(Plan::new(
        "cyclic",
        vec![
            Step::new("double").bind("x", 1),
            Step::new("double").bind_prior_result("x", 2),
            Step::new("double").bind_prior_result("x", 1),
        ],
    ));

    let mut items = Vec::new();
    while let Some(item) = handle.next_event().await {
        items.push(item);
    }
    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(e) => {
            assert!(e.is_plan_validation());
            assert!(matches!(
                e,
                AutoplanError::Validation(ValidationError::ForwardReference { step: 1, .. })
            ));
        }
        Ok(event) => panic!("unexpected event: {}", event.kind()),
    }

    let report = handle.wait().await.unwrap();
    assert!(report.plan.is_none());
    assert!(report.output.is_none());
    assert!(report.error.is_some());
    assert!(report.results.iter().all(|r| !r.status.is_terminal()));
    assert!(!items.iter().any(|i| matches!(i, Ok(PlanEvent::StepResult { .. }))));
}
