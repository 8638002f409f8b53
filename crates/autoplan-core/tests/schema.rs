use autoplan_core::{ParamType, Parameter, ParameterSchema, ValidationError};
use serde_json::json;

fn add_schema() -> ParameterSchema {
    ParameterSchema::new()
        .with(Parameter::required("a", ParamType::Integer))
        .with(Parameter::required("b", ParamType::Number).with_description("second operand"))
        .with(Parameter::optional("label", ParamType::String))
}

#[test]
fn insert_rejects_duplicate_names() {
    let mut schema = add_schema();
    assert!(!schema.insert(Parameter::optional("a", ParamType::String)));
    assert_eq!(schema.get("a").unwrap().param_type, ParamType::Integer);
    assert!(schema.insert(Parameter::optional("c", ParamType::Any)));
    assert_eq!(schema.len(), 4);
}

#[test]
fn accepts_well_typed_arguments() {
    let schema = add_schema();
    schema
        .validate("add", &json!({"a": 1, "b": 2.5, "label": "x"}))
        .unwrap();
    // integers satisfy number parameters
    schema.validate("add", &json!({"a": 1, "b": 2})).unwrap();
}

#[test]
fn optional_parameter_accepts_null() {
    let schema = add_schema();
    schema
        .validate("add", &json!({"a": 1, "b": 2, "label": null}))
        .unwrap();
}

#[test]
fn required_parameter_rejects_null() {
    let err = add_schema()
        .validate("add", &json!({"a": null, "b": 2}))
        .unwrap_err();
    assert!(matches!(
        err,
        ValidationError::ArgumentType { ref parameter, ref found, .. }
            if parameter == "a" && found == "null"
    ));
}

#[test]
fn missing_required_parameter() {
    let err = add_schema().validate("add", &json!({"a": 1})).unwrap_err();
    assert_eq!(
        err,
        ValidationError::MissingParameter {
            step: None,
            tool: "add".to_string(),
            parameter: "b".to_string(),
        }
    );
}

#[test]
fn type_mismatch_reports_found_type() {
    let err = add_schema()
        .validate("add", &json!({"a": 1.5, "b": 2}))
        .unwrap_err();
    assert_eq!(
        err,
        ValidationError::ArgumentType {
            step: None,
            tool: "add".to_string(),
            parameter: "a".to_string(),
            expected: ParamType::Integer,
            found: "number".to_string(),
        }
    );
}

#[test]
fn undeclared_argument_is_rejected() {
    let err = add_schema()
        .validate("add", &json!({"a": 1, "b": 2, "c": 3}))
        .unwrap_err();
    assert!(matches!(err, ValidationError::UnknownParameter { ref parameter, .. } if parameter == "c"));
}

#[test]
fn non_object_arguments_are_rejected() {
    let err = add_schema().validate("add", &json!([1, 2])).unwrap_err();
    assert!(matches!(
        err,
        ValidationError::ArgumentType { expected: ParamType::Object, .. }
    ));
}

#[test]
fn json_schema_lists_properties_and_required() {
    let schema = add_schema().to_json_schema();
    assert_eq!(schema["type"], "object");
    assert_eq!(schema["properties"]["a"]["type"], "integer");
    assert_eq!(schema["properties"]["b"]["description"], "second operand");
    assert_eq!(schema["required"], json!(["a", "b"]));
}

#[test]
fn step_index_appears_in_message() {
    let err = ValidationError::UnknownTool {
        step: None,
        tool: "nope".to_string(),
    }
    .in_step(3);
    assert_eq!(err.to_string(), "tool not found: nope (step 3)");
}
